//! Stream readers: background loops that pull session data to a consumer.
//!
//! A [`StreamReader`] is bound to one (session, channel) pair. It issues
//! bounded-timeout reads against a [`ChunkSource`] and forwards non-empty
//! chunks, in order, to a bounded queue or a callback. A broadcast shutdown
//! signal preempts both a pending read and a blocked delivery, so stopping
//! never waits on the engine or a slow consumer. A drain request is softer:
//! the reader finishes the read in flight, delivers it, then exits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use iotlink_engine::SessionId;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::LinkError;

/// One delivered block of session data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub session_id: SessionId,
    pub channel: u8,
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Callback consumer for stream data.
pub type ChunkHandler = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// Where a reader delivers its chunks.
pub enum Consumer {
    /// Bounded queue. A full queue blocks the reader instead of dropping data.
    Queue(mpsc::Sender<StreamChunk>),
    /// Invoked inline on the reader task.
    Callback(ChunkHandler),
}

/// Data source a reader pulls from.
#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    /// Read up to `max_bytes`, waiting at most `timeout`. Empty means no data.
    async fn read_chunk(
        &self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError>;

    /// Whether the bound session is still usable.
    fn is_live(&self) -> bool;
}

/// Why a reader stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// Shutdown was signalled (close, deinitialize, unsubscribe).
    Cancelled,
    /// Drain was requested (channel off) and the in-flight read finished.
    Drained,
    /// The session left the registry.
    SessionGone,
    /// The queue receiver was dropped.
    ConsumerClosed,
    /// The engine reported a non-transient read failure.
    ReadFailed(LinkError),
    /// The loop panicked; only this reader is affected.
    Faulted(String),
}

/// Read sizing for a reader.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub max_bytes: usize,
    pub poll_timeout: Duration,
}

/// The reader's side of its stop signals.
pub struct ReaderSignals {
    shutdown: broadcast::Receiver<()>,
    drain: Arc<AtomicBool>,
}

/// The owner's side of a reader's stop signals.
pub struct ReaderControl {
    shutdown: broadcast::Sender<()>,
    drain: Arc<AtomicBool>,
}

/// Create a linked pair of stop signals.
///
/// Shutdown preempts a pending read or delivery. Drain is only checked
/// between iterations, so a read already in flight still delivers its data.
pub fn reader_signals() -> (ReaderControl, ReaderSignals) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let drain = Arc::new(AtomicBool::new(false));
    (
        ReaderControl {
            shutdown: shutdown_tx,
            drain: Arc::clone(&drain),
        },
        ReaderSignals {
            shutdown: shutdown_rx,
            drain,
        },
    )
}

/// A cancellable read loop for one session channel.
pub struct StreamReader<S> {
    session: SessionId,
    channel: u8,
    source: S,
    consumer: Consumer,
    options: ReaderOptions,
    signals: ReaderSignals,
}

impl<S: ChunkSource> StreamReader<S> {
    pub fn new(
        session: SessionId,
        channel: u8,
        source: S,
        consumer: Consumer,
        options: ReaderOptions,
        signals: ReaderSignals,
    ) -> Self {
        Self {
            session,
            channel,
            source,
            consumer,
            options,
            signals,
        }
    }

    /// Run until cancelled, drained or the source fails. Panics inside the
    /// loop are caught and reported as [`ReaderExit::Faulted`].
    pub async fn run(self) -> ReaderExit {
        let session = self.session;
        let channel = self.channel;
        match AssertUnwindSafe(self.read_loop()).catch_unwind().await {
            Ok(exit) => exit,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panic in stream reader: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panic in stream reader: {s}")
                } else {
                    "panic in stream reader".to_string()
                };
                warn!(session_id = session.as_u32(), channel, "{message}");
                ReaderExit::Faulted(message)
            }
        }
    }

    async fn read_loop(mut self) -> ReaderExit {
        debug!(
            session_id = self.session.as_u32(),
            channel = self.channel,
            "Stream reader started"
        );
        loop {
            if self.signals.drain.load(Ordering::Acquire) {
                return ReaderExit::Drained;
            }
            if !self.source.is_live() {
                return ReaderExit::SessionGone;
            }

            let max_bytes = self.options.max_bytes;
            let poll_timeout = self.options.poll_timeout;
            let read = tokio::select! {
                biased;
                _ = self.signals.shutdown.recv() => return ReaderExit::Cancelled,
                result = self.source.read_chunk(max_bytes, poll_timeout) => result,
            };

            let data = match read {
                Ok(data) if data.is_empty() => continue,
                Ok(data) => data,
                Err(LinkError::ReadFailed { code }) if code.is_transient() => {
                    trace!(
                        session_id = self.session.as_u32(),
                        "Transient read failure: {code}"
                    );
                    continue;
                }
                Err(LinkError::UnknownSession(_) | LinkError::NotInitialized) => {
                    return ReaderExit::SessionGone;
                }
                Err(e) => return ReaderExit::ReadFailed(e),
            };

            if self.cancelled() {
                return ReaderExit::Cancelled;
            }
            if !self.source.is_live() {
                return ReaderExit::SessionGone;
            }

            let chunk = StreamChunk {
                session_id: self.session,
                channel: self.channel,
                data,
                received_at: Utc::now(),
            };

            match &self.consumer {
                Consumer::Queue(tx) => {
                    tokio::select! {
                        biased;
                        _ = self.signals.shutdown.recv() => return ReaderExit::Cancelled,
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                return ReaderExit::ConsumerClosed;
                            }
                        }
                    }
                }
                Consumer::Callback(handler) => handler(chunk),
            }
        }
    }

    fn cancelled(&mut self) -> bool {
        !matches!(
            self.signals.shutdown.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

/// Control handle for a spawned reader.
pub struct ReaderHandle {
    id: u64,
    control: ReaderControl,
    task: JoinHandle<ReaderExit>,
}

impl ReaderHandle {
    pub fn new(id: u64, control: ReaderControl, task: JoinHandle<ReaderExit>) -> Self {
        Self { id, control, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the reader to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.control.shutdown.send(());
    }

    /// Cancel and wait up to `grace` for the reader to exit, aborting it if
    /// it does not.
    pub async fn stop(mut self, grace: Duration) -> ReaderExit {
        self.cancel();
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => ReaderExit::Faulted(format!("reader task failed: {e}")),
            Err(_) => {
                warn!(
                    "Stream reader {} did not stop within {grace:?}, aborting",
                    self.id
                );
                self.task.abort();
                ReaderExit::Cancelled
            }
        }
    }

    /// Let the in-flight read finish and deliver, then stop. Falls back to
    /// [`stop`](Self::stop) with `grace` if the reader is still running
    /// after `limit`.
    pub async fn drain(mut self, limit: Duration, grace: Duration) -> ReaderExit {
        self.control.drain.store(true, Ordering::Release);
        match tokio::time::timeout(limit, &mut self.task).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => ReaderExit::Faulted(format!("reader task failed: {e}")),
            Err(_) => {
                debug!("Stream reader {} still busy after {limit:?}, cancelling", self.id);
                self.stop(grace).await
            }
        }
    }
}
