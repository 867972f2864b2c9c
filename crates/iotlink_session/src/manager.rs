//! Session manager: the public face of the session layer.
//!
//! [`SessionManager`] owns the engine lifecycle, the session registry, the
//! stream readers and the discovery coordinator. Every operation validates
//! against local state before the engine is touched, and every engine
//! failure comes back with its code preserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use iotlink_engine::{ConnectivityEngine, DeviceUid, EngineCode, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::config::LinkConfig;
use crate::discovery::{DiscoveredDevice, DiscoveryCoordinator};
use crate::error::LinkError;
use crate::lifecycle::{EngineLifecycle, EngineProcessState};
use crate::reader::{
    ChunkSource, Consumer, ReaderExit, ReaderHandle, ReaderOptions, StreamChunk, StreamReader,
    reader_signals,
};
use crate::registry::{ChannelState, Session, SessionRegistry, SessionState};

/// Extra time given to the engine beyond a read's own timeout.
const READ_SLACK: Duration = Duration::from_millis(100);

/// Outcome of a successful [`SessionManager::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Initialized,
    /// The engine was already Ready; nothing was done.
    AlreadyInitialized,
}

struct Inner {
    engine: Arc<dyn ConnectivityEngine>,
    config: LinkConfig,
    lifecycle: Arc<EngineLifecycle>,
    registry: SessionRegistry,
    readers: Mutex<HashMap<(SessionId, u8), ReaderHandle>>,
    next_reader_id: AtomicU64,
    max_sessions: Mutex<Option<u32>>,
    discovery: DiscoveryCoordinator,
}

/// Manages engine lifecycle, sessions, channels and stream readers.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn ConnectivityEngine>, config: LinkConfig) -> Self {
        let lifecycle = Arc::new(EngineLifecycle::new());
        let discovery = DiscoveryCoordinator::new(
            Arc::clone(&engine),
            Arc::clone(&lifecycle),
            config.scan_timeout,
        );
        Self {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(config.max_channels),
                max_sessions: Mutex::new(config.max_sessions),
                engine,
                config,
                lifecycle,
                readers: Mutex::new(HashMap::new()),
                next_reader_id: AtomicU64::new(1),
                discovery,
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> EngineProcessState {
        self.inner.lifecycle.state()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lifecycle.is_ready()
    }

    pub fn engine_version(&self) -> String {
        self.inner.engine.version()
    }

    // -----------------------------------------------------------------------
    // Engine lifecycle
    // -----------------------------------------------------------------------

    /// Bring the engine up. Calling this while Ready is a logged no-op.
    pub async fn initialize(&self) -> Result<InitStatus, LinkError> {
        let inner = &self.inner;
        let mut transition = inner.lifecycle.begin().await;
        if transition.current() == EngineProcessState::Ready {
            warn!(op = "initialize", outcome = "already_initialized", "Engine already initialized");
            return Ok(InitStatus::AlreadyInitialized);
        }

        let max_sessions = *inner.max_sessions.lock();
        if let Some(max) = max_sessions {
            match inner.engine.set_max_sessions(max).await {
                Ok(applied) => debug!("Engine session limit set to {applied}"),
                Err(code) => {
                    warn!(code = code.value(), "Engine rejected session limit {max}: {code}")
                }
            }
        }

        match inner.engine.initialize().await {
            Ok(()) => {}
            Err(code) if code == EngineCode::ALREADY_INITIALIZED => {
                warn!(
                    code = code.value(),
                    "Engine reports it was already initialized, adopting it"
                );
            }
            Err(code) => {
                error!(
                    op = "initialize",
                    outcome = "failed",
                    code = code.value(),
                    "Engine initialization failed: {code}"
                );
                return Err(LinkError::EngineInitFailed { code });
            }
        }

        transition.set(EngineProcessState::Ready);
        info!(
            op = "initialize",
            outcome = "ok",
            version = %inner.engine.version(),
            "Connectivity engine initialized"
        );
        Ok(InitStatus::Initialized)
    }

    /// Tear the engine down and forget every session. Handles returned
    /// earlier are invalid afterwards.
    pub async fn deinitialize(&self) {
        let inner = &self.inner;
        let mut transition = inner.lifecycle.begin().await;
        if transition.current() == EngineProcessState::Uninitialized {
            warn!(op = "deinitialize", outcome = "not_initialized", "Engine is not initialized");
            return;
        }
        transition.set(EngineProcessState::Uninitialized);

        for session in inner.registry.list() {
            let _ = inner.registry.set_state(session.id, SessionState::Closing);
        }
        let handles = self.take_readers(|_| true);
        for handle in &handles {
            handle.cancel();
        }

        if let Err(code) = inner.engine.deinitialize().await {
            warn!(code = code.value(), "Engine deinitialize failed: {code}");
        }
        let closed = inner.registry.clear();
        drop(transition);

        self.stop_readers(handles).await;
        info!(
            op = "deinitialize",
            outcome = "ok",
            sessions_closed = closed.len(),
            "Connectivity engine deinitialized"
        );
    }

    /// Session limit to push to the engine on the next initialize.
    pub async fn set_max_sessions(&self, max: u32) -> Result<(), LinkError> {
        if max == 0 {
            return Err(LinkError::InvalidArgument("max sessions must be at least 1".into()));
        }
        let transition = self.inner.lifecycle.begin().await;
        if transition.current() == EngineProcessState::Ready {
            return Err(LinkError::AlreadyInitialized);
        }
        *self.inner.max_sessions.lock() = Some(max);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Open a session to the device with `uid`.
    pub async fn connect(&self, uid: &str) -> Result<SessionId, LinkError> {
        let uid = DeviceUid::parse(uid).map_err(|e| {
            warn!(op = "connect", outcome = "invalid_uid", "Rejected UID: {e}");
            LinkError::InvalidArgument(e.to_string())
        })?;
        self.ensure_ready()?;

        let inner = &self.inner;
        let id = match self.connect_within(&uid).await {
            Ok(id) => id,
            Err(code) => {
                warn!(
                    op = "connect",
                    outcome = "failed",
                    code = code.value(),
                    %uid,
                    "Connect failed: {code}"
                );
                return Err(LinkError::ConnectFailed { code });
            }
        };

        // Registration is serialized against deinitialize so a session
        // never outlives the engine that opened it.
        let transition = inner.lifecycle.begin().await;
        if transition.current() != EngineProcessState::Ready {
            let _ = inner.engine.session_close(id).await;
            return Err(LinkError::NotInitialized);
        }
        match inner.registry.register(id, uid.clone()) {
            Ok(_) => {
                info!(
                    session_id = id.as_u32(),
                    op = "connect",
                    outcome = "ok",
                    %uid,
                    "Session connected"
                );
                Ok(id)
            }
            Err(e) => {
                error!(
                    session_id = id.as_u32(),
                    op = "connect",
                    outcome = "duplicate",
                    "Engine reused a live handle: {e}"
                );
                Err(e.into())
            }
        }
    }

    /// Run the engine connect under `connect_timeout`. The attempt runs on
    /// its own task; if it outlives the timeout and still produces a handle,
    /// that handle is closed when it arrives.
    async fn connect_within(&self, uid: &DeviceUid) -> Result<SessionId, EngineCode> {
        let engine = Arc::clone(&self.inner.engine);
        let target = uid.clone();
        let mut attempt = tokio::spawn(async move { engine.connect_by_uid(&target).await });

        match tokio::time::timeout(self.inner.config.connect_timeout, &mut attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
            Ok(Err(_)) => Err(EngineCode::TIMEOUT),
            Err(_) => {
                let engine = Arc::clone(&self.inner.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = attempt.await {
                        warn!(
                            session_id = late.as_u32(),
                            op = "connect",
                            outcome = "late",
                            "Closing session that connected after the timeout"
                        );
                        let _ = engine.session_close(late).await;
                    }
                });
                Err(EngineCode::TIMEOUT)
            }
        }
    }

    /// Close a session. Returns `false` if it was not open (or already
    /// closing), in which case the engine is not called.
    ///
    /// Local state is always released, even when the engine close fails.
    pub async fn close(&self, id: SessionId) -> bool {
        let inner = &self.inner;
        if inner.registry.begin_close(id).is_none() {
            debug!(
                session_id = id.as_u32(),
                op = "close",
                outcome = "noop",
                "Session not open"
            );
            return false;
        }

        let handles = self.take_readers(|(session, _)| session == id);
        for handle in &handles {
            handle.cancel();
        }

        let outcome = match inner.engine.session_close(id).await {
            Ok(()) => "ok",
            Err(code) => {
                warn!(
                    session_id = id.as_u32(),
                    code = code.value(),
                    "Engine close failed, releasing locally: {code}"
                );
                "engine_error"
            }
        };
        inner.registry.remove(id);
        self.stop_readers(handles).await;

        info!(session_id = id.as_u32(), op = "close", outcome, "Session closed");
        true
    }

    /// Whether the engine still considers the session connected.
    pub async fn is_connected(&self, id: SessionId) -> bool {
        self.is_initialized()
            && self.inner.registry.is_live(id)
            && self.inner.engine.session_check(id).await
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.inner.registry.get(id)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.registry.list()
    }

    // -----------------------------------------------------------------------
    // Channels and I/O
    // -----------------------------------------------------------------------

    /// Turn a channel on or off. An engine failure leaves the previous
    /// state in place.
    ///
    /// Turning a channel off lets its reader finish the read in flight and
    /// deliver it before the reader exits. A reader that does not finish
    /// within one poll plus the shutdown grace is cancelled.
    pub async fn set_channel(
        &self,
        id: SessionId,
        channel: u8,
        on: bool,
    ) -> Result<(), LinkError> {
        self.ensure_ready()?;
        let inner = &self.inner;
        inner.registry.check_channel(channel)?;
        self.live_session(id)?;

        let op = if on { "channel_on" } else { "channel_off" };
        let result = if on {
            inner.engine.channel_on(id, channel).await
        } else {
            inner.engine.channel_off(id, channel).await
        };
        if let Err(code) = result {
            warn!(
                session_id = id.as_u32(),
                op,
                outcome = "failed",
                channel,
                code = code.value(),
                "Channel change failed: {code}"
            );
            return Err(LinkError::ChannelOpFailed { code });
        }

        inner.registry.set_channel(id, channel, on)?;
        if !on {
            let handles = self.take_readers(|key| key == (id, channel));
            self.drain_readers(handles).await;
        }
        info!(
            session_id = id.as_u32(),
            op,
            outcome = "ok",
            channel,
            "Channel updated"
        );
        Ok(())
    }

    pub fn channel_state(&self, id: SessionId, channel: u8) -> Result<ChannelState, LinkError> {
        Ok(self.inner.registry.channel_state(id, channel)?)
    }

    /// Bitmap of the session's On channels.
    pub fn open_channels(&self, id: SessionId) -> Result<u32, LinkError> {
        self.inner
            .registry
            .get(id)
            .map(|s| s.channel_bitmap())
            .ok_or(LinkError::UnknownSession(id))
    }

    /// Lowest channel index that is currently Off.
    pub fn free_channel(&self, id: SessionId) -> Result<Option<u8>, LinkError> {
        let session = self
            .inner
            .registry
            .get(id)
            .ok_or(LinkError::UnknownSession(id))?;
        Ok((0..self.inner.registry.max_channels())
            .find(|ch| session.channel(*ch) == ChannelState::Off))
    }

    /// Send `data` on an On channel. Returns the engine's byte count.
    pub async fn write(
        &self,
        id: SessionId,
        channel: u8,
        data: &[u8],
    ) -> Result<usize, LinkError> {
        if data.is_empty() {
            return Err(LinkError::InvalidArgument("payload is empty".into()));
        }
        self.ensure_ready()?;
        let inner = &self.inner;
        inner.registry.check_channel(channel)?;
        let session = self.live_session(id)?;
        if session.channel(channel) != ChannelState::On {
            return Err(LinkError::ChannelNotOn { session: id, channel });
        }

        match inner.engine.session_write(id, data, channel).await {
            Ok(written) => {
                inner.registry.touch(id);
                trace!(session_id = id.as_u32(), channel, "Wrote {written} bytes");
                Ok(written)
            }
            Err(code) => {
                warn!(
                    session_id = id.as_u32(),
                    op = "write",
                    outcome = "failed",
                    channel,
                    code = code.value(),
                    "Write failed: {code}"
                );
                Err(LinkError::WriteFailed { code })
            }
        }
    }

    /// Read up to `max_bytes`, waiting at most `timeout`. An empty result
    /// means nothing arrived in time.
    pub async fn read(
        &self,
        id: SessionId,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        if max_bytes == 0 {
            return Err(LinkError::InvalidArgument("read size must be non-zero".into()));
        }
        self.ensure_ready()?;
        let inner = &self.inner;
        self.live_session(id)?;

        let read = inner.engine.session_read(id, max_bytes, timeout);
        match tokio::time::timeout(timeout + READ_SLACK, read).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(data)) => {
                if !data.is_empty() {
                    inner.registry.touch(id);
                }
                Ok(data)
            }
            Ok(Err(code)) => {
                debug!(session_id = id.as_u32(), code = code.value(), "Read failed: {code}");
                Err(LinkError::ReadFailed { code })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Start a reader on an On channel and return its bounded queue.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        id: SessionId,
        channel: u8,
    ) -> Result<mpsc::Receiver<StreamChunk>, LinkError> {
        let (tx, rx) = mpsc::channel(self.inner.config.reader_queue_depth.max(1));
        self.spawn_reader(id, channel, Consumer::Queue(tx))?;
        Ok(rx)
    }

    /// Start a reader that hands each chunk to `handler` on the reader task.
    pub fn subscribe_with<F>(&self, id: SessionId, channel: u8, handler: F) -> Result<(), LinkError>
    where
        F: Fn(StreamChunk) + Send + Sync + 'static,
    {
        self.spawn_reader(id, channel, Consumer::Callback(Arc::new(handler)))
    }

    /// Stop the reader on `(id, channel)`. Returns `false` if none was running.
    pub async fn unsubscribe(&self, id: SessionId, channel: u8) -> bool {
        let handles = self.take_readers(|key| key == (id, channel));
        if handles.is_empty() {
            return false;
        }
        self.stop_readers(handles).await;
        info!(
            session_id = id.as_u32(),
            op = "unsubscribe",
            outcome = "ok",
            channel,
            "Reader stopped"
        );
        true
    }

    /// Whether a reader is running on `(id, channel)`.
    pub fn has_reader(&self, id: SessionId, channel: u8) -> bool {
        self.inner
            .readers
            .lock()
            .get(&(id, channel))
            .is_some_and(|h| !h.is_finished())
    }

    fn spawn_reader(
        &self,
        id: SessionId,
        channel: u8,
        consumer: Consumer,
    ) -> Result<(), LinkError> {
        self.ensure_ready()?;
        let inner = &self.inner;
        inner.registry.check_channel(channel)?;
        let session = self.live_session(id)?;
        if session.channel(channel) != ChannelState::On {
            return Err(LinkError::ChannelNotOn { session: id, channel });
        }

        let mut readers = inner.readers.lock();
        readers.retain(|_, handle| !handle.is_finished());
        if readers.contains_key(&(id, channel)) {
            return Err(LinkError::ReaderActive { session: id, channel });
        }

        let reader_id = inner.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let (control, signals) = reader_signals();
        let source = SessionSource {
            inner: Arc::downgrade(&self.inner),
            session: id,
        };
        let options = ReaderOptions {
            max_bytes: inner.config.read_buffer_size.max(1),
            poll_timeout: inner.config.reader_poll_timeout,
        };
        let reader = StreamReader::new(id, channel, source, consumer, options, signals);

        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let exit = reader.run().await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }
                    .reader_finished(id, channel, reader_id, &exit)
                    .await;
            }
            exit
        });
        readers.insert((id, channel), ReaderHandle::new(reader_id, control, task));

        info!(
            session_id = id.as_u32(),
            op = "subscribe",
            outcome = "ok",
            channel,
            reader_id,
            "Reader started"
        );
        Ok(())
    }

    /// Bookkeeping after a reader exits on its own.
    async fn reader_finished(
        &self,
        id: SessionId,
        channel: u8,
        reader_id: u64,
        exit: &ReaderExit,
    ) {
        let owned = {
            let mut readers = self.inner.readers.lock();
            match readers.get(&(id, channel)) {
                Some(handle) if handle.id() == reader_id => {
                    readers.remove(&(id, channel));
                    true
                }
                _ => false,
            }
        };

        match exit {
            ReaderExit::ReadFailed(err) => {
                warn!(
                    session_id = id.as_u32(),
                    op = "reader",
                    outcome = "read_failed",
                    channel,
                    code = ?err.code(),
                    "Reader stopped: {err}"
                );
                if owned && self.inner.config.close_on_reader_failure {
                    self.close(id).await;
                }
            }
            ReaderExit::Faulted(message) => {
                error!(
                    session_id = id.as_u32(),
                    op = "reader",
                    outcome = "faulted",
                    channel,
                    "{message}"
                );
            }
            other => {
                debug!(session_id = id.as_u32(), channel, "Reader exited: {other:?}");
            }
        }
    }

    fn take_readers(&self, mut select: impl FnMut((SessionId, u8)) -> bool) -> Vec<ReaderHandle> {
        let mut readers = self.inner.readers.lock();
        let keys: Vec<(SessionId, u8)> =
            readers.keys().copied().filter(|k| select(*k)).collect();
        keys.into_iter().filter_map(|k| readers.remove(&k)).collect()
    }

    async fn stop_readers(&self, handles: Vec<ReaderHandle>) {
        if handles.is_empty() {
            return;
        }
        let grace = self.inner.config.shutdown_grace;
        join_all(handles.into_iter().map(|h| h.stop(grace))).await;
    }

    async fn drain_readers(&self, handles: Vec<ReaderHandle>) {
        if handles.is_empty() {
            return;
        }
        let config = &self.inner.config;
        let grace = config.shutdown_grace;
        let limit = config.reader_poll_timeout + READ_SLACK + grace;
        join_all(handles.into_iter().map(|h| h.drain(limit, grace))).await;
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub fn discovery(&self) -> &DiscoveryCoordinator {
        &self.inner.discovery
    }

    pub async fn scan(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>, LinkError> {
        self.inner.discovery.scan(timeout).await
    }

    pub async fn scan_default(&self) -> Result<Vec<DiscoveredDevice>, LinkError> {
        self.inner.discovery.scan_default().await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn ensure_ready(&self) -> Result<(), LinkError> {
        if self.inner.lifecycle.is_ready() {
            Ok(())
        } else {
            Err(LinkError::NotInitialized)
        }
    }

    fn live_session(&self, id: SessionId) -> Result<Session, LinkError> {
        self.inner
            .registry
            .get(id)
            .filter(|s| s.state == SessionState::Connected)
            .ok_or(LinkError::UnknownSession(id))
    }
}

/// Reads for a stream reader, routed through the manager's checks.
///
/// Liveness ignores the channel state: a channel turned off drains its
/// reader rather than cutting it short.
struct SessionSource {
    inner: Weak<Inner>,
    session: SessionId,
}

#[async_trait]
impl ChunkSource for SessionSource {
    async fn read_chunk(
        &self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(LinkError::NotInitialized);
        };
        SessionManager { inner }
            .read(self.session, max_bytes, timeout)
            .await
    }

    fn is_live(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner.lifecycle.is_ready() && inner.registry.is_live(self.session)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
