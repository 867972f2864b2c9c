//! In-memory connectivity engine.
//!
//! [`SimulatedEngine`] reproduces the observable behaviour of the native
//! engine without any networking: handle allocation, session limits, channel
//! gating, timeout-bounded reads and LAN discovery. Inbound device data is
//! injected with [`push_inbound`](SimulatedEngine::push_inbound). Faults can
//! be scripted per primitive and every call is counted, which makes it the
//! workhorse for session-layer tests and UI demos.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::code::{EngineCode, EngineResult};
use crate::engine::ConnectivityEngine;
use crate::lan::LanSearch;
use crate::types::{DeviceUid, SessionId, UID_LEN};

pub const DEFAULT_MAX_SESSIONS: u32 = 16;
pub const MAX_CHANNELS: u8 = 32;
pub const MAX_PACKET_SIZE: usize = 1400;

const VERSION: &str = "1.13.7.0";

/// Engine primitives, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Initialize,
    Deinitialize,
    SetMaxSessions,
    Connect,
    Close,
    Check,
    Read,
    Write,
    ChannelOn,
    ChannelOff,
    Discover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connected,
    /// The remote end went away; reads report why.
    Dropped(EngineCode),
}

#[derive(Debug)]
struct SimSession {
    uid: DeviceUid,
    link: LinkState,
    channels: u32,
    inbound: VecDeque<Vec<u8>>,
}

enum DiscoverySource {
    Scripted {
        records: Vec<String>,
        /// `None` waits out the whole scan window.
        latency: Option<Duration>,
    },
    Lan(LanSearch),
}

struct SimState {
    initialized: bool,
    max_sessions: u32,
    next_session_id: u32,
    sessions: HashMap<SessionId, SimSession>,
    written: Vec<(SessionId, u8, Vec<u8>)>,
    faults: HashMap<EngineOp, VecDeque<EngineCode>>,
    calls: HashMap<EngineOp, usize>,
    discovery: DiscoverySource,
    connect_latency: Duration,
}

impl SimState {
    fn record(&mut self, op: EngineOp) -> EngineResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn ensure_initialized(&self) -> EngineResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(EngineCode::NOT_INITIALIZED)
        }
    }

    fn connected(&mut self, session: SessionId) -> EngineResult<&mut SimSession> {
        match self.sessions.get_mut(&session) {
            Some(s) if s.link == LinkState::Connected => Ok(s),
            _ => Err(EngineCode::INVALID_SID),
        }
    }
}

/// A connectivity engine that lives entirely in memory.
pub struct SimulatedEngine {
    state: Mutex<SimState>,
    inbound_ready: Notify,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                initialized: false,
                max_sessions: DEFAULT_MAX_SESSIONS,
                next_session_id: 1,
                sessions: HashMap::new(),
                written: Vec::new(),
                faults: HashMap::new(),
                connect_latency: Duration::ZERO,
                calls: HashMap::new(),
                discovery: DiscoverySource::Scripted {
                    records: Vec::new(),
                    latency: None,
                },
            }),
            inbound_ready: Notify::new(),
        }
    }

    /// Answer discovery with a real multicast search instead of scripted records.
    pub fn with_lan_discovery(self, search: LanSearch) -> Self {
        self.state.lock().discovery = DiscoverySource::Lan(search);
        self
    }

    /// Handle the next successful connect will return. Later handles count up
    /// from there.
    pub fn set_next_session_id(&self, id: u32) {
        self.state.lock().next_session_id = id;
    }

    /// Records returned by the next scans. With `latency` of `None` the scan
    /// takes its full timeout, like a real broadcast window.
    pub fn set_discovery_records(&self, records: Vec<String>, latency: Option<Duration>) {
        self.state.lock().discovery = DiscoverySource::Scripted { records, latency };
    }

    /// Delay every connect by `latency` before it takes effect.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    /// Make the next call of `op` fail with `code`. Calls queue up.
    pub fn fail_next(&self, op: EngineOp, code: EngineCode) {
        self.state.lock().faults.entry(op).or_default().push_back(code);
    }

    /// How many times `op` was invoked.
    pub fn calls(&self, op: EngineOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Number of sessions the engine still holds open.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn session_uid(&self, session: SessionId) -> Option<DeviceUid> {
        self.state.lock().sessions.get(&session).map(|s| s.uid.clone())
    }

    /// Queue data as if the device had sent it. Returns `false` for unknown
    /// sessions.
    pub fn push_inbound(&self, session: SessionId, data: impl Into<Vec<u8>>) -> bool {
        let queued = match self.state.lock().sessions.get_mut(&session) {
            Some(s) => {
                s.inbound.push_back(data.into());
                true
            }
            None => false,
        };
        if queued {
            self.inbound_ready.notify_waiters();
        }
        queued
    }

    /// Simulate the device dropping the session. Pending and future reads
    /// fail with `reason`.
    pub fn drop_remote(&self, session: SessionId, reason: EngineCode) {
        if let Some(s) = self.state.lock().sessions.get_mut(&session) {
            s.link = LinkState::Dropped(reason);
        }
        self.inbound_ready.notify_waiters();
    }

    /// Everything written to `session`, as `(channel, payload)` pairs.
    pub fn written(&self, session: SessionId) -> Vec<(u8, Vec<u8>)> {
        self.state
            .lock()
            .written
            .iter()
            .filter(|(sid, _, _)| *sid == session)
            .map(|(_, ch, data)| (*ch, data.clone()))
            .collect()
    }

    fn try_read(&self, session: SessionId, max_bytes: usize) -> EngineResult<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        state.ensure_initialized()?;
        let s = state
            .sessions
            .get_mut(&session)
            .ok_or(EngineCode::INVALID_SID)?;
        if let LinkState::Dropped(reason) = s.link {
            return Err(reason);
        }
        let Some(mut chunk) = s.inbound.pop_front() else {
            return Ok(None);
        };
        if chunk.len() > max_bytes {
            let rest = chunk.split_off(max_bytes);
            s.inbound.push_front(rest);
        }
        Ok(Some(chunk))
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectivityEngine for SimulatedEngine {
    async fn initialize(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOp::Initialize)?;
        if state.initialized {
            return Err(EngineCode::ALREADY_INITIALIZED);
        }
        state.initialized = true;
        Ok(())
    }

    async fn deinitialize(&self) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            state.record(EngineOp::Deinitialize)?;
            state.ensure_initialized()?;
            state.sessions.clear();
            state.initialized = false;
        }
        self.inbound_ready.notify_waiters();
        Ok(())
    }

    async fn set_max_sessions(&self, max: u32) -> EngineResult<u32> {
        let mut state = self.state.lock();
        state.record(EngineOp::SetMaxSessions)?;
        if state.initialized {
            return Err(EngineCode::ALREADY_INITIALIZED);
        }
        state.max_sessions = max;
        Ok(max)
    }

    fn version(&self) -> String {
        VERSION.to_string()
    }

    async fn connect_by_uid(&self, uid: &DeviceUid) -> EngineResult<SessionId> {
        let latency = self.state.lock().connect_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.record(EngineOp::Connect)?;
        if uid.as_str().chars().count() != UID_LEN {
            return Err(EngineCode::INVALID_ARG);
        }
        state.ensure_initialized()?;
        if state.sessions.len() >= state.max_sessions as usize {
            return Err(EngineCode::EXCEED_MAX_SESSION);
        }
        let id = SessionId(state.next_session_id);
        state.next_session_id = state.next_session_id.wrapping_add(1);
        state.sessions.insert(
            id,
            SimSession {
                uid: uid.clone(),
                link: LinkState::Connected,
                channels: 0,
                inbound: VecDeque::new(),
            },
        );
        debug!("Simulated session {id} opened for {uid}");
        Ok(id)
    }

    async fn session_close(&self, session: SessionId) -> EngineResult<()> {
        {
            let mut state = self.state.lock();
            state.record(EngineOp::Close)?;
            state.ensure_initialized()?;
            state
                .sessions
                .remove(&session)
                .ok_or(EngineCode::INVALID_SID)?;
        }
        self.inbound_ready.notify_waiters();
        Ok(())
    }

    async fn session_check(&self, session: SessionId) -> bool {
        let mut state = self.state.lock();
        if state.record(EngineOp::Check).is_err() || !state.initialized {
            return false;
        }
        state.connected(session).is_ok()
    }

    async fn session_read(
        &self,
        session: SessionId,
        max_bytes: usize,
        timeout: Duration,
    ) -> EngineResult<Vec<u8>> {
        if max_bytes == 0 {
            return Err(EngineCode::INVALID_ARG);
        }
        self.state.lock().record(EngineOp::Read)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.try_read(session, max_bytes)? {
                return Ok(chunk);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn session_write(
        &self,
        session: SessionId,
        data: &[u8],
        channel: u8,
    ) -> EngineResult<usize> {
        let mut state = self.state.lock();
        state.record(EngineOp::Write)?;
        if data.is_empty() || data.len() > MAX_PACKET_SIZE || channel >= MAX_CHANNELS {
            return Err(EngineCode::INVALID_ARG);
        }
        state.ensure_initialized()?;
        let s = state.connected(session)?;
        if s.channels & (1 << channel) == 0 {
            return Err(EngineCode::CH_NOT_ON);
        }
        state.written.push((session, channel, data.to_vec()));
        Ok(data.len())
    }

    async fn channel_on(&self, session: SessionId, channel: u8) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOp::ChannelOn)?;
        if channel >= MAX_CHANNELS {
            return Err(EngineCode::INVALID_ARG);
        }
        state.ensure_initialized()?;
        state.connected(session)?.channels |= 1 << channel;
        Ok(())
    }

    async fn channel_off(&self, session: SessionId, channel: u8) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.record(EngineOp::ChannelOff)?;
        if channel >= MAX_CHANNELS {
            return Err(EngineCode::INVALID_ARG);
        }
        state.ensure_initialized()?;
        state.connected(session)?.channels &= !(1 << channel);
        Ok(())
    }

    async fn discover_lan(&self, timeout: Duration) -> Vec<String> {
        let (records, wait, search) = {
            let mut state = self.state.lock();
            let _ = state.record(EngineOp::Discover);
            match &state.discovery {
                DiscoverySource::Scripted { records, latency } => {
                    let wait = latency.map_or(timeout, |l| l.min(timeout));
                    (records.clone(), wait, None)
                }
                DiscoverySource::Lan(search) => (Vec::new(), Duration::ZERO, Some(search.clone())),
            }
        };
        if let Some(search) = search {
            return search.search(timeout).await;
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        records
    }
}
