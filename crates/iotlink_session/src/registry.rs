//! Session registry: the single source of truth for live sessions.
//!
//! Pure in-memory bookkeeping behind one mutex. The manager and stream
//! readers both consult it, so every method takes `&self` and returns owned
//! snapshots rather than references into the map.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use iotlink_engine::{DeviceUid, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RegistryError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Rendezvous in progress.
    Connecting,
    /// Open and usable.
    Connected,
    /// Close requested; readers must stop.
    Closing,
    /// Torn down.
    Closed,
}

/// Whether a channel accepts reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Off,
    On,
}

/// A snapshot of one logical connection to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub uid: DeviceUid,
    pub state: SessionState,
    /// Only channels that were explicitly turned on at some point.
    pub channels: BTreeMap<u8, ChannelState>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// State of `channel`; channels never turned on are `Off`.
    pub fn channel(&self, channel: u8) -> ChannelState {
        self.channels.get(&channel).copied().unwrap_or_default()
    }

    /// Bitmap with bit `n` set when channel `n` is on. Channel indices are
    /// always below [`MAX_CHANNELS`], so every channel has a bit.
    pub fn channel_bitmap(&self) -> u32 {
        self.channels
            .iter()
            .filter(|(_, state)| **state == ChannelState::On)
            .fold(0u32, |bits, (ch, _)| bits | (1u32 << ch))
    }
}

/// Highest channel count a session can carry; one bit per channel in
/// [`Session::channel_bitmap`].
pub const MAX_CHANNELS: u8 = 32;

/// Registry of open sessions, keyed by engine handle.
#[derive(Debug)]
pub struct SessionRegistry {
    max_channels: u8,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    /// Track sessions with channels `0..max_channels`. Counts above
    /// [`MAX_CHANNELS`] are clamped.
    pub fn new(max_channels: u8) -> Self {
        if max_channels > MAX_CHANNELS {
            warn!("max_channels {max_channels} exceeds {MAX_CHANNELS}, clamping");
        }
        Self {
            max_channels: max_channels.min(MAX_CHANNELS),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_channels(&self) -> u8 {
        self.max_channels
    }

    /// Track a freshly connected session.
    pub fn register(&self, id: SessionId, uid: DeviceUid) -> Result<Session, RegistryError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        let now = Utc::now();
        let session = Session {
            id,
            uid,
            state: SessionState::Connected,
            channels: BTreeMap::new(),
            connected_at: now,
            last_activity: now,
        };
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    /// Whether `id` is tracked and still `Connected`.
    pub fn is_live(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_some_and(|s| s.state == SessionState::Connected)
    }

    pub fn list(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.sessions.lock().values().cloned().collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn check_channel(&self, channel: u8) -> Result<(), RegistryError> {
        if channel >= self.max_channels {
            return Err(RegistryError::InvalidChannel {
                channel,
                max: self.max_channels,
            });
        }
        Ok(())
    }

    /// Record a channel on/off that the engine has already accepted.
    pub fn set_channel(&self, id: SessionId, channel: u8, on: bool) -> Result<(), RegistryError> {
        self.check_channel(channel)?;
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        if on {
            session.channels.insert(channel, ChannelState::On);
        } else if let Some(state) = session.channels.get_mut(&channel) {
            *state = ChannelState::Off;
        }
        session.last_activity = Utc::now();
        Ok(())
    }

    pub fn channel_state(&self, id: SessionId, channel: u8) -> Result<ChannelState, RegistryError> {
        self.check_channel(channel)?;
        self.sessions
            .lock()
            .get(&id)
            .map(|s| s.channel(channel))
            .ok_or(RegistryError::UnknownSession(id))
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        session.state = state;
        Ok(())
    }

    /// Move a session to `Closing`. Returns the snapshot only for the caller
    /// that made the transition, so concurrent closes tear down once.
    pub fn begin_close(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id)?;
        if matches!(session.state, SessionState::Closing | SessionState::Closed) {
            return None;
        }
        session.state = SessionState::Closing;
        Some(session.clone())
    }

    /// Update the activity timestamp after successful I/O.
    pub fn touch(&self, id: SessionId) {
        if let Some(session) = self.sessions.lock().get_mut(&id) {
            session.last_activity = Utc::now();
        }
    }

    /// Stop tracking a session. Removing an unknown id is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.sessions.lock().remove(&id).map(|mut s| {
            s.state = SessionState::Closed;
            s
        })
    }

    /// Drop every session, returning them marked `Closed`.
    pub fn clear(&self) -> Vec<Session> {
        let mut drained: Vec<Session> = self
            .sessions
            .lock()
            .drain()
            .map(|(_, mut s)| {
                s.state = SessionState::Closed;
                s
            })
            .collect();
        drained.sort_by_key(|s| s.id);
        drained
    }
}
