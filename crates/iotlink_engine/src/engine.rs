//! The connectivity engine capability.

use std::time::Duration;

use async_trait::async_trait;

use crate::code::EngineResult;
use crate::types::{DeviceUid, SessionId};

/// The primitives the session layer needs from a NAT-traversal engine.
///
/// Implementations wrap a native library (or simulate one). Every failure is
/// reported as an [`EngineCode`](crate::EngineCode); the session layer never
/// interprets the wire protocol itself.
#[async_trait]
pub trait ConnectivityEngine: Send + Sync {
    /// Bring up the engine. Must be called before any other primitive.
    async fn initialize(&self) -> EngineResult<()>;

    /// Tear down the engine and every session it still holds.
    async fn deinitialize(&self) -> EngineResult<()>;

    /// Limit the number of concurrent sessions. Only valid before `initialize`.
    async fn set_max_sessions(&self, max: u32) -> EngineResult<u32>;

    /// Library version string, for logging.
    fn version(&self) -> String;

    /// Rendezvous with the device identified by `uid`.
    async fn connect_by_uid(&self, uid: &DeviceUid) -> EngineResult<SessionId>;

    async fn session_close(&self, session: SessionId) -> EngineResult<()>;

    /// Whether the engine still considers the session connected.
    async fn session_check(&self, session: SessionId) -> bool;

    /// Read up to `max_bytes`, waiting at most `timeout`. An empty buffer
    /// means the timeout elapsed with no data.
    async fn session_read(
        &self,
        session: SessionId,
        max_bytes: usize,
        timeout: Duration,
    ) -> EngineResult<Vec<u8>>;

    /// Write `data` on `channel`, returning the number of bytes accepted.
    async fn session_write(
        &self,
        session: SessionId,
        data: &[u8],
        channel: u8,
    ) -> EngineResult<usize>;

    async fn channel_on(&self, session: SessionId, channel: u8) -> EngineResult<()>;

    async fn channel_off(&self, session: SessionId, channel: u8) -> EngineResult<()>;

    /// Probe the local network for `timeout` and return raw device records.
    async fn discover_lan(&self, timeout: Duration) -> Vec<String>;
}
