//! Engine status codes.
//!
//! The native engine reports every outcome as a flat signed integer: zero
//! means success, negative values are failure classes. [`EngineCode`] keeps
//! the raw value so callers can branch on codes this crate does not name.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A negative status code returned by the connectivity engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineCode(pub i32);

/// Result type for engine primitives.
pub type EngineResult<T> = Result<T, EngineCode>;

impl EngineCode {
    pub const NOT_INITIALIZED: Self = Self(-1);
    pub const ALREADY_INITIALIZED: Self = Self(-2);
    pub const FAIL_RESOLVE_HOSTNAME: Self = Self(-3);
    pub const ALREADY_LISTENING: Self = Self(-4);
    pub const FAIL_CREATE_THREAD: Self = Self(-5);
    pub const FAIL_CREATE_SOCKET: Self = Self(-6);
    pub const FAIL_SOCKET_OPT: Self = Self(-7);
    pub const FAIL_SOCKET_BIND: Self = Self(-8);
    pub const NOT_SUPPORT_RELAY: Self = Self(-9);
    pub const NO_PERMISSION: Self = Self(-10);
    pub const SERVER_NOT_RESPONSE: Self = Self(-11);
    pub const FAIL_GET_LOCAL_IP: Self = Self(-12);
    pub const FAIL_SETUP_RELAY: Self = Self(-13);
    pub const FAIL_CONNECT_SEARCH: Self = Self(-14);
    pub const INVALID_SID: Self = Self(-15);
    pub const EXCEED_MAX_SESSION: Self = Self(-16);
    pub const CAN_NOT_FIND_DEVICE: Self = Self(-17);
    pub const SESSION_CLOSE_BY_REMOTE: Self = Self(-18);
    pub const REMOTE_TIMEOUT_DISCONNECT: Self = Self(-19);
    pub const DEVICE_NOT_LISTENING: Self = Self(-20);
    pub const CH_NOT_ON: Self = Self(-21);
    pub const FAIL_CREATE_MUTEX: Self = Self(-22);
    pub const FAIL_CREATE_SEMAPHORE: Self = Self(-23);
    pub const UNLICENSE: Self = Self(-24);
    pub const NOT_SUPPORT: Self = Self(-25);
    pub const DEVICE_MULTI_LOGIN: Self = Self(-26);
    pub const INVALID_ARG: Self = Self(-27);
    pub const NETWORK_UNREACHABLE: Self = Self(-28);
    pub const FAIL_SETUP_CHANNEL: Self = Self(-29);
    pub const TIMEOUT: Self = Self(-30);

    /// Interpret a raw engine return value: zero and positive values are
    /// success, negative values become an `EngineCode`.
    pub fn check(raw: i64) -> EngineResult<i64> {
        if raw >= 0 {
            Ok(raw)
        } else {
            Err(Self(i32::try_from(raw).unwrap_or(i32::MIN)))
        }
    }

    pub fn value(self) -> i32 {
        self.0
    }

    /// Timeouts are retryable; every other failure ends the operation.
    pub fn is_transient(self) -> bool {
        self == Self::TIMEOUT
    }

    /// Human-readable label for display. Unknown codes get a generic label.
    pub fn describe(self) -> &'static str {
        match self.0 {
            -1 => "engine not initialized",
            -2 => "engine already initialized",
            -3 => "failed to resolve hostname",
            -4 => "already listening",
            -5 => "failed to create thread",
            -6 => "failed to create socket",
            -7 => "failed to set socket option",
            -8 => "failed to bind socket",
            -9 => "relay not supported",
            -10 => "no permission",
            -11 => "server not responding",
            -12 => "failed to get local IP",
            -13 => "failed to set up relay",
            -14 => "failed to connect search",
            -15 => "invalid session id",
            -16 => "session limit exceeded",
            -17 => "device not found",
            -18 => "session closed by remote",
            -19 => "remote timed out",
            -20 => "device not listening",
            -21 => "channel not on",
            -22 => "failed to create mutex",
            -23 => "failed to create semaphore",
            -24 => "unlicensed",
            -25 => "not supported",
            -26 => "device logged in elsewhere",
            -27 => "invalid argument",
            -28 => "network unreachable",
            -29 => "failed to set up channel",
            -30 => "timed out",
            _ => "unknown engine error",
        }
    }
}

impl fmt::Display for EngineCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.describe(), self.0)
    }
}
