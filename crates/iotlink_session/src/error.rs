//! Session layer error types.

use iotlink_engine::{EngineCode, SessionId};

/// Errors returned by the session layer.
///
/// Validation failures are detected locally before the engine is touched.
/// Engine failures carry the engine's code unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The engine has not been initialized.
    #[error("Engine not initialized")]
    NotInitialized,

    /// The engine is already initialized and the operation needs it not to be.
    #[error("Engine already initialized")]
    AlreadyInitialized,

    /// Malformed UID, empty payload, zero read size or out-of-range channel.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session is not tracked (never opened, closed, or closing).
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The channel was never turned on, or was turned off.
    #[error("Channel {channel} is not on for session {session}")]
    ChannelNotOn { session: SessionId, channel: u8 },

    /// The engine handed out a handle that is still tracked.
    #[error("Session {0} is already registered")]
    DuplicateSession(SessionId),

    /// A stream reader is already running for this session and channel.
    #[error("A reader is already active on session {session} channel {channel}")]
    ReaderActive { session: SessionId, channel: u8 },

    #[error("Connect failed: {code}")]
    ConnectFailed { code: EngineCode },

    #[error("Channel operation failed: {code}")]
    ChannelOpFailed { code: EngineCode },

    #[error("Read failed: {code}")]
    ReadFailed { code: EngineCode },

    #[error("Write failed: {code}")]
    WriteFailed { code: EngineCode },

    /// Another scan is running. Retry once it finishes.
    #[error("A discovery scan is already in progress")]
    ScanAlreadyInProgress,

    #[error("Engine initialization failed: {code}")]
    EngineInitFailed { code: EngineCode },
}

impl LinkError {
    /// The engine code behind this error, for display.
    pub fn code(&self) -> Option<EngineCode> {
        match self {
            Self::ConnectFailed { code }
            | Self::ChannelOpFailed { code }
            | Self::ReadFailed { code }
            | Self::WriteFailed { code }
            | Self::EngineInitFailed { code } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error was raised locally without calling the engine.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::UnknownSession(_)
                | Self::ChannelNotOn { .. }
                | Self::NotInitialized
        )
    }
}

/// Bookkeeping failures inside the session registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Session {0} already exists")]
    AlreadyExists(SessionId),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Channel {channel} exceeds maximum {max}")]
    InvalidChannel { channel: u8, max: u8 },
}

impl From<RegistryError> for LinkError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyExists(id) => Self::DuplicateSession(id),
            RegistryError::UnknownSession(id) => Self::UnknownSession(id),
            RegistryError::InvalidChannel { .. } => Self::InvalidArgument(err.to_string()),
        }
    }
}
