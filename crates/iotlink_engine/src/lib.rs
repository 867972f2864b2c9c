//! IoTLink Engine: the connectivity engine seam.
//!
//! The session layer talks to remote devices through an opaque NAT-traversal
//! engine. This crate defines that boundary:
//!
//! - **[`ConnectivityEngine`]**: the async primitives (initialize, connect by
//!   UID, session read/write/close, channel on/off, LAN discovery).
//! - **[`EngineCode`]**: the engine's flat signed status codes, kept intact.
//! - **[`SimulatedEngine`]**: an in-memory engine for tests and demos.
//! - **[`LanSearch`]**: a UDP multicast probe producing raw discovery records.

pub mod code;
pub mod engine;
pub mod lan;
pub mod simulated;
pub mod types;

pub use code::{EngineCode, EngineResult};
pub use engine::ConnectivityEngine;
pub use lan::{LanSearch, LanSearchConfig};
pub use simulated::{EngineOp, SimulatedEngine};
pub use types::{DeviceUid, SessionId, UID_LEN, UidError};
