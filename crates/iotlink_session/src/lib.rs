//! IoTLink Session: session and channel lifecycle over a connectivity engine.
//!
//! This crate sits between an application and the opaque NAT-traversal
//! engine from `iotlink_engine`. It tracks which sessions are open, which
//! channels are on, and runs background readers that stream device data to
//! subscribers.
//!
//! # Architecture
//!
//! - **Lifecycle**: explicit engine init/teardown state shared by all parts.
//! - **Registry**: in-memory sessions and channel states behind one lock.
//! - **Manager**: validates every call locally before delegating to the engine.
//! - **Readers**: cancellable per-channel read loops with bounded delivery.
//! - **Discovery**: one-at-a-time LAN scans decoded into device records.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iotlink_engine::SimulatedEngine;
//! use iotlink_session::{LinkConfig, SessionManager};
//!
//! # async fn example() -> Result<(), iotlink_session::LinkError> {
//! let manager = SessionManager::new(Arc::new(SimulatedEngine::new()), LinkConfig::default());
//! manager.initialize().await?;
//!
//! let session = manager.connect("ABCDEFGHIJ1234567890").await?;
//! manager.set_channel(session, 0, true).await?;
//! let mut chunks = manager.subscribe(session, 0)?;
//! manager.write(session, 0, b"hello").await?;
//! while let Some(chunk) = chunks.recv().await {
//!     println!("{} bytes from {}", chunk.data.len(), chunk.session_id);
//! }
//! manager.close(session).await;
//! manager.deinitialize().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod reader;
pub mod registry;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::LinkConfig;
pub use discovery::{DeviceAddress, DiscoveredDevice, DiscoveryCoordinator};
pub use error::{LinkError, RegistryError};
pub use lifecycle::{EngineLifecycle, EngineProcessState};
pub use manager::{InitStatus, SessionManager};
pub use reader::{ChunkHandler, ReaderExit, StreamChunk};
pub use registry::{ChannelState, Session, SessionRegistry, SessionState};
