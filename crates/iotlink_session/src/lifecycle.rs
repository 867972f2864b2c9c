//! Process-wide engine lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

/// Whether the connectivity engine may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineProcessState {
    Uninitialized,
    Ready,
}

/// Owns the engine's init/teardown state.
///
/// Transitions are serialized through an async mutex held across the engine
/// call, so two concurrent `initialize` calls reach the engine once. Readiness
/// checks go through an atomic and never wait on a transition in flight.
#[derive(Debug)]
pub struct EngineLifecycle {
    transition: Mutex<EngineProcessState>,
    ready: AtomicBool,
}

impl EngineLifecycle {
    pub fn new() -> Self {
        Self {
            transition: Mutex::new(EngineProcessState::Uninitialized),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineProcessState {
        if self.is_ready() {
            EngineProcessState::Ready
        } else {
            EngineProcessState::Uninitialized
        }
    }

    /// Start a transition. Hold the guard across the engine call, then
    /// publish the outcome with [`Transition::set`].
    pub async fn begin(&self) -> Transition<'_> {
        Transition {
            guard: self.transition.lock().await,
            ready: &self.ready,
        }
    }
}

impl Default for EngineLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// An exclusive lifecycle transition in progress.
pub struct Transition<'a> {
    guard: MutexGuard<'a, EngineProcessState>,
    ready: &'a AtomicBool,
}

impl Transition<'_> {
    pub fn current(&self) -> EngineProcessState {
        *self.guard
    }

    pub fn set(&mut self, state: EngineProcessState) {
        *self.guard = state;
        self.ready
            .store(state == EngineProcessState::Ready, Ordering::Release);
    }
}
