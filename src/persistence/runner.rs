//! Execution policy for persistence tasks.
//!
//! Cache operations must never fail because of persistence, so every task is
//! run through a [`Runner`] that contains its failure:
//!
//! - `Disabled` is swallowed silently
//! - expected refusals (threshold, not found, ...) are logged at debug
//! - everything else is logged at warn
//!
//! In async mode the task runs on the tokio blocking pool and the caller gets
//! back immediately.

use crate::config::PersistConfig;
use crate::error::Result;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Where persistence tasks run.
#[derive(Debug, Clone)]
pub enum Runner {
    /// On the calling thread.
    Sync,
    /// On the blocking pool of the given runtime.
    Async(Handle),
}

impl Runner {
    /// Picks the mode from the configuration. Async mode needs a tokio
    /// runtime on the current thread; without one tasks run synchronously.
    pub fn from_config(config: &PersistConfig) -> Self {
        if !config.run_async {
            return Runner::Sync;
        }
        match Handle::try_current() {
            Ok(handle) => Runner::Async(handle),
            Err(_) => {
                warn!("Async persistence requested outside a tokio runtime, running synchronously");
                Runner::Sync
            }
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Runner::Async(_))
    }

    /// Runs `task`, logging its failure under `op`.
    ///
    /// Returns the join handle of the spawned task in async mode, `None` once
    /// the task has already completed in sync mode.
    pub fn run<F>(&self, op: &'static str, task: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        match self {
            Runner::Sync => {
                contain(op, task());
                None
            }
            Runner::Async(handle) => Some(handle.spawn_blocking(move || contain(op, task()))),
        }
    }
}

fn contain(op: &'static str, outcome: Result<()>) {
    match outcome {
        Ok(()) => {}
        Err(e) if e.is_disabled() => {}
        Err(e) if e.is_expected() => debug!(op, reason = %e, "Persistence skipped"),
        Err(e) => warn!(op, error = %e, "Persistence task failed"),
    }
}
