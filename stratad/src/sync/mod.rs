//! Mirroring between a local directory and a backend path or filter view.

pub mod backoff;
mod diff;
mod engine;
mod local;
pub mod local_watcher;
mod plan;
mod state;
mod supervisor;
mod worker;

use thiserror::Error;

use crate::filter::FilterError;
use crate::registry::RegistryError;
use crate::resolver::ResolveError;
use crate::store::StoreError;
use strata_core::StorageError;

pub use engine::{RunSummary, SyncEngine, SyncSpec};
pub use plan::{RemoteEndpoint, SyncPlan, parse_local_path};
pub(crate) use worker::is_md5_hex;
pub use state::{InvalidTransition, PhaseEvent, next_phase};
pub use supervisor::{SupervisorConfig, SupervisorStatus, SyncSupervisor};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid ignore pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error("sync config '{0}' not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("sync run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transient storage failures are retried with backoff; nothing else is.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Storage(err) => err.is_retryable(),
            EngineError::Registry(RegistryError::Storage(err)) => err.is_retryable(),
            _ => false,
        }
    }

    /// Failures that abort the whole batch instead of a single job.
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_) | EngineError::Registry(RegistryError::Store(_))
        )
    }
}
