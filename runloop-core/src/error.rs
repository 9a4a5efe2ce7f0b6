//! Error types for the runloop core.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! configuration, distributed setup, hook callbacks, checkpoint I/O and the
//! runner state machine.

use std::path::PathBuf;

use crate::hooks::HookEvent;
use crate::runner::{Mode, RunnerStatus};

/// Top-level error type for the runloop library.
#[derive(Debug, thiserror::Error)]
pub enum RunloopError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Distributed error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// Errors from configuration loading and factory construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },

    #[error("Invalid spec for '{name}': {message}")]
    InvalidSpec { name: String, message: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Errors from distributed process-group setup.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error("Process group already initialized (rank {rank} of {world_size})")]
    AlreadyInitialized { rank: usize, world_size: usize },

    #[error("World size must be at least 1, got {world_size}")]
    InvalidWorldSize { world_size: usize },

    #[error("Rank {rank} out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("Environment variable {var} has invalid value '{value}'")]
    InvalidEnv { var: String, value: String },
}

/// Errors from checkpoint persistence, eviction and best-pointer updates.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to restore {what} from {path}: {source}")]
    Deserialize {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Best pointer would reference unpersisted checkpoint {path}")]
    UnpersistedBest { path: PathBuf },
}

impl CheckpointError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by hook callbacks.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Metric '{name}' not found in log buffer")]
    MissingMetric { name: String },

    #[error("Metric '{name}' has non-comparable value {value}")]
    InvalidMetric { name: String, value: f64 },

    #[error("Hook requires an optimizer but the runner has none")]
    MissingOptimizer,

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

/// A hook failure annotated with the hook and event that produced it.
#[derive(Debug, thiserror::Error)]
#[error("hook '{hook}' failed during {event}: {source}")]
pub struct DispatchError {
    pub hook: String,
    pub event: HookEvent,
    #[source]
    pub source: HookError,
}

/// Errors from the runner state machine.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Hook(#[from] DispatchError),

    #[error("Batch processor failed at epoch {epoch}, iter {iter} ({mode}): {source}")]
    BatchProcessor {
        epoch: usize,
        iter: usize,
        mode: Mode,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot {action} while runner is {status}")]
    InvalidState {
        action: &'static str,
        status: RunnerStatus,
    },
}

/// Result alias for hook callbacks.
pub type HookResult = Result<(), HookError>;
