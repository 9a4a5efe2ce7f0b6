//! Checkpoint files: model state, optional optimizer state and metadata.
//!
//! The byte layout is whatever `serde_json` produces for [`CheckpointFile`];
//! nothing else in the crate depends on it.

pub mod retention;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CheckpointError;
use crate::model::{Model, Optimizer};
use crate::persistence;

pub use retention::{BestK, CheckpointRecord, MetricMode, RetentionDecision, RetentionState};

/// File extension of every checkpoint written by this crate.
pub const CHECKPOINT_EXT: &str = "json";

/// Metadata key under which the retention snapshot is stored.
pub const RETENTION_META_KEY: &str = "retention";

/// Keys that user-supplied metadata may not use.
pub const RESERVED_META_KEYS: [&str; 4] = ["epoch", "iter", "created_at", RETENTION_META_KEY];

/// Name of the checkpoint for the 1-based epoch number `epoch`.
pub fn epoch_filename(epoch: usize) -> String {
    format!("epoch_{epoch}.{CHECKPOINT_EXT}")
}

/// Name of the best-checkpoint pointer.
pub fn best_filename() -> String {
    format!("best.{CHECKPOINT_EXT}")
}

/// Metadata stored alongside the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Number of completed epochs.
    pub epoch: usize,
    /// Number of completed train iterations.
    pub iter: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CheckpointMeta {
    pub fn new(epoch: usize, iter: usize) -> Self {
        Self {
            epoch,
            iter,
            created_at: Some(Utc::now()),
            extra: BTreeMap::new(),
        }
    }

    /// The retention snapshot taken when this checkpoint was written, if any.
    pub fn retention(&self) -> Result<Option<RetentionState>, serde_json::Error> {
        self.extra
            .get(RETENTION_META_KEY)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
    }
}

/// On-disk checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub meta: CheckpointMeta,
    pub model: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<Value>,
}

/// Snapshot `model` (and `optimizer`, when given) to `path` atomically.
pub fn save_checkpoint(
    path: &Path,
    model: &dyn Model,
    optimizer: Option<&dyn Optimizer>,
    meta: CheckpointMeta,
) -> Result<(), CheckpointError> {
    let model = model
        .state_dict()
        .map_err(|source| CheckpointError::Serialize {
            what: "model state",
            source,
        })?;
    let optimizer = optimizer
        .map(|opt| opt.state_dict())
        .transpose()
        .map_err(|source| CheckpointError::Serialize {
            what: "optimizer state",
            source,
        })?;
    let file = CheckpointFile {
        meta,
        model,
        optimizer,
    };
    persistence::atomic_write_json(path, &file).map_err(|e| CheckpointError::io("write", path, e))
}

/// Read a checkpoint document from `path`.
pub fn load_checkpoint(path: &Path) -> Result<CheckpointFile, CheckpointError> {
    persistence::load_json(path)
        .map_err(|e| CheckpointError::io("read", path, e))?
        .ok_or_else(|| {
            CheckpointError::io(
                "read",
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
            )
        })
}

/// Atomically repoint `{dir}/best.{ext}` at `filename` inside the same directory.
pub fn repoint_best(dir: &Path, filename: &str) -> Result<PathBuf, CheckpointError> {
    let link = dir.join(best_filename());
    persistence::replace_link(Path::new(filename), &link)
        .map_err(|e| CheckpointError::io("repoint best checkpoint", &link, e))?;
    Ok(link)
}
