//! Distributed context — rank and world size of this process.
//!
//! The transport itself is opaque; the core only needs to know which rank it is
//! so that filesystem side effects happen on rank 0 alone. Without any
//! initialization every process behaves as rank 0 of a world of size 1.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DistributedError;

/// Environment variable holding this process's rank.
pub const RANK_ENV: &str = "RANK";
/// Environment variable holding the number of cooperating processes.
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";

static PROCESS_GROUP: OnceLock<DistContext> = OnceLock::new();

/// Rank and world size of this process within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DistContext {
    rank: usize,
    world_size: usize,
}

impl DistContext {
    /// Single-process context: rank 0 of 1.
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn new(rank: usize, world_size: usize) -> Result<Self, DistributedError> {
        if world_size == 0 {
            return Err(DistributedError::InvalidWorldSize { world_size });
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self { rank, world_size })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Run `f` on rank 0 only.
    ///
    /// Returns `Some` with the closure's value on rank 0. On every other rank the
    /// closure is never called and `None` is returned.
    pub fn run_master_only<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        if self.is_master() { Some(f()) } else { None }
    }
}

impl Default for DistContext {
    fn default() -> Self {
        Self::single()
    }
}

/// Process-group settings. Unset rank/world size fall back to the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistConfig {
    /// Name of the communication backend. Opaque to the core.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            rank: None,
            world_size: None,
        }
    }
}

fn default_backend() -> String {
    "local".to_string()
}

impl DistConfig {
    /// Resolve the context from explicit settings, then `lookup` for the
    /// `RANK`/`WORLD_SIZE` variables, then the single-process defaults.
    pub fn resolve(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<DistContext, DistributedError> {
        let rank = match self.rank {
            Some(rank) => rank,
            None => parse_env(RANK_ENV, &lookup)?.unwrap_or(0),
        };
        let world_size = match self.world_size {
            Some(world_size) => world_size,
            None => parse_env(WORLD_SIZE_ENV, &lookup)?.unwrap_or(1),
        };
        DistContext::new(rank, world_size)
    }
}

fn parse_env(
    var: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<usize>, DistributedError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| DistributedError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })
        })
        .transpose()
}

/// Initialize the process group once for the lifetime of the process.
///
/// A second call fails with [`DistributedError::AlreadyInitialized`], even when
/// the settings are identical.
pub fn init_process_group(config: &DistConfig) -> Result<DistContext, DistributedError> {
    if let Some(existing) = PROCESS_GROUP.get() {
        return Err(already_initialized(existing));
    }
    let ctx = config.resolve(|var| std::env::var(var).ok())?;
    PROCESS_GROUP
        .set(ctx)
        .map_err(|_| already_initialized(&current()))?;
    info!(
        backend = %config.backend,
        rank = ctx.rank,
        world_size = ctx.world_size,
        "Initialized process group"
    );
    Ok(ctx)
}

fn already_initialized(ctx: &DistContext) -> DistributedError {
    DistributedError::AlreadyInitialized {
        rank: ctx.rank,
        world_size: ctx.world_size,
    }
}

/// The initialized process group, or the single-process context.
pub fn current() -> DistContext {
    PROCESS_GROUP.get().copied().unwrap_or_default()
}

pub fn is_initialized() -> bool {
    PROCESS_GROUP.get().is_some()
}
