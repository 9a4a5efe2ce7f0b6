//! # Runloop Core
//!
//! A hook-driven epoch/iteration runner for iterative training loops.
//! Provides the runner state machine, prioritized lifecycle hooks, best-K
//! checkpoint retention, layered configuration and a rank-aware distributed
//! context.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod factory;
pub mod hooks;
pub mod log_buffer;
pub mod model;
pub mod persistence;
pub mod runner;

// Re-export commonly used types at the crate root.
pub use checkpoint::{
    BestK, CheckpointFile, CheckpointMeta, MetricMode, RetentionDecision, RetentionState,
};
pub use config::{RunConfig, StandardHooksConfig, load_config};
pub use data::{DataSource, ShardedSource};
pub use distributed::{DistConfig, DistContext};
pub use error::{
    CheckpointError, ConfigError, DispatchError, DistributedError, HookError, HookResult,
    RunloopError, RunnerError,
};
pub use factory::{HookFactory, HookSpec};
pub use hooks::{CallbackHook, Hook, HookContext, HookEvent, HookRegistry, Priority};
pub use log_buffer::LogBuffer;
pub use model::{Model, Optimizer};
pub use runner::{BatchOutput, Mode, ResumePoint, Runner, RunnerState, RunnerStatus, Workflow};
