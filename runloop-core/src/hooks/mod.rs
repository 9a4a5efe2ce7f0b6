//! Hook system — ten lifecycle points driven by the runner.
//!
//! A hook implements any subset of the callbacks; the rest default to no-ops.
//! Hooks are ordered by [`Priority`] and, within equal priority, by the order
//! they were registered.

pub mod callback;
pub mod checkpoint;
pub mod logger;
pub mod lr;
pub mod optimizer;
pub mod registry;
pub mod sampler_seed;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::HookResult;
use crate::model::{Model, Optimizer};
use crate::runner::RunnerState;

pub use callback::CallbackHook;
pub use checkpoint::{CheckpointConfig, CheckpointHook};
pub use logger::{LogConfig, TextLoggerHook};
pub use lr::{LrConfig, LrPolicy, LrSchedulerHook};
pub use optimizer::{OptimizerHook, OptimizerHookConfig};
pub use registry::HookRegistry;
pub use sampler_seed::{SamplerSeedConfig, SamplerSeedHook};

/// The lifecycle points the runner emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    BeforeRun,
    BeforeEpoch,
    BeforeTrainEpoch,
    BeforeValEpoch,
    BeforeIter,
    AfterIter,
    AfterEpoch,
    AfterTrainEpoch,
    AfterValEpoch,
    AfterRun,
}

impl HookEvent {
    pub const ALL: [HookEvent; 10] = [
        HookEvent::BeforeRun,
        HookEvent::BeforeEpoch,
        HookEvent::BeforeTrainEpoch,
        HookEvent::BeforeValEpoch,
        HookEvent::BeforeIter,
        HookEvent::AfterIter,
        HookEvent::AfterEpoch,
        HookEvent::AfterTrainEpoch,
        HookEvent::AfterValEpoch,
        HookEvent::AfterRun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeRun => "before_run",
            HookEvent::BeforeEpoch => "before_epoch",
            HookEvent::BeforeTrainEpoch => "before_train_epoch",
            HookEvent::BeforeValEpoch => "before_val_epoch",
            HookEvent::BeforeIter => "before_iter",
            HookEvent::AfterIter => "after_iter",
            HookEvent::AfterEpoch => "after_epoch",
            HookEvent::AfterTrainEpoch => "after_train_epoch",
            HookEvent::AfterValEpoch => "after_val_epoch",
            HookEvent::AfterRun => "after_run",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Lower values fire earlier.
///
/// | name        | value |
/// |-------------|-------|
/// | `Highest`   | 0     |
/// | `VeryHigh`  | 10    |
/// | `High`      | 30    |
/// | `Normal`    | 50    |
/// | `Low`       | 70    |
/// | `VeryLow`   | 90    |
/// | `Lowest`    | 100   |
///
/// `Custom(v)` slots anywhere on the same scale and compares equal to a named
/// level with the same value.
#[derive(Debug, Clone, Copy, Default)]
pub enum Priority {
    Highest,
    VeryHigh,
    High,
    #[default]
    Normal,
    Low,
    VeryLow,
    Lowest,
    Custom(u8),
}

impl Priority {
    pub const fn value(self) -> u8 {
        match self {
            Priority::Highest => 0,
            Priority::VeryHigh => 10,
            Priority::High => 30,
            Priority::Normal => 50,
            Priority::Low => 70,
            Priority::VeryLow => 90,
            Priority::Lowest => 100,
            Priority::Custom(v) => v,
        }
    }
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority::Custom(value)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "highest" => Ok(Priority::Highest),
            "very_high" => Ok(Priority::VeryHigh),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "very_low" => Ok(Priority::VeryLow),
            "lowest" => Ok(Priority::Lowest),
            other => other
                .parse::<u8>()
                .map(Priority::Custom)
                .map_err(|_| format!("unknown priority '{s}'")),
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Value(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Value(v) => Ok(Priority::Custom(v)),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// What a hook sees while handling an event.
///
/// The state is owned by the runner; hooks can read it and write its log
/// buffer. The model is read-only; the optimizer, when present, is mutable so
/// schedule and step hooks can drive it.
pub struct HookContext<'a> {
    pub state: &'a mut RunnerState,
    pub model: &'a dyn Model,
    pub optimizer: Option<&'a mut (dyn Optimizer + 'static)>,
}

/// A set of optional lifecycle callbacks plus a priority.
pub trait Hook {
    /// Display name for logging and error reports.
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn before_run(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn before_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn before_train_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn before_val_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn before_iter(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn after_iter(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn after_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn after_train_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn after_val_epoch(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    fn after_run(&mut self, _ctx: &mut HookContext<'_>) -> HookResult {
        Ok(())
    }

    /// Route `event` to its callback.
    fn on_event(&mut self, event: HookEvent, ctx: &mut HookContext<'_>) -> HookResult {
        match event {
            HookEvent::BeforeRun => self.before_run(ctx),
            HookEvent::BeforeEpoch => self.before_epoch(ctx),
            HookEvent::BeforeTrainEpoch => self.before_train_epoch(ctx),
            HookEvent::BeforeValEpoch => self.before_val_epoch(ctx),
            HookEvent::BeforeIter => self.before_iter(ctx),
            HookEvent::AfterIter => self.after_iter(ctx),
            HookEvent::AfterEpoch => self.after_epoch(ctx),
            HookEvent::AfterTrainEpoch => self.after_train_epoch(ctx),
            HookEvent::AfterValEpoch => self.after_val_epoch(ctx),
            HookEvent::AfterRun => self.after_run(ctx),
        }
    }
}
