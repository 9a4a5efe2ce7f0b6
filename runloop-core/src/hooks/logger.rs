//! Periodic metric logging through `tracing`, on rank 0 only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Hook, HookContext, Priority};
use crate::error::{ConfigError, HookResult};
use crate::runner::Mode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log the running train averages every `interval` iterations.
    #[serde(default = "default_interval")]
    pub interval: usize,
}

fn default_interval() -> usize {
    10
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

#[derive(Debug)]
pub struct TextLoggerHook {
    interval: usize,
}

impl TextLoggerHook {
    pub fn new(config: LogConfig) -> Result<Self, ConfigError> {
        if config.interval == 0 {
            return Err(ConfigError::invalid("log interval must be at least 1"));
        }
        Ok(Self {
            interval: config.interval,
        })
    }
}

fn render(values: &BTreeMap<String, f64>) -> String {
    values
        .iter()
        .map(|(k, v)| format!("{k}: {v:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Hook for TextLoggerHook {
    fn name(&self) -> &str {
        "text_logger"
    }

    fn priority(&self) -> Priority {
        Priority::VeryLow
    }

    fn after_iter(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let state = &*ctx.state;
        if state.mode() != Mode::Train || (state.inner_iter() + 1) % self.interval != 0 {
            return Ok(());
        }
        state.dist().run_master_only(|| {
            let lr = ctx.optimizer.as_deref().map(|o| o.learning_rate());
            info!(
                epoch = state.epoch() + 1,
                max_epochs = state.max_epochs(),
                iter = state.iter() + 1,
                inner_iter = state.inner_iter() + 1,
                lr,
                "{}",
                render(&state.log_buffer().averaged(Some(self.interval)))
            );
        });
        Ok(())
    }

    fn after_epoch(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let state = &*ctx.state;
        state.dist().run_master_only(|| {
            info!(
                epoch = state.epoch() + 1,
                mode = %state.mode(),
                iter = state.iter(),
                "Epoch summary: {}",
                render(state.log_buffer().output())
            );
        });
        Ok(())
    }
}
