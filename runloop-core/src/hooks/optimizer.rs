//! Steps the optimizer after every train iteration.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Hook, HookContext, Priority};
use crate::error::{HookError, HookResult};
use crate::runner::Mode;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerHookConfig {
    /// Skip the update when the batch loss is NaN or infinite.
    #[serde(default)]
    pub skip_non_finite_loss: bool,
}

#[derive(Debug, Default)]
pub struct OptimizerHook {
    config: OptimizerHookConfig,
    skipped: usize,
}

impl OptimizerHook {
    pub fn new(config: OptimizerHookConfig) -> Self {
        Self { config, skipped: 0 }
    }

    /// Updates skipped for a non-finite loss so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Hook for OptimizerHook {
    fn name(&self) -> &str {
        "optimizer"
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn before_run(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        if ctx.optimizer.is_none() {
            return Err(HookError::MissingOptimizer);
        }
        Ok(())
    }

    fn after_iter(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        if ctx.state.mode() != Mode::Train {
            return Ok(());
        }
        let loss = ctx.state.last_output().map(|o| o.loss);
        let optimizer = ctx
            .optimizer
            .as_deref_mut()
            .ok_or(HookError::MissingOptimizer)?;

        match loss {
            Some(loss) if self.config.skip_non_finite_loss && !loss.is_finite() => {
                self.skipped += 1;
                warn!(
                    iter = ctx.state.iter(),
                    loss,
                    skipped = self.skipped,
                    "Non-finite loss; skipping optimizer step"
                );
            }
            _ => optimizer.step()?,
        }
        optimizer.zero_grad();
        Ok(())
    }
}
