//! Learning-rate schedule driven by epoch progress, with optional linear
//! warmup over the first train iterations.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Hook, HookContext, Priority};
use crate::error::{ConfigError, HookError, HookResult};
use crate::runner::Mode;

/// How the learning rate decays over epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrPolicy {
    #[default]
    Fixed,
    /// Multiply by `gamma` at every epoch listed in `steps`.
    Step { steps: Vec<usize>, gamma: f64 },
    Exp { gamma: f64 },
    Cosine {
        #[serde(default)]
        min_lr: f64,
    },
    Poly {
        #[serde(default = "default_power")]
        power: f64,
        #[serde(default)]
        min_lr: f64,
    },
}

fn default_power() -> f64 {
    1.0
}

impl LrPolicy {
    /// Learning rate for zero-based `epoch` out of `max_epochs`.
    pub fn lr_at(&self, base_lr: f64, epoch: usize, max_epochs: usize) -> f64 {
        let progress = if max_epochs == 0 {
            0.0
        } else {
            (epoch as f64 / max_epochs as f64).min(1.0)
        };
        match self {
            LrPolicy::Fixed => base_lr,
            LrPolicy::Step { steps, gamma } => {
                let passed = steps.iter().filter(|&&s| epoch >= s).count();
                base_lr * gamma.powi(passed as i32)
            }
            LrPolicy::Exp { gamma } => base_lr * gamma.powi(epoch as i32),
            LrPolicy::Cosine { min_lr } => {
                min_lr + (base_lr - min_lr) * (1.0 + (PI * progress).cos()) / 2.0
            }
            LrPolicy::Poly { power, min_lr } => {
                (base_lr - min_lr) * (1.0 - progress).powf(*power) + min_lr
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LrPolicy::Step { gamma, .. } | LrPolicy::Exp { gamma } if *gamma <= 0.0 => Err(
                ConfigError::invalid(format!("lr gamma must be positive, got {gamma}")),
            ),
            LrPolicy::Cosine { min_lr } | LrPolicy::Poly { min_lr, .. } if *min_lr < 0.0 => Err(
                ConfigError::invalid(format!("lr min_lr must not be negative, got {min_lr}")),
            ),
            _ => Ok(()),
        }
    }
}

/// Settings for [`LrSchedulerHook`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrConfig {
    #[serde(default)]
    pub policy: LrPolicy,
    /// Train iterations of linear warmup; 0 disables it.
    #[serde(default)]
    pub warmup_iters: usize,
    /// Fraction of the scheduled rate used at the first warmup iteration.
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
}

fn default_warmup_ratio() -> f64 {
    0.1
}

impl Default for LrConfig {
    fn default() -> Self {
        Self {
            policy: LrPolicy::default(),
            warmup_iters: 0,
            warmup_ratio: default_warmup_ratio(),
        }
    }
}

#[derive(Debug)]
pub struct LrSchedulerHook {
    config: LrConfig,
    base_lr: Option<f64>,
    regular_lr: f64,
}

impl LrSchedulerHook {
    pub fn new(config: LrConfig) -> Result<Self, ConfigError> {
        config.policy.validate()?;
        if !(0.0..=1.0).contains(&config.warmup_ratio) {
            return Err(ConfigError::invalid(format!(
                "lr warmup_ratio must be within [0, 1], got {}",
                config.warmup_ratio
            )));
        }
        Ok(Self {
            config,
            base_lr: None,
            regular_lr: 0.0,
        })
    }

    /// Rate captured from the optimizer when the run started.
    pub fn base_lr(&self) -> Option<f64> {
        self.base_lr
    }

    fn warmup_lr(&self, iter: usize) -> f64 {
        let remaining = 1.0 - iter as f64 / self.config.warmup_iters as f64;
        self.regular_lr * (1.0 - remaining * (1.0 - self.config.warmup_ratio))
    }
}

impl Hook for LrSchedulerHook {
    fn name(&self) -> &str {
        "lr_scheduler"
    }

    fn priority(&self) -> Priority {
        Priority::VeryHigh
    }

    fn before_run(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let optimizer = ctx.optimizer.as_deref().ok_or(HookError::MissingOptimizer)?;
        let base = optimizer.learning_rate();
        self.base_lr = Some(base);
        self.regular_lr = base;
        debug!(base_lr = base, policy = ?self.config.policy, "Captured base learning rate");
        Ok(())
    }

    fn before_train_epoch(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let optimizer = ctx
            .optimizer
            .as_deref_mut()
            .ok_or(HookError::MissingOptimizer)?;
        let base = self.base_lr.unwrap_or_else(|| optimizer.learning_rate());
        self.regular_lr =
            self.config
                .policy
                .lr_at(base, ctx.state.epoch(), ctx.state.max_epochs());
        optimizer.set_learning_rate(self.regular_lr);
        ctx.state.log_buffer_mut().insert("lr", self.regular_lr);
        Ok(())
    }

    fn before_iter(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let warmup = self.config.warmup_iters;
        let iter = ctx.state.iter();
        if warmup == 0 || ctx.state.mode() != Mode::Train || iter > warmup {
            return Ok(());
        }
        let lr = if iter < warmup {
            self.warmup_lr(iter)
        } else {
            self.regular_lr
        };
        let optimizer = ctx
            .optimizer
            .as_deref_mut()
            .ok_or(HookError::MissingOptimizer)?;
        optimizer.set_learning_rate(lr);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Model, Optimizer};
    use crate::runner::RunnerState;
    use serde_json::Value;

    /// Optimizer double that records every call.
    #[derive(Debug, Default)]
    pub(crate) struct FakeOptimizer {
        pub lr: f64,
        pub steps: usize,
        pub zeroed: usize,
    }

    impl Model for FakeOptimizer {
        fn state_dict(&self) -> Result<Value, serde_json::Error> {
            Ok(serde_json::json!({ "lr": self.lr, "steps": self.steps }))
        }

        fn load_state_dict(&mut self, state: Value) -> Result<(), serde_json::Error> {
            self.lr = state["lr"].as_f64().unwrap_or(self.lr);
            Ok(())
        }
    }

    impl Optimizer for FakeOptimizer {
        fn learning_rate(&self) -> f64 {
            self.lr
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.lr = lr;
        }

        fn step(&mut self) -> anyhow::Result<()> {
            self.steps += 1;
            Ok(())
        }

        fn zero_grad(&mut self) {
            self.zeroed += 1;
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_policies() {
        let step = LrPolicy::Step {
            steps: vec![2, 4],
            gamma: 0.1,
        };
        assert!(close(step.lr_at(1.0, 1, 10), 1.0));
        assert!(close(step.lr_at(1.0, 2, 10), 0.1));
        assert!(close(step.lr_at(1.0, 5, 10), 0.01));

        let exp = LrPolicy::Exp { gamma: 0.5 };
        assert!(close(exp.lr_at(1.0, 3, 10), 0.125));

        let cosine = LrPolicy::Cosine { min_lr: 0.0 };
        assert!(close(cosine.lr_at(1.0, 0, 10), 1.0));
        assert!(close(cosine.lr_at(1.0, 5, 10), 0.5));

        let poly = LrPolicy::Poly {
            power: 1.0,
            min_lr: 0.0,
        };
        assert!(close(poly.lr_at(2.0, 5, 10), 1.0));
        assert!(close(LrPolicy::Fixed.lr_at(0.3, 7, 10), 0.3));
    }

    #[test]
    fn test_policy_from_json() {
        let config: LrConfig = serde_json::from_value(serde_json::json!({
            "policy": {"type": "step", "steps": [3], "gamma": 0.5},
            "warmup_iters": 4
        }))
        .unwrap();
        assert_eq!(
            config.policy,
            LrPolicy::Step {
                steps: vec![3],
                gamma: 0.5
            }
        );
        assert!(close(config.warmup_ratio, 0.1));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config = LrConfig {
            policy: LrPolicy::Exp { gamma: 0.0 },
            ..LrConfig::default()
        };
        assert!(LrSchedulerHook::new(config).is_err());

        let config = LrConfig {
            warmup_ratio: 1.5,
            ..LrConfig::default()
        };
        assert!(LrSchedulerHook::new(config).is_err());
    }

    #[test]
    fn test_requires_optimizer() {
        let mut hook = LrSchedulerHook::new(LrConfig::default()).unwrap();
        let mut state = RunnerState::new("/tmp/runloop-lr-test");
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        assert!(matches!(
            hook.before_run(&mut ctx),
            Err(HookError::MissingOptimizer)
        ));
    }

    #[test]
    fn test_warmup_ramps_to_scheduled_rate() {
        let mut hook = LrSchedulerHook::new(LrConfig {
            warmup_iters: 4,
            warmup_ratio: 0.2,
            ..LrConfig::default()
        })
        .unwrap();
        let mut optimizer = FakeOptimizer {
            lr: 1.0,
            ..FakeOptimizer::default()
        };
        let mut state = RunnerState::new("/tmp/runloop-lr-test");
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: Some(&mut optimizer),
        };
        hook.before_run(&mut ctx).unwrap();
        hook.before_train_epoch(&mut ctx).unwrap();
        hook.before_iter(&mut ctx).unwrap();

        assert!(close(optimizer.lr, 0.2));
        assert_eq!(hook.base_lr(), Some(1.0));
    }
}
