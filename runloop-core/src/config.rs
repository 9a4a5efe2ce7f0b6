//! Run configuration for runloop.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment -> explicit overrides.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::distributed::DistConfig;
use crate::error::ConfigError;
use crate::factory::HookSpec;
use crate::hooks::{
    CheckpointConfig, CheckpointHook, Hook, LogConfig, LrConfig, LrSchedulerHook, OptimizerHook,
    OptimizerHookConfig, SamplerSeedConfig, SamplerSeedHook, TextLoggerHook,
};

/// Prefix of environment variables read by [`load_config`].
pub const ENV_PREFIX: &str = "RUNLOOP_";

/// Top-level settings for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_total_epochs")]
    pub total_epochs: usize,
    /// Seed for data generation and shuffling.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub dist: DistConfig,
    #[serde(default)]
    pub hooks: StandardHooksConfig,
    /// Extra hooks constructed through a [`HookFactory`](crate::factory::HookFactory).
    #[serde(default)]
    pub custom_hooks: Vec<HookSpec>,
    /// Checkpoint to resume epoch, iteration, model and optimizer from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<PathBuf>,
    /// Checkpoint to take model weights from; counters start at zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_from: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            total_epochs: default_total_epochs(),
            seed: 0,
            dist: DistConfig::default(),
            hooks: StandardHooksConfig::default(),
            custom_hooks: Vec::new(),
            resume_from: None,
            load_from: None,
        }
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work_dirs")
}

fn default_total_epochs() -> usize {
    1
}

impl RunConfig {
    /// Reject settings that cannot describe a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.total_epochs == 0 {
            return Err(ConfigError::invalid("total_epochs must be at least 1"));
        }
        if self.resume_from.is_some() && self.load_from.is_some() {
            return Err(ConfigError::invalid(
                "resume_from and load_from are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// The conventional hook bundle. A section left unset registers nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardHooksConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<LrConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerHookConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler_seed: Option<SamplerSeedConfig>,
}

impl Default for StandardHooksConfig {
    fn default() -> Self {
        Self {
            lr: None,
            optimizer: Some(OptimizerHookConfig::default()),
            checkpoint: None,
            log: Some(LogConfig::default()),
            sampler_seed: Some(SamplerSeedConfig::default()),
        }
    }
}

impl StandardHooksConfig {
    /// A bundle with every section unset.
    pub fn empty() -> Self {
        Self {
            lr: None,
            optimizer: None,
            checkpoint: None,
            log: None,
            sampler_seed: None,
        }
    }

    /// Construct the configured hooks.
    pub fn build(&self) -> Result<Vec<Box<dyn Hook>>, ConfigError> {
        let mut hooks: Vec<Box<dyn Hook>> = Vec::new();
        if let Some(lr) = &self.lr {
            hooks.push(Box::new(LrSchedulerHook::new(lr.clone())?));
        }
        if let Some(optimizer) = &self.optimizer {
            hooks.push(Box::new(OptimizerHook::new(optimizer.clone())));
        }
        if let Some(seed) = &self.sampler_seed {
            hooks.push(Box::new(SamplerSeedHook::new(seed.clone())));
        }
        if let Some(log) = &self.log {
            hooks.push(Box::new(TextLoggerHook::new(log.clone())?));
        }
        if let Some(checkpoint) = &self.checkpoint {
            hooks.push(Box::new(CheckpointHook::new(checkpoint.clone())?));
        }
        Ok(hooks)
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides: a sparse, possibly nested map; only the keys it
///    carries replace lower layers
/// 2. Environment variables (prefixed with `RUNLOOP_`, nested with `__`)
/// 3. The TOML file at `path`, when given
/// 4. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&Map<String, Value>>,
) -> Result<RunConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::invalid(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // RUNLOOP_TOTAL_EPOCHS, RUNLOOP_HOOKS__CHECKPOINT__METRIC_NAME, etc.
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: RunConfig = figment
        .extract()
        .map_err(|e| ConfigError::Load(Box::new(e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MetricMode;
    use figment::Jail;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.total_epochs, 1);
        assert!(config.hooks.optimizer.is_some());
        assert!(config.hooks.checkpoint.is_none());
        assert!(config.custom_hooks.is_empty());
    }

    #[test]
    fn test_default_bundle_builds_in_order() {
        let mut hooks = StandardHooksConfig::default();
        hooks.lr = Some(LrConfig::default());
        hooks.checkpoint = Some(CheckpointConfig::new("loss", MetricMode::Min));
        let built = hooks.build().unwrap();
        let names: Vec<_> = built.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["lr_scheduler", "optimizer", "sampler_seed", "text_logger", "checkpoint"]
        );
        assert!(StandardHooksConfig::empty().build().unwrap().is_empty());
    }

    #[test]
    fn test_toml_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "run.toml",
                r#"
                work_dir = "out"
                total_epochs = 4

                [hooks.checkpoint]
                metric_name = "acc"
                mode = "max"
                num_checkpoints = 2

                [hooks.lr.policy]
                type = "step"
                steps = [2]
                gamma = 0.5

                [[custom_hooks]]
                type = "SamplerSeedHook"
                seed = 9
                "#,
            )?;
            jail.set_env("RUNLOOP_TOTAL_EPOCHS", "6");
            jail.set_env("RUNLOOP_DIST__WORLD_SIZE", "1");

            let config = load_config(Some(Path::new("run.toml")), None)
                .map_err(|e| e.to_string())?;
            assert_eq!(config.work_dir, PathBuf::from("out"));
            assert_eq!(config.total_epochs, 6);
            assert_eq!(config.dist.world_size, Some(1));
            let checkpoint = config
                .hooks
                .checkpoint
                .as_ref()
                .ok_or_else(|| "no checkpoint section".to_string())?;
            assert_eq!(checkpoint.num_checkpoints, 2);
            assert_eq!(checkpoint.mode, MetricMode::Max);
            assert!(config.hooks.optimizer.is_some());
            assert_eq!(config.custom_hooks.len(), 1);
            assert_eq!(config.custom_hooks[0].kind, "SamplerSeedHook");
            Ok(())
        });
    }

    #[test]
    fn test_overrides_win() {
        Jail::expect_with(|jail| {
            jail.set_env("RUNLOOP_TOTAL_EPOCHS", "6");
            let overrides = json!({"total_epochs": 2});
            let config = load_config(None, overrides.as_object()).map_err(|e| e.to_string())?;
            assert_eq!(config.total_epochs, 2);
            Ok(())
        });
    }

    #[test]
    fn test_overrides_leave_other_keys_alone() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "run.toml",
                r#"
                work_dir = "out"
                total_epochs = 4

                [hooks.checkpoint]
                metric_name = "acc"
                mode = "max"

                [hooks.log]
                interval = 3
                "#,
            )?;
            let overrides = json!({"total_epochs": 2, "hooks": {"log": {"interval": 7}}});
            let config = load_config(Some(Path::new("run.toml")), overrides.as_object())
                .map_err(|e| e.to_string())?;
            assert_eq!(config.total_epochs, 2);
            assert_eq!(config.work_dir, PathBuf::from("out"));
            assert!(config.hooks.checkpoint.is_some());
            assert_eq!(config.hooks.log.as_ref().map(|l| l.interval), Some(7));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = load_config(Some(Path::new("/nonexistent/run.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_resume_and_load_conflict() {
        let config = RunConfig {
            resume_from: Some("a.json".into()),
            load_from: Some("b.json".into()),
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
