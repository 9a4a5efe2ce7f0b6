//! Best-K checkpoint retention, run after every val epoch on rank 0.
//!
//! The metric is read from the log buffer as-is. When several ranks train
//! together the caller must make that value consistent across ranks before
//! `after_val_epoch` (for example by all-reducing inside the batch
//! processor); otherwise retention silently follows rank 0's local value.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Hook, HookContext, Priority};
use crate::checkpoint::{self, BestK, CheckpointMeta, CheckpointRecord, MetricMode};
use crate::error::{CheckpointError, ConfigError, HookError, HookResult};
use crate::runner::ResumePoint;

/// Settings for [`CheckpointHook`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Log buffer key of the metric that ranks checkpoints.
    pub metric_name: String,
    pub mode: MetricMode,
    /// Maximum number of checkpoints kept on disk.
    #[serde(default = "default_num_checkpoints")]
    pub num_checkpoints: usize,
    #[serde(default = "default_true")]
    pub save_optimizer: bool,
    /// Defaults to the runner's work dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_dir: Option<PathBuf>,
    /// Extra metadata written into every checkpoint.
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl CheckpointConfig {
    pub fn new(metric_name: impl Into<String>, mode: MetricMode) -> Self {
        Self {
            metric_name: metric_name.into(),
            mode,
            num_checkpoints: default_num_checkpoints(),
            save_optimizer: true,
            out_dir: None,
            meta: BTreeMap::new(),
        }
    }
}

fn default_num_checkpoints() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Keeps the best `num_checkpoints` checkpoints and a `best` pointer.
#[derive(Debug)]
pub struct CheckpointHook {
    config: CheckpointConfig,
    out_dir: Option<PathBuf>,
    retained: BestK,
}

impl CheckpointHook {
    pub fn new(config: CheckpointConfig) -> Result<Self, ConfigError> {
        if config.metric_name.trim().is_empty() {
            return Err(ConfigError::invalid("checkpoint metric_name must not be empty"));
        }
        if config.num_checkpoints == 0 {
            return Err(ConfigError::invalid("checkpoint num_checkpoints must be at least 1"));
        }
        if let Some(key) = config
            .meta
            .keys()
            .find(|k| checkpoint::RESERVED_META_KEYS.contains(&k.as_str()))
        {
            return Err(ConfigError::invalid(format!(
                "checkpoint meta key '{key}' is reserved"
            )));
        }
        Ok(Self {
            out_dir: config.out_dir.clone(),
            retained: BestK::new(config.num_checkpoints),
            config,
        })
    }

    pub fn retained(&self) -> &BestK {
        &self.retained
    }

    /// Resolved output directory; set once the run has started.
    pub fn out_dir(&self) -> Option<&std::path::Path> {
        self.out_dir.as_deref()
    }

    /// Pick up the retained set recorded in the checkpoint being resumed.
    fn restore(&mut self, resumed: &ResumePoint, is_master: bool) -> HookResult {
        let state = resumed
            .meta
            .retention()
            .map_err(|source| CheckpointError::Deserialize {
                what: "retention state",
                path: resumed.path.clone(),
                source,
            })?;
        let Some(state) = state else {
            warn!(path = %resumed.path.display(), "Resumed checkpoint has no retention state; ranking starts empty");
            return Ok(());
        };

        let (retained, overflow) = BestK::restore(self.config.num_checkpoints, state);
        info!(
            retained = retained.len(),
            best = ?retained.best_score(),
            "Restored checkpoint retention"
        );
        self.retained = retained;
        if is_master {
            for record in &overflow {
                remove_evicted(record)?;
            }
        }
        Ok(())
    }

    fn retain(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let name = &self.config.metric_name;
        let metric = ctx
            .state
            .log_buffer()
            .get(name)
            .ok_or_else(|| HookError::MissingMetric { name: name.clone() })?;
        if metric.is_nan() {
            return Err(HookError::InvalidMetric {
                name: name.clone(),
                value: metric,
            });
        }

        let out_dir = self
            .out_dir
            .get_or_insert_with(|| ctx.state.work_dir().to_path_buf())
            .clone();
        let epoch = ctx.state.epoch() + 1;
        let filename = checkpoint::epoch_filename(epoch);
        let path = out_dir.join(&filename);
        let score = self.config.mode.score(metric);

        // Staged until the new file and the best pointer are on disk.
        let mut staged = self.retained.clone();
        let decision = staged.offer(score, path.clone());
        debug!(epoch, metric, score, ?decision, "Retention decision");

        if decision.new_best && !decision.persist {
            return Err(CheckpointError::UnpersistedBest { path }.into());
        }

        if decision.persist {
            let mut meta = CheckpointMeta::new(epoch, ctx.state.iter());
            meta.extra = self.config.meta.clone();
            let retention = serde_json::to_value(staged.state()).map_err(|source| {
                CheckpointError::Serialize {
                    what: "retention state",
                    source,
                }
            })?;
            meta.extra
                .insert(checkpoint::RETENTION_META_KEY.to_string(), retention);
            let optimizer = if self.config.save_optimizer {
                ctx.optimizer.as_deref()
            } else {
                None
            };
            checkpoint::save_checkpoint(&path, ctx.model, optimizer, meta)?;
            info!(path = %path.display(), metric = name.as_str(), value = metric, "Saved checkpoint");
        }

        if decision.new_best {
            let link = checkpoint::repoint_best(&out_dir, &filename)?;
            info!(link = %link.display(), target = %filename, value = metric, "Updated best checkpoint");
        }

        self.retained = staged;
        if let Some(evicted) = &decision.evicted {
            remove_evicted(evicted)?;
        }
        Ok(())
    }
}

fn remove_evicted(record: &CheckpointRecord) -> HookResult {
    match std::fs::remove_file(&record.path) {
        Ok(()) => {
            info!(path = %record.path.display(), score = record.score, "Evicted checkpoint");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %record.path.display(), "Evicted checkpoint was already gone");
            Ok(())
        }
        Err(e) => Err(CheckpointError::io("evict", &record.path, e).into()),
    }
}

impl Hook for CheckpointHook {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn priority(&self) -> Priority {
        Priority::Lowest
    }

    fn before_run(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let out_dir = self
            .out_dir
            .get_or_insert_with(|| ctx.state.work_dir().to_path_buf())
            .clone();
        let dist = ctx.state.dist();
        dist.run_master_only(|| {
            std::fs::create_dir_all(&out_dir).map_err(|e| CheckpointError::io("create", &out_dir, e))
        })
        .transpose()?;
        if let Some(resumed) = ctx.state.resumed_from() {
            self.restore(resumed, dist.is_master())?;
        }
        Ok(())
    }

    fn after_val_epoch(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let dist = ctx.state.dist();
        dist.run_master_only(|| self.retain(ctx))
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::DistContext;
    use crate::runner::RunnerState;
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_empty_metric_name() {
        let err = CheckpointHook::new(CheckpointConfig::new(" ", MetricMode::Max)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut config = CheckpointConfig::new("acc", MetricMode::Max);
        config.num_checkpoints = 0;
        assert!(CheckpointHook::new(config).is_err());
    }

    #[test]
    fn test_rejects_reserved_meta_keys() {
        for key in ["epoch", "iter", "created_at", "retention"] {
            let mut config = CheckpointConfig::new("acc", MetricMode::Max);
            config.meta.insert(key.to_string(), serde_json::json!(3));
            let err = CheckpointHook::new(config).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: CheckpointConfig =
            serde_json::from_value(serde_json::json!({"metric_name": "loss", "mode": "min"}))
                .unwrap();
        assert_eq!(config.num_checkpoints, 5);
        assert!(config.save_optimizer);
        assert_eq!(config.mode, MetricMode::Min);
    }

    #[test]
    fn test_missing_metric_is_error() {
        let dir = TempDir::new().unwrap();
        let mut hook = CheckpointHook::new(CheckpointConfig::new("acc", MetricMode::Max)).unwrap();
        let mut state = RunnerState::new(dir.path());
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        let err = hook.after_val_epoch(&mut ctx).unwrap_err();
        assert!(matches!(err, HookError::MissingMetric { .. }));
    }

    #[test]
    fn test_nan_metric_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut hook = CheckpointHook::new(CheckpointConfig::new("acc", MetricMode::Max)).unwrap();
        let mut state = RunnerState::new(dir.path());
        state.log_buffer_mut().insert("acc", f64::NAN);
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        let err = hook.after_val_epoch(&mut ctx).unwrap_err();
        assert!(matches!(err, HookError::InvalidMetric { .. }));
        assert!(hook.retained().is_empty());
    }

    #[test]
    fn test_first_val_epoch_persists_and_points_best() {
        let dir = TempDir::new().unwrap();
        let mut hook = CheckpointHook::new(CheckpointConfig::new("acc", MetricMode::Max)).unwrap();
        let mut state = RunnerState::new(dir.path());
        state
            .log_buffer_mut()
            .update(&Map::from([("acc".to_string(), 0.7)]), 1);
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        hook.before_run(&mut ctx).unwrap();
        hook.after_val_epoch(&mut ctx).unwrap();

        assert!(dir.path().join("epoch_1.json").exists());
        assert!(dir.path().join("best.json").exists());
        assert_eq!(hook.retained().len(), 1);
    }

    #[test]
    fn test_saved_meta_carries_user_keys_and_retention() {
        let dir = TempDir::new().unwrap();
        let mut config = CheckpointConfig::new("acc", MetricMode::Max);
        config.meta.insert("arch".to_string(), serde_json::json!("mlp"));
        let mut hook = CheckpointHook::new(config).unwrap();
        let mut state = RunnerState::new(dir.path());
        state.log_buffer_mut().insert("acc", 0.7);
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        hook.before_run(&mut ctx).unwrap();
        hook.after_val_epoch(&mut ctx).unwrap();

        let file = checkpoint::load_checkpoint(&dir.path().join("epoch_1.json")).unwrap();
        assert_eq!(file.meta.epoch, 1);
        assert_eq!(file.meta.extra.get("arch"), Some(&serde_json::json!("mlp")));
        let retention = file.meta.retention().unwrap().unwrap();
        assert_eq!(retention.best, Some(0.7));
        assert_eq!(retention.records.len(), 1);
        assert_eq!(retention.records[0].path, dir.path().join("epoch_1.json"));
    }

    #[test]
    fn test_before_run_restores_from_resume_point() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("epoch_1.json");
        std::fs::write(&stale, "{}").unwrap();

        let mut earlier = BestK::new(2);
        earlier.offer(0.2, stale.clone());
        earlier.offer(0.9, dir.path().join("epoch_2.json"));
        let mut meta = CheckpointMeta::new(2, 4);
        meta.extra.insert(
            checkpoint::RETENTION_META_KEY.to_string(),
            serde_json::to_value(earlier.state()).unwrap(),
        );
        let mut state = RunnerState::new(dir.path());
        state.resumed_from = Some(ResumePoint {
            path: dir.path().join("epoch_2.json"),
            meta,
        });

        let mut config = CheckpointConfig::new("acc", MetricMode::Max);
        config.num_checkpoints = 1;
        let mut hook = CheckpointHook::new(config).unwrap();
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        hook.before_run(&mut ctx).unwrap();

        assert_eq!(hook.retained().len(), 1);
        assert_eq!(hook.retained().best_score(), Some(0.9));
        assert!(!stale.exists());
    }

    #[test]
    fn test_worker_rank_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("ckpt");
        let mut config = CheckpointConfig::new("acc", MetricMode::Max);
        config.out_dir = Some(out.clone());
        let mut hook = CheckpointHook::new(config).unwrap();

        let mut state = RunnerState::new(dir.path()).with_dist(DistContext::new(1, 2).unwrap());
        state.log_buffer_mut().insert("acc", 0.9);
        let mut ctx = HookContext {
            state: &mut state,
            model: &(),
            optimizer: None,
        };
        hook.before_run(&mut ctx).unwrap();
        hook.after_val_epoch(&mut ctx).unwrap();

        assert!(!out.exists());
        assert!(hook.retained().is_empty());
    }
}
