//! Runner — the epoch/iteration state machine that drives the hooks.
//!
//! `Idle -> Running -> {Finished, Failed}`. A run emits `before_run`, then for
//! every epoch walks the workflow's stages in order, and finally emits
//! `after_run`. Any failure from the batch processor or a hook ends the run in
//! `Failed` and is returned to the caller unchanged; nothing is retried.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{self, CheckpointMeta};
use crate::config::StandardHooksConfig;
use crate::data::DataSource;
use crate::distributed::{self, DistContext};
use crate::error::{CheckpointError, ConfigError, RunnerError};
use crate::factory::{HookFactory, HookSpec};
use crate::hooks::{Hook, HookContext, HookEvent, HookRegistry};
use crate::log_buffer::LogBuffer;
use crate::model::{Model, Optimizer};

/// Which kind of pass a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Val,
}

impl Mode {
    fn epoch_events(self) -> (HookEvent, HookEvent) {
        match self {
            Mode::Train => (HookEvent::BeforeTrainEpoch, HookEvent::AfterTrainEpoch),
            Mode::Val => (HookEvent::BeforeValEpoch, HookEvent::AfterValEpoch),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => f.write_str("train"),
            Mode::Val => f.write_str("val"),
        }
    }
}

/// Lifecycle status of a [`Runner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Idle,
    Running,
    Finished,
    Failed,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerStatus::Idle => "idle",
            RunnerStatus::Running => "running",
            RunnerStatus::Finished => "finished",
            RunnerStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the batch processor reports for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub loss: f64,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
    pub num_samples: usize,
}

impl BatchOutput {
    pub fn new(loss: f64, num_samples: usize) -> Self {
        Self {
            loss,
            values: BTreeMap::new(),
            num_samples,
        }
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// The checkpoint a run was resumed from.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub path: PathBuf,
    pub meta: CheckpointMeta,
}

/// Counters and buffers owned by the runner.
///
/// Hooks get `&mut RunnerState` but can only change the log buffer and the
/// sampler seed; counters move only inside the runner.
#[derive(Debug, Clone)]
pub struct RunnerState {
    epoch: usize,
    iter: usize,
    inner_iter: usize,
    max_epochs: usize,
    mode: Mode,
    log_buffer: LogBuffer,
    work_dir: PathBuf,
    dist: DistContext,
    sampler_seed: Option<u64>,
    last_output: Option<BatchOutput>,
    pub(crate) resumed_from: Option<ResumePoint>,
}

impl RunnerState {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            epoch: 0,
            iter: 0,
            inner_iter: 0,
            max_epochs: 0,
            mode: Mode::Train,
            log_buffer: LogBuffer::new(),
            work_dir: work_dir.into(),
            dist: DistContext::single(),
            sampler_seed: None,
            last_output: None,
            resumed_from: None,
        }
    }

    /// Replace the distributed context the state carries.
    pub fn with_dist(mut self, dist: DistContext) -> Self {
        self.dist = dist;
        self
    }

    /// Zero-based index of the current epoch; equals the number of completed
    /// epochs between epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Number of completed train iterations.
    pub fn iter(&self) -> usize {
        self.iter
    }

    /// Index of the current batch within the current stage.
    pub fn inner_iter(&self) -> usize {
        self.inner_iter
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn dist(&self) -> DistContext {
        self.dist
    }

    pub fn sampler_seed(&self) -> Option<u64> {
        self.sampler_seed
    }

    pub fn set_sampler_seed(&mut self, seed: u64) {
        self.sampler_seed = Some(seed);
    }

    /// Output of the most recent batch in the current stage.
    pub fn last_output(&self) -> Option<&BatchOutput> {
        self.last_output.as_ref()
    }

    /// Set by [`Runner::resume`]; `None` for fresh and weight-only loaded runs.
    pub fn resumed_from(&self) -> Option<&ResumePoint> {
        self.resumed_from.as_ref()
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log_buffer
    }

    pub fn log_buffer_mut(&mut self) -> &mut LogBuffer {
        &mut self.log_buffer
    }
}

/// Ordered `(mode, source)` stages run once per epoch.
pub struct Workflow<'a, B> {
    stages: Vec<(Mode, &'a mut dyn DataSource<B>)>,
}

impl<'a, B> Workflow<'a, B> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    pub fn stage(mut self, mode: Mode, source: &'a mut dyn DataSource<B>) -> Self {
        self.stages.push((mode, source));
        self
    }

    pub fn train(self, source: &'a mut dyn DataSource<B>) -> Self {
        self.stage(Mode::Train, source)
    }

    pub fn val(self, source: &'a mut dyn DataSource<B>) -> Self {
        self.stage(Mode::Val, source)
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.stages.iter().map(|(mode, _)| *mode).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl<B> Default for Workflow<'_, B> {
    fn default() -> Self {
        Self::new()
    }
}

/// The per-batch computation supplied by the caller.
pub type BatchFn<M, B> = Box<dyn FnMut(&mut M, B, Mode) -> anyhow::Result<BatchOutput>>;

/// Drives epochs over a [`Workflow`] and dispatches lifecycle events to hooks.
pub struct Runner<M, B> {
    model: M,
    optimizer: Option<Box<dyn Optimizer>>,
    processor: BatchFn<M, B>,
    hooks: HookRegistry,
    state: RunnerState,
    status: RunnerStatus,
}

impl<M: Model, B> Runner<M, B> {
    /// Create an idle runner. The distributed context defaults to the
    /// process group, or a single process when none was initialized.
    pub fn new(
        model: M,
        processor: impl FnMut(&mut M, B, Mode) -> anyhow::Result<BatchOutput> + 'static,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut state = RunnerState::new(work_dir);
        state.dist = distributed::current();
        Self {
            model,
            optimizer: None,
            processor: Box::new(processor),
            hooks: HookRegistry::new(),
            state,
            status: RunnerStatus::Idle,
        }
    }

    pub fn with_optimizer(mut self, optimizer: impl Optimizer + 'static) -> Self {
        self.optimizer = Some(Box::new(optimizer));
        self
    }

    pub fn with_dist(mut self, dist: DistContext) -> Self {
        self.state.dist = dist;
        self
    }

    pub fn register_hook(&mut self, hook: impl Hook + 'static) {
        self.hooks.register(Box::new(hook));
    }

    pub fn register_boxed_hook(&mut self, hook: Box<dyn Hook>) {
        self.hooks.register(hook);
    }

    /// Register the conventional bundle. Sections left unset are skipped.
    pub fn register_hooks(&mut self, config: &StandardHooksConfig) -> Result<(), ConfigError> {
        for hook in config.build()? {
            self.hooks.register(hook);
        }
        Ok(())
    }

    /// Construct hooks from specs through `factory` and register them.
    pub fn register_from_specs(
        &mut self,
        factory: &HookFactory,
        specs: &[HookSpec],
    ) -> Result<(), ConfigError> {
        for spec in specs {
            self.hooks.register(factory.build(spec)?);
        }
        Ok(())
    }

    pub fn status(&self) -> RunnerStatus {
        self.status
    }

    pub fn state(&self) -> &RunnerState {
        &self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        self.optimizer.as_deref()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Run epochs `[epoch, total_epochs)` over `workflow`.
    pub fn run(
        &mut self,
        workflow: &mut Workflow<'_, B>,
        total_epochs: usize,
    ) -> Result<(), RunnerError> {
        self.ensure_idle("run")?;
        self.status = RunnerStatus::Running;
        self.state.max_epochs = total_epochs;

        if workflow.is_empty() {
            warn!("Workflow has no stages; epochs will only emit run events");
        }
        info!(
            work_dir = %self.state.work_dir.display(),
            rank = self.state.dist.rank(),
            world_size = self.state.dist.world_size(),
            start_epoch = self.state.epoch,
            total_epochs,
            stages = ?workflow.modes(),
            hooks = ?self.hooks.names(),
            "Starting run"
        );

        let result = self.drive(workflow, total_epochs);
        self.settle(result)
    }

    /// Restore epoch, iteration, model and optimizer state from a checkpoint.
    ///
    /// A following [`run`](Self::run) continues from the restored epoch.
    pub fn resume(&mut self, path: impl AsRef<Path>) -> Result<CheckpointMeta, RunnerError> {
        self.ensure_idle("resume")?;
        let path = path.as_ref();
        let result = self.restore(path, true);
        if let Ok(meta) = &result {
            self.state.epoch = meta.epoch;
            self.state.iter = meta.iter;
            self.state.resumed_from = Some(ResumePoint {
                path: path.to_path_buf(),
                meta: meta.clone(),
            });
            info!(
                path = %path.display(),
                epoch = meta.epoch,
                iter = meta.iter,
                "Resumed from checkpoint"
            );
        }
        self.fail_on_err(result)
    }

    /// Restore model weights only; epoch and iteration start from zero.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<CheckpointMeta, RunnerError> {
        self.ensure_idle("load")?;
        let path = path.as_ref();
        let result = self.restore(path, false);
        if result.is_ok() {
            self.state.epoch = 0;
            self.state.iter = 0;
            self.state.resumed_from = None;
            info!(path = %path.display(), "Loaded model weights");
        }
        self.fail_on_err(result)
    }

    fn restore(&mut self, path: &Path, with_optimizer: bool) -> Result<CheckpointMeta, RunnerError> {
        let file = checkpoint::load_checkpoint(path)?;
        self.model
            .load_state_dict(file.model)
            .map_err(|source| CheckpointError::Deserialize {
                what: "model state",
                path: path.to_path_buf(),
                source,
            })?;

        if with_optimizer {
            match (self.optimizer.as_mut(), file.optimizer) {
                (Some(optimizer), Some(state)) => {
                    optimizer
                        .load_state_dict(state)
                        .map_err(|source| CheckpointError::Deserialize {
                            what: "optimizer state",
                            path: path.to_path_buf(),
                            source,
                        })?;
                }
                (Some(_), None) => {
                    warn!(path = %path.display(), "Checkpoint has no optimizer state; keeping current optimizer");
                }
                (None, _) => {}
            }
        }
        Ok(file.meta)
    }

    fn drive(&mut self, workflow: &mut Workflow<'_, B>, total_epochs: usize) -> Result<(), RunnerError> {
        self.emit(HookEvent::BeforeRun)?;
        while self.state.epoch < total_epochs {
            for (mode, source) in workflow.stages.iter_mut() {
                self.run_stage(*mode, &mut **source)?;
            }
            self.state.epoch += 1;
        }
        self.emit(HookEvent::AfterRun)?;
        Ok(())
    }

    fn run_stage(
        &mut self,
        mode: Mode,
        source: &mut (dyn DataSource<B> + '_),
    ) -> Result<(), RunnerError> {
        let (before, after) = mode.epoch_events();
        self.state.mode = mode;
        self.state.inner_iter = 0;
        self.state.last_output = None;
        self.state.log_buffer.clear();

        self.emit(HookEvent::BeforeEpoch)?;
        self.emit(before)?;

        if let Some(seed) = self.state.sampler_seed {
            source.reseed(seed);
        }

        for batch in source.batches() {
            self.emit(HookEvent::BeforeIter)?;
            let output = (self.processor)(&mut self.model, batch, mode).map_err(|source| {
                RunnerError::BatchProcessor {
                    epoch: self.state.epoch,
                    iter: self.state.iter,
                    mode,
                    source,
                }
            })?;
            self.state
                .log_buffer
                .update(&output.values, output.num_samples);
            self.state.last_output = Some(output);
            self.emit(HookEvent::AfterIter)?;

            if mode == Mode::Train {
                self.state.iter += 1;
            }
            self.state.inner_iter += 1;
        }

        self.state.log_buffer.average(None);
        debug!(
            epoch = self.state.epoch + 1,
            %mode,
            batches = self.state.inner_iter,
            "Stage complete"
        );
        self.emit(after)?;
        self.emit(HookEvent::AfterEpoch)?;
        Ok(())
    }

    fn emit(&mut self, event: HookEvent) -> Result<(), RunnerError> {
        let mut ctx = HookContext {
            state: &mut self.state,
            model: &self.model,
            optimizer: self.optimizer.as_deref_mut(),
        };
        self.hooks.dispatch(event, &mut ctx)?;
        Ok(())
    }

    fn ensure_idle(&self, action: &'static str) -> Result<(), RunnerError> {
        if self.status == RunnerStatus::Idle {
            Ok(())
        } else {
            Err(RunnerError::InvalidState {
                action,
                status: self.status,
            })
        }
    }

    fn settle(&mut self, result: Result<(), RunnerError>) -> Result<(), RunnerError> {
        match &result {
            Ok(()) => {
                self.status = RunnerStatus::Finished;
                info!(
                    epoch = self.state.epoch,
                    iter = self.state.iter,
                    "Run finished"
                );
            }
            Err(e) => {
                self.status = RunnerStatus::Failed;
                error!(
                    epoch = self.state.epoch,
                    iter = self.state.iter,
                    error = %e,
                    "Run failed"
                );
            }
        }
        result
    }

    fn fail_on_err<T>(&mut self, result: Result<T, RunnerError>) -> Result<T, RunnerError> {
        if let Err(e) = &result {
            self.status = RunnerStatus::Failed;
            error!(error = %e, "Failed to restore checkpoint");
        }
        result
    }
}

impl<M, B> fmt::Debug for Runner<M, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("status", &self.status)
            .field("state", &self.state)
            .field("hooks", &self.hooks)
            .field("has_optimizer", &self.optimizer.is_some())
            .finish()
    }
}
