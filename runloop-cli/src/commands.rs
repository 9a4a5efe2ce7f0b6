//! CLI subcommand handlers.

use std::path::Path;

use serde_json::{Map, Value};
use tracing::{info, warn};

use runloop_core::checkpoint::MetricMode;
use runloop_core::config::{RunConfig, StandardHooksConfig, load_config};
use runloop_core::hooks::{CheckpointConfig, LrConfig, LrPolicy};
use runloop_core::{DistContext, HookFactory, RunloopError, Runner, Workflow};

use crate::demo;
use crate::{ConfigAction, TrainArgs};

/// Load the layered configuration and apply command-line overrides on top.
pub fn resolve_train_config(args: &TrainArgs) -> Result<RunConfig, RunloopError> {
    let mut overrides = Map::new();
    if let Some(work_dir) = &args.work_dir {
        let work_dir = work_dir.to_string_lossy().into_owned();
        overrides.insert("work_dir".to_string(), Value::from(work_dir));
    }
    if let Some(epochs) = args.epochs {
        overrides.insert("total_epochs".to_string(), Value::from(epochs));
    }
    let mut config = load_config(args.config.as_deref(), Some(&overrides))?;
    if let Some(path) = &args.resume_from {
        config.resume_from = Some(path.clone());
        config.load_from = None;
    }
    if let Some(path) = &args.load_from {
        config.load_from = Some(path.clone());
        config.resume_from = None;
    }
    config.validate()?;
    Ok(config)
}

/// Run the synthetic regression workload under `config`.
pub fn train(args: &TrainArgs, config: RunConfig, dist: DistContext) -> Result<(), RunloopError> {
    let (model, optimizer) = demo::linear_regression(args.lr, args.momentum);
    let mut runner = Runner::new(model, demo::process_batch, &config.work_dir)
        .with_optimizer(optimizer)
        .with_dist(dist);

    if config.hooks.checkpoint.is_none() {
        warn!("No checkpoint section configured; no checkpoints will be written");
    }
    runner.register_hooks(&config.hooks)?;
    runner.register_from_specs(&HookFactory::with_builtins(), &config.custom_hooks)?;

    if let Some(path) = &config.resume_from {
        runner.resume(path)?;
    } else if let Some(path) = &config.load_from {
        runner.load(path)?;
    }

    let (mut train, mut val) = demo::datasets(config.seed, args.samples, args.batch_size, dist);
    let mut workflow = Workflow::new().train(&mut train).val(&mut val);
    runner.run(&mut workflow, config.total_epochs)?;

    let (weights, bias) = runner.model().weights();
    info!(
        epochs = runner.state().epoch(),
        iters = runner.state().iter(),
        ?weights,
        bias,
        "Training complete"
    );
    Ok(())
}

pub fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => init_config(&path),
        ConfigAction::Show { config } => {
            let config = load_config(config.as_deref(), None)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        println!("Configuration file already exists at: {}", path.display());
        return Ok(());
    }
    let toml_str = toml::to_string_pretty(&example_config())?;
    std::fs::write(path, &toml_str)?;
    println!("Created example configuration at: {}", path.display());
    Ok(())
}

/// Defaults plus a cosine schedule and best-3 retention on validation loss.
fn example_config() -> RunConfig {
    let mut checkpoint = CheckpointConfig::new("loss", MetricMode::Min);
    checkpoint.num_checkpoints = 3;
    RunConfig {
        total_epochs: 10,
        hooks: StandardHooksConfig {
            lr: Some(LrConfig {
                policy: LrPolicy::Cosine { min_lr: 1e-4 },
                warmup_iters: 20,
                ..LrConfig::default()
            }),
            checkpoint: Some(checkpoint),
            ..StandardHooksConfig::default()
        },
        ..RunConfig::default()
    }
}
