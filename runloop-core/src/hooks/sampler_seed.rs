//! Reseeds the epoch's data sources so every rank shuffles identically.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Hook, HookContext};
use crate::error::HookResult;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerSeedConfig {
    /// Base seed; the epoch index is added to it.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Default)]
pub struct SamplerSeedHook {
    seed: u64,
}

impl SamplerSeedHook {
    pub fn new(config: SamplerSeedConfig) -> Self {
        Self { seed: config.seed }
    }
}

impl Hook for SamplerSeedHook {
    fn name(&self) -> &str {
        "sampler_seed"
    }

    fn before_epoch(&mut self, ctx: &mut HookContext<'_>) -> HookResult {
        let seed = self.seed.wrapping_add(ctx.state.epoch() as u64);
        ctx.state.set_sampler_seed(seed);
        debug!(epoch = ctx.state.epoch() + 1, seed, "Set sampler seed");
        Ok(())
    }
}
