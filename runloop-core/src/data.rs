//! Data sources consumed by the runner, one pass per stage epoch.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::distributed::DistContext;

/// Something the runner can iterate once per epoch.
pub trait DataSource<B> {
    /// Batches for one pass.
    fn batches(&mut self) -> Box<dyn Iterator<Item = B> + '_>;

    /// Called before a pass when a sampler seed is set for the epoch.
    fn reseed(&mut self, _seed: u64) {}

    /// Number of batches in one pass, when known up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

impl<B: Clone> DataSource<B> for Vec<B> {
    fn batches(&mut self) -> Box<dyn Iterator<Item = B> + '_> {
        Box::new(self.iter().cloned())
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.len())
    }
}

/// Rank-aware view over a dataset: every rank sees a disjoint, equally sized
/// shard, reshuffled whenever the source is reseeded.
#[derive(Debug, Clone)]
pub struct ShardedSource<B> {
    items: Vec<B>,
    dist: DistContext,
    shuffle: bool,
    seed: u64,
}

impl<B: Clone> ShardedSource<B> {
    pub fn new(items: Vec<B>, dist: DistContext) -> Self {
        Self {
            items,
            dist,
            shuffle: false,
            seed: 0,
        }
    }

    pub fn shuffled(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Indices this rank visits in the current pass.
    ///
    /// The index list is padded by wrapping around to a multiple of the world
    /// size before striding, so every rank yields the same number of items.
    pub fn indices(&self) -> Vec<usize> {
        let len = self.items.len();
        if len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        }
        let world = self.dist.world_size();
        let total = len.div_ceil(world) * world;
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();
        padded
            .into_iter()
            .skip(self.dist.rank())
            .step_by(world)
            .collect()
    }
}

impl<B: Clone> DataSource<B> for ShardedSource<B> {
    fn batches(&mut self) -> Box<dyn Iterator<Item = B> + '_> {
        let items = &self.items;
        Box::new(self.indices().into_iter().map(move |i| items[i].clone()))
    }

    fn reseed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.items.len().div_ceil(self.dist.world_size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_vec_source_repeats_each_pass() {
        let mut source = vec![1, 2, 3];
        let first: Vec<_> = source.batches().collect();
        let second: Vec<_> = source.batches().collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, second);
        assert_eq!(source.len_hint(), Some(3));
    }

    #[test]
    fn test_shards_cover_dataset_evenly() {
        let items: Vec<u32> = (0..10).collect();
        let world = 3;
        let mut seen = BTreeSet::new();
        for rank in 0..world {
            let mut shard =
                ShardedSource::new(items.clone(), DistContext::new(rank, world).unwrap());
            let batch: Vec<_> = shard.batches().collect();
            assert_eq!(batch.len(), 4);
            assert_eq!(shard.len_hint(), Some(4));
            seen.extend(batch);
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn test_reseed_changes_order_deterministically() {
        let items: Vec<u32> = (0..32).collect();
        let mut a = ShardedSource::new(items.clone(), DistContext::single()).shuffled(true);
        let mut b = ShardedSource::new(items, DistContext::single()).shuffled(true);

        a.reseed(7);
        b.reseed(7);
        assert_eq!(a.indices(), b.indices());

        let before = a.indices();
        a.reseed(8);
        assert_ne!(a.indices(), before);
    }

    #[test]
    fn test_empty_shard() {
        let mut shard: ShardedSource<u8> = ShardedSource::new(Vec::new(), DistContext::single());
        assert_eq!(shard.batches().count(), 0);
    }
}
