//! # Shards
//!
//! A post's favorite count lives in N counter cells instead of one. Every toggle
//! lands on a uniformly random cell, so concurrent favorites on a hot post spread
//! their writes N ways. The displayed count is the sum over all cells, computed at
//! read time.
use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::StdRng, thread_rng};
use tracing::warn;

use crate::{
    error::StoreError,
    models::{PostId, ShardCounter, ShardId},
    store::FavoriteStore,
};

pub struct ShardPicker {
    shard_count: u32,
    rng: PickerRng,
}

/// Live picks use the thread-local generator. Only a seeded picker shares one
/// sequence behind a lock.
enum PickerRng {
    ThreadLocal,
    Seeded(Mutex<StdRng>),
}

impl ShardPicker {
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
            rng: PickerRng::ThreadLocal,
        }
    }

    /// Deterministic picks, for simulations.
    pub fn seeded(shard_count: u32, seed: u64) -> Self {
        Self {
            shard_count: shard_count.max(1),
            rng: PickerRng::Seeded(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn pick(&self) -> ShardId {
        match &self.rng {
            PickerRng::ThreadLocal => thread_rng().gen_range(0..self.shard_count),
            PickerRng::Seeded(rng) => rng.lock().gen_range(0..self.shard_count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub shards: Vec<ShardCounter>,
    pub raw_sum: i64,
}

impl Aggregate {
    pub fn has_negative_shard(&self) -> bool {
        self.shards.iter().any(|shard| shard.count < 0)
    }

    /// Negative totals only exist while drift awaits reconciliation.
    pub fn count(&self) -> u64 {
        self.raw_sum.max(0) as u64
    }
}

pub async fn aggregate(store: &dyn FavoriteStore, post_id: &PostId) -> Result<Aggregate, StoreError> {
    let shards = store.shards(post_id).await?;
    let raw_sum = shards.iter().map(|shard| shard.count).sum();

    let aggregate = Aggregate { shards, raw_sum };
    if aggregate.has_negative_shard() {
        warn!(
            "Post {post_id} has a negative shard (sum {}), needs reconciliation",
            aggregate.raw_sum
        );
    }

    Ok(aggregate)
}

/// `total / n` per shard, the remainder spread one apiece over the lowest shard ids.
pub fn distribute(total: u64, shard_count: u32) -> Vec<i64> {
    let shard_count = u64::from(shard_count.max(1));
    let base = total / shard_count;
    let remainder = total % shard_count;

    (0..shard_count)
        .map(|shard_id| (base + u64::from(shard_id < remainder)) as i64)
        .collect()
}
