use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Commit, FavoriteStore, Rebuild, Snapshot, Version};
use crate::{
    error::StoreError,
    models::{Membership, MembershipKey, PostId, ShardCounter, ShardId, UserId},
    shards::distribute,
};

#[derive(Debug, Default)]
struct Slot {
    membership: Option<Membership>,
    version: Version,
}

#[derive(Debug, Default)]
struct Inner {
    memberships: HashMap<PostId, HashMap<UserId, Slot>>,
    shards: HashMap<PostId, BTreeMap<ShardId, i64>>,
    display: HashMap<PostId, u64>,
}

/// Process-local store. Validation and apply happen under one write lock, so a commit
/// is atomic with respect to every other reader and writer.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn count_memberships(&self, post_id: &PostId) -> u64 {
        self.memberships
            .get(post_id)
            .map(|users| {
                users
                    .values()
                    .filter(|slot| slot.membership.is_some())
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl FavoriteStore for MemoryStore {
    async fn read_membership(&self, key: &MembershipKey) -> Result<Snapshot, StoreError> {
        let inner = self.inner.read();
        let slot = inner
            .memberships
            .get(&key.post_id)
            .and_then(|users| users.get(&key.user_id));

        Ok(match slot {
            Some(slot) => Snapshot {
                membership: slot.membership.clone(),
                version: slot.version,
            },
            None => Snapshot {
                membership: None,
                version: 0,
            },
        })
    }

    async fn commit(&self, commit: Commit) -> Result<Version, StoreError> {
        let mut inner = self.inner.write();

        let slot = inner
            .memberships
            .entry(commit.key.post_id.clone())
            .or_default()
            .entry(commit.key.user_id.clone())
            .or_default();

        if slot.version != commit.expected_version {
            return Err(StoreError::Conflict(format!(
                "favorite:{}:{}",
                commit.key.post_id, commit.key.user_id
            )));
        }

        slot.membership = commit.membership;
        slot.version += 1;
        let version = slot.version;

        *inner
            .shards
            .entry(commit.key.post_id)
            .or_default()
            .entry(commit.shard_id)
            .or_insert(0) += commit.delta.as_i64();

        Ok(version)
    }

    async fn shards(&self, post_id: &PostId) -> Result<Vec<ShardCounter>, StoreError> {
        let inner = self.inner.read();

        Ok(inner
            .shards
            .get(post_id)
            .map(|shards| {
                shards
                    .iter()
                    .map(|(&shard_id, &count)| ShardCounter { shard_id, count })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_memberships(&self, post_id: &PostId) -> Result<u64, StoreError> {
        Ok(self.inner.read().count_memberships(post_id))
    }

    async fn overwrite_shards(&self, post_id: &PostId, counts: &[i64]) -> Result<(), StoreError> {
        let shards = counts
            .iter()
            .enumerate()
            .map(|(shard_id, &count)| (shard_id as ShardId, count))
            .collect();

        self.inner.write().shards.insert(post_id.clone(), shards);
        Ok(())
    }

    async fn rebuild_shards(
        &self,
        post_id: &PostId,
        shard_count: u32,
    ) -> Result<Rebuild, StoreError> {
        let mut inner = self.inner.write();

        let total = inner.count_memberships(post_id);
        let before = inner
            .shards
            .get(post_id)
            .map(|shards| shards.values().sum::<i64>())
            .unwrap_or(0);

        let shards = distribute(total, shard_count)
            .into_iter()
            .enumerate()
            .map(|(shard_id, count)| (shard_id as ShardId, count))
            .collect();
        inner.shards.insert(post_id.clone(), shards);
        inner.display.insert(post_id.clone(), total);

        Ok(Rebuild { before, total })
    }

    async fn posts(&self) -> Result<Vec<PostId>, StoreError> {
        let inner = self.inner.read();

        let mut posts: Vec<PostId> = inner
            .memberships
            .keys()
            .chain(inner.shards.keys())
            .cloned()
            .collect();
        posts.sort();
        posts.dedup();

        Ok(posts)
    }

    async fn display_count(&self, post_id: &PostId) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.read().display.get(post_id).copied())
    }

    async fn set_display_count(&self, post_id: &PostId, count: u64) -> Result<(), StoreError> {
        self.inner.write().display.insert(post_id.clone(), count);
        Ok(())
    }
}
