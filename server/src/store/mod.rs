//! # Favorite Store
//!
//! Persistence seam for memberships, shard counters and the display cache.
//!
//! ## Records
//!
//! - Membership: one document per (post, user). Present means favorited. Each key
//!   carries a version that bumps on every committed change, deletes included, so a
//!   reader can tell "still absent" apart from "removed and re-added".
//! - Shards: N signed counters per post, created lazily by the first delta.
//! - Display cache: the denormalized count shown on the post, refreshed out-of-band.
//!
//! ## Commits
//!
//! [`FavoriteStore::commit`] is a conditional write: the membership change and the
//! single shard delta apply together only if the membership version still matches
//! what the caller read. Otherwise nothing is written and [`StoreError::Conflict`]
//! comes back. Retrying is the caller's business.
//!
//! [`FavoriteStore::rebuild_shards`] is the other atomic write: it counts the
//! memberships and replaces the shards and display cache with that total in one step,
//! so no commit can land between the count and the overwrite.
use async_trait::async_trait;

use crate::{
    error::StoreError,
    models::{Delta, Membership, MembershipKey, PostId, ShardCounter, ShardId},
};

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

pub type Version = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub membership: Option<Membership>,
    pub version: Version,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub key: MembershipKey,
    pub expected_version: Version,
    /// `Some` writes the membership, `None` deletes it.
    pub membership: Option<Membership>,
    pub shard_id: ShardId,
    pub delta: Delta,
}

/// Shard sum before a rebuild and the membership total written in its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rebuild {
    pub before: i64,
    pub total: u64,
}

#[async_trait]
pub trait FavoriteStore: Send + Sync + 'static {
    async fn read_membership(&self, key: &MembershipKey) -> Result<Snapshot, StoreError>;

    /// Returns the new membership version.
    async fn commit(&self, commit: Commit) -> Result<Version, StoreError>;

    /// Only shards that have been written are returned.
    async fn shards(&self, post_id: &PostId) -> Result<Vec<ShardCounter>, StoreError>;

    async fn count_memberships(&self, post_id: &PostId) -> Result<u64, StoreError>;

    /// Replaces every shard of the post with `counts`, indexed by shard id.
    async fn overwrite_shards(&self, post_id: &PostId, counts: &[i64]) -> Result<(), StoreError>;

    /// Atomically: count memberships, spread the total over `shard_count` shards
    /// (see [`crate::shards::distribute`]), overwrite the shards and cache the total as
    /// the display count.
    async fn rebuild_shards(&self, post_id: &PostId, shard_count: u32)
    -> Result<Rebuild, StoreError>;

    /// Posts that have ever held favorite state.
    async fn posts(&self) -> Result<Vec<PostId>, StoreError>;

    async fn display_count(&self, post_id: &PostId) -> Result<Option<u64>, StoreError>;

    async fn set_display_count(&self, post_id: &PostId, count: u64) -> Result<(), StoreError>;
}
