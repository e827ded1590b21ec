//! # Redis
//!
//! RAM database backing memberships, shards and the display cache.
//!
//! ## Layout
//!
//! - `favorites:{post}`: hash, user → membership JSON
//! - `favorite_versions:{post}`: hash, user → membership version
//! - `favorite_shards:{post}`: hash, shard id → signed count
//! - `favorite_posts`: set of every post with favorite state
//! - `favorite_display`: hash, post → cached display count
//!
//! ## Commits
//!
//! The version check and the writes run inside one Lua script, which Redis executes
//! atomically. A multiplexed connection cannot safely hold a `WATCH`, so the script
//! stands in for `WATCH`/`MULTI`/`EXEC`. Rebuilds work the same way: the membership
//! count, the shard overwrite and the display cache write are one script.
use std::collections::HashMap;

use ::redis::{AsyncCommands, Script, aio::ConnectionManager};
use async_trait::async_trait;

use super::{Commit, FavoriteStore, Rebuild, Snapshot, Version};
use crate::{
    error::StoreError,
    models::{Membership, MembershipKey, PostId, ShardCounter, ShardId},
};

const POSTS_KEY: &str = "favorite_posts";
const DISPLAY_KEY: &str = "favorite_display";

const COMMIT_SCRIPT: &str = r#"
local current = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0')
if current ~= tonumber(ARGV[2]) then
    return -1
end
if ARGV[3] == '' then
    redis.call('HDEL', KEYS[1], ARGV[1])
else
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
end
redis.call('HINCRBY', KEYS[3], ARGV[4], ARGV[5])
redis.call('SADD', KEYS[4], ARGV[6])
return redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
"#;

const REBUILD_SCRIPT: &str = r#"
local total = redis.call('HLEN', KEYS[1])
local before = 0
for _, count in ipairs(redis.call('HVALS', KEYS[2])) do
    before = before + tonumber(count)
end
local shards = tonumber(ARGV[1])
local base = math.floor(total / shards)
local remainder = total % shards
redis.call('DEL', KEYS[2])
for shard = 0, shards - 1 do
    local count = base
    if shard < remainder then
        count = count + 1
    end
    redis.call('HSET', KEYS[2], shard, count)
end
redis.call('HSET', KEYS[3], ARGV[2], total)
return {before, total}
"#;

fn memberships_key(post_id: &PostId) -> String {
    format!("favorites:{post_id}")
}

fn versions_key(post_id: &PostId) -> String {
    format!("favorite_versions:{post_id}")
}

fn shards_key(post_id: &PostId) -> String {
    format!("favorite_shards:{post_id}")
}

pub struct RedisStore {
    connection: ConnectionManager,
    commit_script: Script,
    rebuild_script: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            commit_script: Script::new(COMMIT_SCRIPT),
            rebuild_script: Script::new(REBUILD_SCRIPT),
        }
    }
}

fn decode_membership(key: &MembershipKey, raw: &str) -> Result<Membership, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: format!("{}[{}]", memberships_key(&key.post_id), key.user_id),
        reason: e.to_string(),
    })
}

#[async_trait]
impl FavoriteStore for RedisStore {
    async fn read_membership(&self, key: &MembershipKey) -> Result<Snapshot, StoreError> {
        let mut conn = self.connection.clone();

        let (raw, version): (Option<String>, Option<Version>) = ::redis::pipe()
            .atomic()
            .hget(memberships_key(&key.post_id), key.user_id.as_str())
            .hget(versions_key(&key.post_id), key.user_id.as_str())
            .query_async(&mut conn)
            .await?;

        let membership = raw
            .map(|raw| decode_membership(key, &raw))
            .transpose()?;

        Ok(Snapshot {
            membership,
            version: version.unwrap_or(0),
        })
    }

    async fn commit(&self, commit: Commit) -> Result<Version, StoreError> {
        let mut conn = self.connection.clone();
        let post_id = &commit.key.post_id;

        let document = match &commit.membership {
            Some(membership) => {
                serde_json::to_string(membership).map_err(|e| StoreError::Corrupt {
                    key: memberships_key(post_id),
                    reason: e.to_string(),
                })?
            }
            None => String::new(),
        };

        let version: i64 = self
            .commit_script
            .key(memberships_key(post_id))
            .key(versions_key(post_id))
            .key(shards_key(post_id))
            .key(POSTS_KEY)
            .arg(commit.key.user_id.as_str())
            .arg(commit.expected_version)
            .arg(document)
            .arg(commit.shard_id)
            .arg(commit.delta.as_i64())
            .arg(post_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if version < 0 {
            return Err(StoreError::Conflict(format!(
                "{}[{}]",
                versions_key(post_id),
                commit.key.user_id
            )));
        }

        Ok(version as Version)
    }

    async fn shards(&self, post_id: &PostId) -> Result<Vec<ShardCounter>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: HashMap<ShardId, i64> = conn.hgetall(shards_key(post_id)).await?;

        let mut shards: Vec<ShardCounter> = raw
            .into_iter()
            .map(|(shard_id, count)| ShardCounter { shard_id, count })
            .collect();
        shards.sort_by_key(|shard| shard.shard_id);

        Ok(shards)
    }

    async fn count_memberships(&self, post_id: &PostId) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = conn.hlen(memberships_key(post_id)).await?;

        Ok(count)
    }

    async fn overwrite_shards(&self, post_id: &PostId, counts: &[i64]) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let key = shards_key(post_id);

        let items: Vec<(ShardId, i64)> = counts
            .iter()
            .enumerate()
            .map(|(shard_id, &count)| (shard_id as ShardId, count))
            .collect();

        let mut pipe = ::redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !items.is_empty() {
            pipe.hset_multiple(&key, &items[..]).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn rebuild_shards(
        &self,
        post_id: &PostId,
        shard_count: u32,
    ) -> Result<Rebuild, StoreError> {
        let mut conn = self.connection.clone();

        let (before, total): (i64, u64) = self
            .rebuild_script
            .key(memberships_key(post_id))
            .key(shards_key(post_id))
            .key(DISPLAY_KEY)
            .arg(shard_count.max(1))
            .arg(post_id.as_str())
            .invoke_async(&mut conn)
            .await?;

        Ok(Rebuild { before, total })
    }

    async fn posts(&self) -> Result<Vec<PostId>, StoreError> {
        let mut conn = self.connection.clone();
        let mut posts: Vec<String> = conn.smembers(POSTS_KEY).await?;
        posts.sort();

        Ok(posts.into_iter().map(PostId::new).collect())
    }

    async fn display_count(&self, post_id: &PostId) -> Result<Option<u64>, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<u64> = conn.hget(DISPLAY_KEY, post_id.as_str()).await?;

        Ok(count)
    }

    async fn set_display_count(&self, post_id: &PostId, count: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.hset(DISPLAY_KEY, post_id.as_str(), count).await?;

        Ok(())
    }
}
