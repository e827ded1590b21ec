//! # Posts
//!
//! Posts belong to the content side of the platform. This module only asks two
//! questions of it: can the post be favorited, and which tags does it carry.
//!
//! ## Redis layout (owned by the content service, read-only here)
//!
//! - `post:{post}`: hash with `visibility` (`public` | `private`) and optional `deleted`
//! - `post_tags:{post}`: set of tag ids
use std::collections::HashMap;

use ::redis::{AsyncCommands, aio::ConnectionManager};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    error::StoreError,
    models::{PostId, TagId},
};

#[async_trait]
pub trait PostDirectory: Send + Sync + 'static {
    /// False for missing, private, or soft-deleted posts.
    async fn is_public_post(&self, post_id: &PostId) -> Result<bool, StoreError>;

    async fn post_tags(&self, post_id: &PostId) -> Result<Vec<TagId>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Deleted,
}

#[derive(Debug, Clone)]
struct PostEntry {
    visibility: Visibility,
    tags: Vec<TagId>,
}

/// In-process directory for local runs and tests.
#[derive(Debug, Default)]
pub struct StaticPosts {
    posts: RwLock<HashMap<PostId, PostEntry>>,
}

impl StaticPosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, post_id: PostId, visibility: Visibility, tags: &[&str]) {
        self.posts.write().insert(
            post_id,
            PostEntry {
                visibility,
                tags: tags.iter().map(|tag| tag.to_string()).collect(),
            },
        );
    }

    pub fn with_public(self, post_id: &str, tags: &[&str]) -> Self {
        self.insert(PostId::new(post_id), Visibility::Public, tags);
        self
    }
}

#[async_trait]
impl PostDirectory for StaticPosts {
    async fn is_public_post(&self, post_id: &PostId) -> Result<bool, StoreError> {
        Ok(self
            .posts
            .read()
            .get(post_id)
            .is_some_and(|post| post.visibility == Visibility::Public))
    }

    async fn post_tags(&self, post_id: &PostId) -> Result<Vec<TagId>, StoreError> {
        Ok(self
            .posts
            .read()
            .get(post_id)
            .map(|post| post.tags.clone())
            .unwrap_or_default())
    }
}

/// Treats every post as public and untagged. For local runs without a content service.
#[derive(Debug, Default)]
pub struct OpenPosts;

#[async_trait]
impl PostDirectory for OpenPosts {
    async fn is_public_post(&self, _post_id: &PostId) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn post_tags(&self, _post_id: &PostId) -> Result<Vec<TagId>, StoreError> {
        Ok(Vec::new())
    }
}

/// The content service marks soft deletes with a `deleted` field. Absent, empty, `0`
/// and `false` all mean live.
fn is_soft_deleted(flag: Option<&str>) -> bool {
    match flag.map(str::trim) {
        None | Some("") | Some("0") => false,
        Some(flag) => !flag.eq_ignore_ascii_case("false"),
    }
}

pub struct RedisPosts {
    connection: ConnectionManager,
}

impl RedisPosts {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl PostDirectory for RedisPosts {
    async fn is_public_post(&self, post_id: &PostId) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();

        let (visibility, deleted): (Option<String>, Option<String>) = ::redis::pipe()
            .hget(format!("post:{post_id}"), "visibility")
            .hget(format!("post:{post_id}"), "deleted")
            .query_async(&mut conn)
            .await?;

        Ok(visibility.as_deref() == Some("public") && !is_soft_deleted(deleted.as_deref()))
    }

    async fn post_tags(&self, post_id: &PostId) -> Result<Vec<TagId>, StoreError> {
        let mut conn = self.connection.clone();
        let tags: Vec<TagId> = conn.smembers(format!("post_tags:{post_id}")).await?;

        Ok(tags)
    }
}
