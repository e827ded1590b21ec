//! # Tag Statistics Events
//!
//! After an applied toggle the post's tags gain or lose one favorite. That bookkeeping
//! is best effort: the toggle only drops an event on a bounded channel and moves on.
//! A background worker resolves the post's tags and forwards one delta per tag.
//!
//! A full or closed channel drops the event with a warning. Tag stats drift in that
//! case; favorites never do.
use std::{collections::HashMap, sync::Arc};

use ::redis::{AsyncCommands, aio::ConnectionManager};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::{
    sync::mpsc::{self, Receiver, Sender, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::StoreError,
    models::{Delta, PostId, TagId},
    posts::PostDirectory,
};

const TAG_FAVORITES_KEY: &str = "tag_favorites";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FavoriteEvent {
    pub post_id: PostId,
    pub delta: Delta,
}

#[async_trait]
pub trait TagStatsSink: Send + Sync + 'static {
    async fn favorite_delta(&self, tag_id: &TagId, delta: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryTagStats {
    totals: RwLock<HashMap<TagId, i64>>,
}

impl MemoryTagStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, tag_id: &str) -> i64 {
        self.totals.read().get(tag_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TagStatsSink for MemoryTagStats {
    async fn favorite_delta(&self, tag_id: &TagId, delta: i64) -> Result<(), StoreError> {
        *self.totals.write().entry(tag_id.clone()).or_insert(0) += delta;
        Ok(())
    }
}

pub struct RedisTagStats {
    connection: ConnectionManager,
}

impl RedisTagStats {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TagStatsSink for RedisTagStats {
    async fn favorite_delta(&self, tag_id: &TagId, delta: i64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.hincr(TAG_FAVORITES_KEY, tag_id, delta).await?;

        Ok(())
    }
}

/// Sending half handed to the toggle coordinator. Never blocks.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Sender<FavoriteEvent>,
}

impl EventEmitter {
    pub fn channel(capacity: usize) -> (Self, Receiver<FavoriteEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: FavoriteEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Tag event queue full, dropping delta for post {}", event.post_id);
            }
            Err(TrySendError::Closed(event)) => {
                warn!("Tag event worker gone, dropping delta for post {}", event.post_id);
            }
        }
    }
}

pub fn spawn_tag_worker(
    mut receiver: Receiver<FavoriteEvent>,
    posts: Arc<dyn PostDirectory>,
    sink: Arc<dyn TagStatsSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            forward(&event, posts.as_ref(), sink.as_ref()).await;
        }

        info!("Tag event worker stopped");
    })
}

async fn forward(event: &FavoriteEvent, posts: &dyn PostDirectory, sink: &dyn TagStatsSink) {
    let tags = match posts.post_tags(&event.post_id).await {
        Ok(tags) => tags,
        Err(e) => {
            warn!("Failed to load tags for post {}: {e}", event.post_id);
            return;
        }
    };

    for tag_id in tags {
        if let Err(e) = sink.favorite_delta(&tag_id, event.delta.as_i64()).await {
            warn!("Failed to record favorite delta for tag {tag_id}: {e}");
            continue;
        }

        debug!("Tag {tag_id} favorite delta {}", event.delta.as_i64());
    }
}
