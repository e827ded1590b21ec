use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::info;

use super::{
    config::{Config, StoreKind},
    database::init_redis,
    events::{EventEmitter, MemoryTagStats, RedisTagStats, TagStatsSink, spawn_tag_worker},
    posts::{OpenPosts, PostDirectory, RedisPosts},
    store::{FavoriteStore, MemoryStore, RedisStore},
    toggle::Favorites,
};

pub struct State {
    pub config: Config,
    pub favorites: Arc<Favorites>,
    pub tag_worker: JoinHandle<()>,
}

impl State {
    pub async fn new() -> Result<Arc<Self>> {
        let config = Config::load()?;

        let (store, posts, tag_stats): (
            Arc<dyn FavoriteStore>,
            Arc<dyn PostDirectory>,
            Arc<dyn TagStatsSink>,
        ) = match config.store {
            StoreKind::Redis => {
                let redis_connection = init_redis(&config.redis_url).await?;
                info!("Connected to Redis");

                (
                    Arc::new(RedisStore::new(redis_connection.clone())),
                    Arc::new(RedisPosts::new(redis_connection.clone())),
                    Arc::new(RedisTagStats::new(redis_connection)),
                )
            }
            StoreKind::Memory => {
                info!("Using in-memory store, nothing will persist");

                (
                    Arc::new(MemoryStore::new()),
                    Arc::new(OpenPosts),
                    Arc::new(MemoryTagStats::new()),
                )
            }
        };

        Ok(Arc::new(Self::with_parts(config, store, posts, tag_stats)))
    }

    pub fn with_parts(
        config: Config,
        store: Arc<dyn FavoriteStore>,
        posts: Arc<dyn PostDirectory>,
        tag_stats: Arc<dyn TagStatsSink>,
    ) -> Self {
        let (events, receiver) = EventEmitter::channel(config.favorites.event_queue_capacity);
        let tag_worker = spawn_tag_worker(receiver, posts.clone(), tag_stats);

        let favorites =
            Favorites::new(store, posts, config.favorites.clone()).with_events(events);

        Self {
            config,
            favorites: Arc::new(favorites),
            tag_worker,
        }
    }
}
