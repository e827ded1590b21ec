//! # Redis
//!
//! RAM database.
//!
//! Holds favorite memberships, the sharded favorite counters, and the per-tag favorite
//! totals. Post visibility and tags are read from the content service's keys.
//!
//! ## Requirements
//!
//! - O(1) membership lookups per (post, user)
//! - Atomic conditional commits touching one membership and one shard
//! - Cheap fan-in reads, one `HGETALL` over at most N shard fields
use std::time::Duration;

use anyhow::{Context, Result};
use redis::{
    Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url).context("Invalid Redis URL")?;
    let connection_manager = client
        .get_connection_manager_with_config(config)
        .await
        .context("Failed to connect to Redis")?;

    Ok(connection_manager)
}
