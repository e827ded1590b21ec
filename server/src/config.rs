use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

pub const MAX_SHARDS: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Redis,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("unknown store {other:?}, expected redis or memory")),
        }
    }
}

/// Tunables of the favorite engine itself, independent of how the server is deployed.
#[derive(Debug, Clone)]
pub struct FavoritesConfig {
    pub shard_count: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub drift_threshold: u64,
    pub event_queue_capacity: usize,
}

impl Default for FavoritesConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            max_attempts: 5,
            backoff_base: Duration::from_millis(5),
            drift_threshold: 0,
            event_queue_capacity: 1024,
        }
    }
}

impl FavoritesConfig {
    pub fn with_shards(shard_count: u32) -> Self {
        Self {
            shard_count,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || self.shard_count > MAX_SHARDS {
            bail!(
                "FAVORITE_SHARDS must be within 1..={MAX_SHARDS}, got {}",
                self.shard_count
            );
        }

        if self.max_attempts == 0 {
            bail!("TOGGLE_MAX_ATTEMPTS must be at least 1");
        }

        Ok(())
    }
}

pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub redis_url: String,
    pub toggle_timeout: Duration,
    pub reconcile_interval: Duration,
    pub favorites: FavoritesConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        let favorites = FavoritesConfig {
            shard_count: try_load("FAVORITE_SHARDS", "16")?,
            max_attempts: try_load("TOGGLE_MAX_ATTEMPTS", "5")?,
            backoff_base: Duration::from_millis(try_load("TOGGLE_BACKOFF_MS", "5")?),
            drift_threshold: try_load("DRIFT_THRESHOLD", "0")?,
            event_queue_capacity: try_load("EVENT_QUEUE_CAPACITY", "1024")?,
        };
        favorites.validate()?;

        let redis_url: String = try_load("REDIS_URL", "redis://redis:6379")?;

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            store: try_load("STORE", "redis")?,
            redis_url: with_password(&redis_url, read_secret("REDIS_PASSWORD")),
            toggle_timeout: Duration::from_millis(try_load("TOGGLE_TIMEOUT_MS", "2000")?),
            reconcile_interval: Duration::from_secs(try_load("RECONCILE_INTERVAL_SECS", "300")?),
            favorites,
        })
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

pub fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("Invalid {key} value: {raw}"))
}

/// Secrets are optional, a missing file just means the deployment has none.
fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .map_err(|e| {
            info!("No {secret_name} secret loaded: {e}");
        })
        .ok()
        .filter(|s| !s.is_empty())
}

fn with_password(redis_url: &str, password: Option<String>) -> String {
    match (password, redis_url.strip_prefix("redis://")) {
        (Some(password), Some(rest)) if !rest.contains('@') => {
            format!("redis://:{password}@{rest}")
        }
        _ => redis_url.to_string(),
    }
}
