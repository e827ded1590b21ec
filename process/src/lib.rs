//! # Favorite Reconciliation
//!
//! Batch job that rebuilds shard counters from memberships.
//!
//! ## When
//!
//! - On a schedule, as a backstop to the server's own suspicious-post pass
//! - On demand for specific posts, e.g. after a negative shard shows up in the logs
//! - After changing `FAVORITE_SHARDS`, so every post is redistributed over the new N
//!
//! ## Steps
//!
//! 1. Pick targets: the posts given, the suspicious posts, or every post with
//!    favorite state.
//!
//! 2. For each post, count memberships and overwrite its shards with that total
//!    spread evenly, then refresh the display cache.
//!
//! 3. A post that fails is reported and left for the next run. The job keeps going.
use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use server::{
    config::Config,
    database::init_redis,
    models::PostId,
    posts::RedisPosts,
    reconcile::PassSummary,
    store::RedisStore,
    toggle::Favorites,
};

pub enum Targets {
    All,
    Suspicious,
    Posts(Vec<PostId>),
}

pub async fn connect() -> Result<Favorites> {
    let config = Config::load()?;
    let redis_connection = init_redis(&config.redis_url).await?;

    Ok(Favorites::new(
        Arc::new(RedisStore::new(redis_connection.clone())),
        Arc::new(RedisPosts::new(redis_connection)),
        config.favorites,
    ))
}

pub async fn resolve_targets(favorites: &Favorites, targets: Targets) -> Result<Vec<PostId>> {
    Ok(match targets {
        Targets::Posts(posts) => posts,
        Targets::All => favorites.store().posts().await?,
        Targets::Suspicious => {
            let mut suspicious = Vec::new();
            for post_id in favorites.store().posts().await? {
                match favorites.is_suspicious(&post_id).await {
                    Ok(true) => suspicious.push(post_id),
                    Ok(false) => {}
                    Err(e) => warn!("Could not inspect post {post_id}, skipping: {e}"),
                }
            }
            suspicious
        }
    })
}

pub fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );

    pb
}

pub async fn reconcile_with_progress(
    favorites: &Favorites,
    posts: Vec<PostId>,
    pb: &ProgressBar,
) -> PassSummary {
    let mut summary = PassSummary::default();

    for post_id in posts {
        pb.set_message(format!("Reconciling {post_id}"));

        let pass = favorites.reconcile_posts(vec![post_id]).await;
        summary.reconciled.extend(pass.reconciled);
        summary.failed.extend(pass.failed);

        pb.inc(1);
    }

    pb.finish_with_message("Done");
    summary
}

pub async fn run(targets: Targets) -> Result<PassSummary> {
    let favorites = connect().await?;
    info!("Connected, shard count {}", favorites.config().shard_count);

    let posts = resolve_targets(&favorites, targets).await?;
    println!("Posts to reconcile: {}", posts.len());

    let pb = progress_bar(posts.len());
    let summary = reconcile_with_progress(&favorites, posts, &pb).await;

    println!("Reconciled: {}", summary.reconciled.len());
    println!("Corrected: {}", summary.corrected());

    if !summary.failed.is_empty() {
        println!("Failed: {}", summary.failed.len());
        for post_id in &summary.failed {
            println!("  {post_id}");
        }
    }

    Ok(summary)
}
