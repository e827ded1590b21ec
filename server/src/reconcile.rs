//! # Reconciliation
//!
//! Shards drift when something writes them that should not, or when N changes.
//! Reconciliation counts the memberships of a post, which are the truth, spreads that
//! total over the N shards and overwrites them. Count and overwrite are one atomic
//! store operation, so a toggle commits either entirely before the rebuild (and is
//! counted) or entirely after it (and lands on the rebuilt shards). Toggles never
//! wait on it.
//!
//! Failures stay internal: they are logged and the post is retried on the next pass.
use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::interval};
use tracing::{error, info, warn};

use crate::{
    error::FavoriteError,
    models::{PostId, ReconcileReport},
    shards::aggregate,
    store::Rebuild,
    toggle::Favorites,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub reconciled: Vec<ReconcileReport>,
    pub failed: Vec<PostId>,
}

impl PassSummary {
    pub fn corrected(&self) -> usize {
        self.reconciled
            .iter()
            .filter(|report| report.before != report.after as i64)
            .count()
    }
}

impl Favorites {
    pub async fn reconcile(&self, post_id: &PostId) -> Result<ReconcileReport, FavoriteError> {
        let failed = |source| FavoriteError::ReconciliationFailed {
            post_id: post_id.clone(),
            source,
        };

        let Rebuild { before, total } = self
            .store
            .rebuild_shards(post_id, self.config.shard_count)
            .await
            .map_err(failed)?;

        self.suspicious.lock().remove(post_id);

        if before != total as i64 {
            info!("Reconciled post {post_id}: shards summed to {before}, corrected to {total}");
        }

        Ok(ReconcileReport {
            post_id: post_id.clone(),
            before,
            after: total,
        })
    }

    /// Copies the live aggregate into the post's display cache.
    pub async fn refresh_display_count(&self, post_id: &PostId) -> Result<u64, FavoriteError> {
        let count = self.favorite_count(post_id).await?;
        self.store.set_display_count(post_id, count).await?;

        Ok(count)
    }

    pub async fn display_count(&self, post_id: &PostId) -> Result<Option<u64>, FavoriteError> {
        Ok(self.store.display_count(post_id).await?)
    }

    /// Negative shard, or a display cache further than the drift threshold from the shards.
    pub async fn is_suspicious(&self, post_id: &PostId) -> Result<bool, FavoriteError> {
        if self.suspicious.lock().contains(post_id) {
            return Ok(true);
        }

        let aggregate = aggregate(self.store.as_ref(), post_id).await?;
        if aggregate.has_negative_shard() {
            return Ok(true);
        }

        let Some(cached) = self.store.display_count(post_id).await? else {
            return Ok(false);
        };

        Ok(cached.abs_diff(aggregate.count()) > self.config.drift_threshold)
    }

    pub async fn reconcile_all(&self) -> Result<PassSummary, FavoriteError> {
        let posts = self.store.posts().await?;
        Ok(self.reconcile_posts(posts).await)
    }

    pub async fn reconcile_suspicious(&self) -> Result<PassSummary, FavoriteError> {
        let mut targets = Vec::new();

        for post_id in self.store.posts().await? {
            match self.is_suspicious(&post_id).await {
                Ok(true) => targets.push(post_id),
                Ok(false) => {}
                Err(e) => warn!("Could not inspect post {post_id}: {e}"),
            }
        }

        Ok(self.reconcile_posts(targets).await)
    }

    pub async fn reconcile_posts(&self, posts: Vec<PostId>) -> PassSummary {
        let mut summary = PassSummary::default();

        for post_id in posts {
            match self.reconcile(&post_id).await {
                Ok(report) => summary.reconciled.push(report),
                Err(e) => {
                    error!("{e}, will retry next pass");
                    summary.failed.push(post_id);
                }
            }
        }

        summary
    }
}

/// Periodic pass over suspicious posts. The first tick fires immediately.
pub fn spawn_reconciler(favorites: Arc<Favorites>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;

            match favorites.reconcile_suspicious().await {
                Ok(summary) if summary.reconciled.is_empty() && summary.failed.is_empty() => {}
                Ok(summary) => info!(
                    "Reconciliation pass: {} reconciled ({} corrected), {} failed",
                    summary.reconciled.len(),
                    summary.corrected(),
                    summary.failed.len()
                ),
                Err(e) => error!("Reconciliation pass aborted: {e}"),
            }
        }
    })
}
