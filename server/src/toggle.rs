//! # Toggle Coordinator
//!
//! Flips a user's favorite on a post and moves exactly one shard by one, as a single
//! conditional commit.
//!
//! ## Loop
//!
//! 1. Read the membership and its version
//! 2. Present: delete it, decrement a random shard. Absent: create it, increment one
//! 3. Commit, conditional on the version read in step 1
//! 4. Version moved: back off and start over from step 1, up to `max_attempts`
//!
//! ## Same-user races
//!
//! Two tabs or a double click may toggle the same (post, user) at once. Both read
//! "absent", only the first commit passes the version check, and the second re-reads
//! and sees the first one's work. With no `observed` state it then removes (a true
//! toggle). With `observed` it notices the flip it wanted already happened and
//! returns without writing.
//!
//! ## Timeouts
//!
//! Giving up on the response does not undo a commit. Callers that time out must
//! re-read [`Favorites::is_favorited`] rather than assume a rollback.
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{
    config::FavoritesConfig,
    error::{FavoriteError, StoreError},
    events::{EventEmitter, FavoriteEvent},
    models::{
        Delta, Membership, MembershipKey, PostId, ShardCounter, ToggleAction, ToggleOutcome,
        UserId,
    },
    posts::PostDirectory,
    shards::{ShardPicker, aggregate},
    store::{Commit, FavoriteStore},
};

pub struct Favorites {
    pub(crate) store: Arc<dyn FavoriteStore>,
    pub(crate) posts: Arc<dyn PostDirectory>,
    pub(crate) picker: ShardPicker,
    pub(crate) events: Option<EventEmitter>,
    pub(crate) config: FavoritesConfig,
    pub(crate) suspicious: Mutex<BTreeSet<PostId>>,
}

impl Favorites {
    pub fn new(
        store: Arc<dyn FavoriteStore>,
        posts: Arc<dyn PostDirectory>,
        config: FavoritesConfig,
    ) -> Self {
        Self {
            store,
            posts,
            picker: ShardPicker::new(config.shard_count),
            events: None,
            config,
            suspicious: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_picker(mut self, picker: ShardPicker) -> Self {
        self.picker = picker;
        self
    }

    pub fn config(&self) -> &FavoritesConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FavoriteStore> {
        &self.store
    }

    pub async fn toggle_favorite(
        &self,
        post_id: &PostId,
        user_id: &UserId,
        observed: Option<bool>,
    ) -> Result<ToggleOutcome, FavoriteError> {
        let favoritable = self
            .posts
            .is_public_post(post_id)
            .await
            .map_err(|source| FavoriteError::ToggleFailed {
                attempts: 0,
                source,
            })?;

        if !favoritable {
            return Err(FavoriteError::PostNotFavoritable(post_id.clone()));
        }

        let key = MembershipKey::new(post_id, user_id);
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.attempt_toggle(&key, observed).await {
                Ok(outcome) => {
                    if outcome.applied {
                        self.emit(post_id, outcome.action);
                    }

                    debug!(
                        "Toggle {post_id}/{user_id}: {:?} (applied: {}, attempt {attempt})",
                        outcome.action, outcome.applied
                    );
                    return Ok(outcome);
                }
                Err(StoreError::Conflict(conflict_key)) if attempt < max_attempts => {
                    debug!("Conflict on {conflict_key}, retrying (attempt {attempt})");
                    sleep(self.backoff(attempt)).await;
                }
                Err(source) => {
                    warn!("Toggle {post_id}/{user_id} failed after {attempt} attempt(s): {source}");
                    return Err(FavoriteError::ToggleFailed {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    async fn attempt_toggle(
        &self,
        key: &MembershipKey,
        observed: Option<bool>,
    ) -> Result<ToggleOutcome, StoreError> {
        let snapshot = self.store.read_membership(key).await?;
        let favorited = snapshot.membership.is_some();

        if let Some(observed) = observed {
            if observed != favorited {
                return Ok(ToggleOutcome {
                    action: if favorited {
                        ToggleAction::Added
                    } else {
                        ToggleAction::Removed
                    },
                    is_favorited: favorited,
                    applied: false,
                });
            }
        }

        let (membership, delta, action) = if favorited {
            (None, Delta::Decrement, ToggleAction::Removed)
        } else {
            (Some(Membership::now()), Delta::Increment, ToggleAction::Added)
        };

        let shard_id = self.picker.pick();

        #[cfg(feature = "verbose")]
        debug!("Committing {delta:?} to shard {shard_id} of post {}", key.post_id);

        self.store
            .commit(Commit {
                key: key.clone(),
                expected_version: snapshot.version,
                membership,
                shard_id,
                delta,
            })
            .await?;

        Ok(ToggleOutcome {
            action,
            is_favorited: !favorited,
            applied: true,
        })
    }

    fn emit(&self, post_id: &PostId, action: ToggleAction) {
        let Some(events) = &self.events else {
            return;
        };

        events.emit(FavoriteEvent {
            post_id: post_id.clone(),
            delta: match action {
                ToggleAction::Added => Delta::Increment,
                ToggleAction::Removed => Delta::Decrement,
            },
        });
    }

    /// Exponential in the attempt number plus up to one base period of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base;
        let exponential = base.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter_ceiling = base.as_micros().max(1) as u64;
        let jitter = Duration::from_micros(rand::thread_rng().gen_range(0..jitter_ceiling));

        exponential + jitter
    }

    pub async fn is_favorited(
        &self,
        post_id: &PostId,
        user_id: &UserId,
    ) -> Result<bool, FavoriteError> {
        let snapshot = self
            .store
            .read_membership(&MembershipKey::new(post_id, user_id))
            .await?;

        Ok(snapshot.membership.is_some())
    }

    pub async fn favorite_count(&self, post_id: &PostId) -> Result<u64, FavoriteError> {
        let aggregate = aggregate(self.store.as_ref(), post_id).await?;

        if aggregate.has_negative_shard() {
            self.suspicious.lock().insert(post_id.clone());
        }

        Ok(aggregate.count())
    }

    pub async fn shard_snapshot(&self, post_id: &PostId) -> Result<Vec<ShardCounter>, FavoriteError> {
        Ok(self.store.shards(post_id).await?)
    }
}
