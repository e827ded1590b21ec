//! End-to-end behavior of the favorite engine over the in-memory store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use parking_lot::Mutex;
use server::{
    app,
    config::{Config, FavoritesConfig, StoreKind},
    error::{FavoriteError, INTERNAL_ERROR_BODY, StoreError},
    events::{MemoryTagStats, TagStatsSink},
    models::{MembershipKey, PostId, ShardCounter, TagId, ToggleAction, UserId},
    posts::{StaticPosts, Visibility},
    shards::ShardPicker,
    state::State,
    store::{Commit, FavoriteStore, MemoryStore, Rebuild, Snapshot, Version},
    toggle::Favorites,
};
use tokio::sync::Notify;
use tower::ServiceExt;

fn user(id: &str) -> UserId {
    UserId::authenticated(Some(id)).unwrap()
}

fn fast_config(shards: u32) -> FavoritesConfig {
    FavoritesConfig {
        backoff_base: Duration::from_millis(1),
        ..FavoritesConfig::with_shards(shards)
    }
}

fn engine(store: Arc<dyn FavoriteStore>, shards: u32) -> Arc<Favorites> {
    Arc::new(Favorites::new(
        store,
        Arc::new(StaticPosts::new().with_public("p", &["rust"])),
        fast_config(shards),
    ))
}

/// Delegates everything to a [`MemoryStore`] but can be told to misbehave on commit
/// or rebuild.
struct FaultyStore {
    inner: MemoryStore,
    fault: Fault,
}

enum Fault {
    AlwaysConflict,
    Unavailable,
    SlowCommit(Duration),
    /// Rebuild signals `reached`, then waits for `release` before touching the store.
    PausedRebuild(Arc<Gate>),
    BrokenRebuild,
}

#[derive(Default)]
struct Gate {
    reached: Notify,
    release: Notify,
}

#[async_trait]
impl FavoriteStore for FaultyStore {
    async fn read_membership(&self, key: &MembershipKey) -> Result<Snapshot, StoreError> {
        self.inner.read_membership(key).await
    }

    async fn commit(&self, commit: Commit) -> Result<Version, StoreError> {
        match &self.fault {
            Fault::AlwaysConflict => Err(StoreError::Conflict("forced".into())),
            Fault::Unavailable => Err(StoreError::Unavailable(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            )))),
            Fault::SlowCommit(delay) => {
                tokio::time::sleep(*delay).await;
                self.inner.commit(commit).await
            }
            Fault::PausedRebuild(_) | Fault::BrokenRebuild => self.inner.commit(commit).await,
        }
    }

    async fn shards(&self, post_id: &PostId) -> Result<Vec<ShardCounter>, StoreError> {
        self.inner.shards(post_id).await
    }

    async fn count_memberships(&self, post_id: &PostId) -> Result<u64, StoreError> {
        self.inner.count_memberships(post_id).await
    }

    async fn overwrite_shards(&self, post_id: &PostId, counts: &[i64]) -> Result<(), StoreError> {
        self.inner.overwrite_shards(post_id, counts).await
    }

    async fn rebuild_shards(
        &self,
        post_id: &PostId,
        shard_count: u32,
    ) -> Result<Rebuild, StoreError> {
        match &self.fault {
            Fault::PausedRebuild(gate) => {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
            Fault::BrokenRebuild => {
                return Err(StoreError::Corrupt {
                    key: format!("favorite_shards:{post_id}"),
                    reason: "not an integer".into(),
                });
            }
            _ => {}
        }

        self.inner.rebuild_shards(post_id, shard_count).await
    }

    async fn posts(&self) -> Result<Vec<PostId>, StoreError> {
        self.inner.posts().await
    }

    async fn display_count(&self, post_id: &PostId) -> Result<Option<u64>, StoreError> {
        self.inner.display_count(post_id).await
    }

    async fn set_display_count(&self, post_id: &PostId, count: u64) -> Result<(), StoreError> {
        self.inner.set_display_count(post_id, count).await
    }
}

fn faulty(fault: Fault) -> Arc<FaultyStore> {
    Arc::new(FaultyStore {
        inner: MemoryStore::new(),
        fault,
    })
}

#[tokio::test]
async fn test_single_user_scenario() {
    let favorites = engine(Arc::new(MemoryStore::new()), 10);
    let post = PostId::new("p");

    let added = favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
    assert_eq!(added.action, ToggleAction::Added);
    assert!(added.is_favorited);
    assert_eq!(favorites.favorite_count(&post).await.unwrap(), 1);

    let removed = favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
    assert_eq!(removed.action, ToggleAction::Removed);
    assert!(!removed.is_favorited);
    assert_eq!(favorites.favorite_count(&post).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_users_favorite_concurrently() {
    let store = Arc::new(MemoryStore::new());
    let favorites = engine(store.clone(), 10);
    let post = PostId::new("p");

    let user_a = user("a");
    let user_b = user("b");
    let (a, b) = tokio::join!(
        favorites.toggle_favorite(&post, &user_a, None),
        favorites.toggle_favorite(&post, &user_b, None),
    );

    assert_eq!(a.unwrap().action, ToggleAction::Added);
    assert_eq!(b.unwrap().action, ToggleAction::Added);
    assert_eq!(favorites.favorite_count(&post).await.unwrap(), 2);
    assert_eq!(store.count_memberships(&post).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_click_with_observed_state_adds_once() {
    for _ in 0..50 {
        let store = Arc::new(MemoryStore::new());
        let favorites = engine(store.clone(), 10);
        let post = PostId::new("p");

        let first = tokio::spawn({
            let favorites = favorites.clone();
            async move {
                favorites
                    .toggle_favorite(&PostId::new("p"), &user("a"), Some(false))
                    .await
            }
        });
        let second = tokio::spawn({
            let favorites = favorites.clone();
            async move {
                favorites
                    .toggle_favorite(&PostId::new("p"), &user("a"), Some(false))
                    .await
            }
        });

        let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

        let applied: Vec<_> = outcomes.iter().filter(|outcome| outcome.applied).collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].action, ToggleAction::Added);
        assert!(outcomes.iter().all(|outcome| outcome.is_favorited));

        assert!(favorites.is_favorited(&post, &user("a")).await.unwrap());
        assert_eq!(favorites.favorite_count(&post).await.unwrap(), 1);
        assert_eq!(store.count_memberships(&post).await.unwrap(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pure_toggles_never_double_increment() {
    for _ in 0..50 {
        let store = Arc::new(MemoryStore::new());
        let favorites = engine(store.clone(), 10);
        let post = PostId::new("p");

        let toggles: Vec<_> = (0..2)
            .map(|_| {
                let favorites = favorites.clone();
                tokio::spawn(async move {
                    favorites
                        .toggle_favorite(&PostId::new("p"), &user("a"), None)
                        .await
                })
            })
            .collect();
        let mut actions = Vec::new();
        for toggle in toggles {
            actions.push(toggle.await.unwrap().unwrap().action);
        }
        actions.sort_by_key(|action| *action == ToggleAction::Removed);

        assert_eq!(actions, vec![ToggleAction::Added, ToggleAction::Removed]);
        assert_eq!(favorites.favorite_count(&post).await.unwrap(), 0);
        assert_eq!(store.count_memberships(&post).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_toggle_is_its_own_inverse() {
    let favorites = engine(Arc::new(MemoryStore::new()), 10);
    let post = PostId::new("p");
    favorites.toggle_favorite(&post, &user("b"), None).await.unwrap();

    for start_favorited in [false, true] {
        if start_favorited {
            favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
        }
        let count = favorites.favorite_count(&post).await.unwrap();

        favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
        favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();

        assert_eq!(
            favorites.is_favorited(&post, &user("a")).await.unwrap(),
            start_favorited
        );
        assert_eq!(favorites.favorite_count(&post).await.unwrap(), count);
    }
}

#[tokio::test]
async fn test_at_most_one_membership_per_user() {
    let store = Arc::new(MemoryStore::new());
    let favorites = engine(store.clone(), 4);
    let post = PostId::new("p");

    for round in 0..7 {
        favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
        let expected = if round % 2 == 0 { 1 } else { 0 };
        assert_eq!(store.count_memberships(&post).await.unwrap(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_matches_memberships() {
    let store = Arc::new(MemoryStore::new());
    let favorites = engine(store.clone(), 10);
    let post = PostId::new("p");

    let toggles: Vec<_> = (0..40)
        .map(|i| {
            let favorites = favorites.clone();
            tokio::spawn(async move {
                favorites
                    .toggle_favorite(&PostId::new("p"), &user(&format!("u{}", i % 25)), None)
                    .await
            })
        })
        .collect();
    for toggle in toggles {
        toggle.await.unwrap().unwrap();
    }

    store.overwrite_shards(&post, &[3, -4, 0, 11]).await.unwrap();
    favorites.reconcile(&post).await.unwrap();

    let memberships = store.count_memberships(&post).await.unwrap();
    assert_eq!(memberships, 10);
    assert_eq!(favorites.favorite_count(&post).await.unwrap(), memberships);
    assert!(
        favorites
            .shard_snapshot(&post)
            .await
            .unwrap()
            .iter()
            .all(|shard| shard.count >= 0)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_toggle_during_reconcile_is_counted() {
    let gate = Arc::new(Gate::default());
    let store = faulty(Fault::PausedRebuild(gate.clone()));
    let favorites = engine(store.clone(), 4);
    let post = PostId::new("p");
    favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();

    let reconcile = tokio::spawn({
        let favorites = favorites.clone();
        let post = post.clone();
        async move { favorites.reconcile(&post).await }
    });

    gate.reached.notified().await;
    favorites.toggle_favorite(&post, &user("b"), None).await.unwrap();
    gate.release.notify_one();

    let report = reconcile.await.unwrap().unwrap();
    let memberships = store.inner.count_memberships(&post).await.unwrap();

    assert_eq!(memberships, 2);
    assert_eq!(report.after, memberships);
    assert_eq!(favorites.favorite_count(&post).await.unwrap(), memberships);
    assert_eq!(favorites.display_count(&post).await.unwrap(), Some(memberships));
    assert!(!favorites.is_suspicious(&post).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_adds_spread_evenly_over_shards() {
    const ADDS: usize = 10_000;
    const SHARDS: u32 = 10;

    let store = Arc::new(MemoryStore::new());
    let favorites = Arc::new(
        Favorites::new(
            store.clone(),
            Arc::new(StaticPosts::new().with_public("p", &[])),
            fast_config(SHARDS),
        )
        .with_picker(ShardPicker::seeded(SHARDS, 7)),
    );

    let toggles: Vec<_> = (0..ADDS)
        .map(|i| {
            let favorites = favorites.clone();
            tokio::spawn(async move {
                favorites
                    .toggle_favorite(&PostId::new("p"), &user(&format!("u{i}")), None)
                    .await
            })
        })
        .collect();
    for toggle in toggles {
        toggle.await.unwrap().unwrap();
    }

    let shards = store.shards(&PostId::new("p")).await.unwrap();
    let fair_share = (ADDS / SHARDS as usize) as i64;

    assert_eq!(shards.len(), SHARDS as usize);
    assert_eq!(shards.iter().map(|shard| shard.count).sum::<i64>(), ADDS as i64);
    for shard in shards {
        assert!(
            shard.count < fair_share * 3 / 2,
            "shard {} took {} of {ADDS}",
            shard.shard_id,
            shard.count
        );
    }
}

#[tokio::test]
async fn test_conflict_exhaustion_fails_without_partial_state() {
    let store = faulty(Fault::AlwaysConflict);
    let favorites = engine(store.clone(), 10);
    let post = PostId::new("p");

    let result = favorites.toggle_favorite(&post, &user("a"), None).await;

    match result {
        Err(FavoriteError::ToggleFailed { attempts, source }) => {
            assert_eq!(attempts, favorites.config().max_attempts);
            assert!(matches!(source, StoreError::Conflict(_)));
        }
        other => panic!("expected ToggleFailed, got {other:?}"),
    }
    assert!(!favorites.is_favorited(&post, &user("a")).await.unwrap());
    assert!(store.shards(&post).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unavailable_store_is_not_retried() {
    let favorites = engine(faulty(Fault::Unavailable), 10);

    let result = favorites
        .toggle_favorite(&PostId::new("p"), &user("a"), None)
        .await;

    assert!(matches!(
        result,
        Err(FavoriteError::ToggleFailed {
            attempts: 1,
            source: StoreError::Unavailable(_)
        })
    ));
}

#[tokio::test]
async fn test_missing_private_and_deleted_posts_are_rejected() {
    let posts = StaticPosts::new();
    posts.insert(PostId::new("private"), Visibility::Private, &[]);
    posts.insert(PostId::new("deleted"), Visibility::Deleted, &[]);
    let store = Arc::new(MemoryStore::new());
    let favorites = Favorites::new(store.clone(), Arc::new(posts), fast_config(4));

    for post in ["private", "deleted", "missing"] {
        let result = favorites
            .toggle_favorite(&PostId::new(post), &user("a"), None)
            .await;
        assert!(matches!(result, Err(FavoriteError::PostNotFavoritable(_))));
    }
    assert!(store.posts().await.unwrap().is_empty());
}

fn test_config(toggle_timeout: Duration) -> Config {
    Config {
        port: 0,
        store: StoreKind::Memory,
        redis_url: String::new(),
        toggle_timeout,
        reconcile_interval: Duration::from_secs(300),
        favorites: fast_config(10),
    }
}

fn test_state(store: Arc<dyn FavoriteStore>, toggle_timeout: Duration) -> Arc<State> {
    Arc::new(State::with_parts(
        test_config(toggle_timeout),
        store,
        Arc::new(StaticPosts::new().with_public("p", &["rust", "db"])),
        Arc::new(MemoryTagStats::new()),
    ))
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: &str,
) -> (StatusCode, String) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header("x-user-id", user);
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Records every delta so the test can wait for the worker to drain.
#[derive(Default)]
struct RecordingSink {
    deltas: Mutex<Vec<(TagId, i64)>>,
}

#[async_trait]
impl TagStatsSink for RecordingSink {
    async fn favorite_delta(&self, tag_id: &TagId, delta: i64) -> Result<(), StoreError> {
        self.deltas.lock().push((tag_id.clone(), delta));
        Ok(())
    }
}

#[tokio::test]
async fn test_tag_deltas_follow_applied_toggles() {
    let sink = Arc::new(RecordingSink::default());
    let state = State::with_parts(
        test_config(Duration::from_secs(2)),
        Arc::new(MemoryStore::new()),
        Arc::new(StaticPosts::new().with_public("p", &["rust", "db"])),
        sink.clone(),
    );
    let post = PostId::new("p");

    state.favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
    state.favorites.toggle_favorite(&post, &user("b"), None).await.unwrap();
    state.favorites.toggle_favorite(&post, &user("a"), None).await.unwrap();
    state
        .favorites
        .toggle_favorite(&post, &user("b"), Some(false))
        .await
        .unwrap();

    let mut waited = Duration::ZERO;
    while sink.deltas.lock().len() < 6 && waited < Duration::from_secs(2) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }

    let deltas = sink.deltas.lock().clone();
    assert_eq!(deltas.len(), 6);
    for tag in ["rust", "db"] {
        let total: i64 = deltas
            .iter()
            .filter(|(tag_id, _)| tag_id == tag)
            .map(|(_, delta)| delta)
            .sum();
        assert_eq!(total, 1);
    }
}

#[tokio::test]
async fn test_http_routes() {
    let state = test_state(Arc::new(MemoryStore::new()), Duration::from_secs(2));
    let app = app(state);

    let (status, body) = send(&app, "POST", "/posts/p/favorite", Some("alice"), "").await;
    assert_eq!(status, StatusCode::OK);
    let outcome: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(outcome["action"], "added");
    assert_eq!(outcome["is_favorited"], true);
    assert_eq!(outcome["applied"], true);

    let (status, body) = send(&app, "GET", "/posts/p/favorite", Some("alice"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"is_favorited":true}"#);

    let (status, body) = send(&app, "GET", "/posts/p/favorites/count", None, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, r#"{"count":1}"#);

    let (status, body) = send(
        &app,
        "POST",
        "/posts/p/favorite",
        Some("alice"),
        r#"{"observed":false}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let outcome: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(outcome["applied"], false);

    let (status, body) = send(&app, "POST", "/posts/p/favorites/reconcile", Some("ops"), "").await;
    assert_eq!(status, StatusCode::OK);
    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(report["after"], 1);
}

#[tokio::test]
async fn test_http_error_statuses() {
    let state = test_state(Arc::new(MemoryStore::new()), Duration::from_secs(2));
    let app = app(state);

    let (status, _) = send(&app, "POST", "/posts/p/favorite", None, "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "POST", "/posts/nope/favorite", Some("alice"), "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/posts/p/favorite", Some("alice"), "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/posts/p/favorite", None, "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, "POST", "/posts/p/favorites/reconcile", None, "").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_http_reconcile_failure_is_opaque() {
    let state = test_state(faulty(Fault::BrokenRebuild), Duration::from_secs(2));
    let app = app(state);

    let (status, body) = send(&app, "POST", "/posts/p/favorites/reconcile", Some("ops"), "").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, INTERNAL_ERROR_BODY);
}

#[tokio::test]
async fn test_http_conflict_exhaustion_is_service_unavailable() {
    let state = test_state(faulty(Fault::AlwaysConflict), Duration::from_secs(2));
    let app = app(state);

    let (status, _) = send(&app, "POST", "/posts/p/favorite", Some("alice"), "").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_timed_out_toggle_still_commits() {
    let store = faulty(Fault::SlowCommit(Duration::from_millis(200)));
    let state = test_state(store, Duration::from_millis(20));
    let favorites = state.favorites.clone();
    let app = app(state);

    let (status, _) = send(&app, "POST", "/posts/p/favorite", Some("alice"), "").await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        favorites
            .is_favorited(&PostId::new("p"), &user("alice"))
            .await
            .unwrap()
    );
}
