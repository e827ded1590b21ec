//! Favorite-count engine of a content-sharing platform.
//!
//! # Overview
//! - Users favorite and unfavorite posts through a toggle
//! - The membership record for (post, user) is the source of truth for "is favorited"
//! - The count shown on a post is the sum of N shard counters, never one hot counter
//! - A reconciliation pass rebuilds shards from memberships when they drift
//!
//!
//!
//! # Why Shards
//!
//! A popular post takes a burst of favorites at once. With a single counter every one
//! of those writes queues behind the others. Each toggle instead picks one of N shards
//! at random, so the burst spreads over N independent cells and a read sums them.
//! Reads pay O(N), with N small and fixed per deployment.
//!
//! The membership record needs no such trick. It is keyed per user, so only one user's
//! own duplicate clicks ever race on it, and the conditional commit settles those.
//!
//!
//!
//! # Consistency
//!
//! - Per (post, user): linearized by the membership version check
//! - Per post: the shard sum is approximate and may lag in-flight or failed toggles
//! - Display cache: refreshed by reconciliation, eventually consistent
//!
//!
//!
//! # Routes
//!
//! All per-user routes expect the `X-User-Id` header set by the auth proxy.
//!
//! Toggle, optionally passing the state the client displayed.
//! ```sh
//! curl -X POST -H 'X-User-Id: alice' -d '{"observed":false}' localhost:1111/posts/42/favorite
//! ```
//!
//! Read back.
//! ```sh
//! curl -H 'X-User-Id: alice' localhost:1111/posts/42/favorite
//! curl localhost:1111/posts/42/favorites/count
//! ```
//!
//! Force a reconciliation of one post.
//! ```sh
//! curl -X POST localhost:1111/posts/42/favorites/reconcile
//! ```
//!
//!
//!
//! # Setup
//!
//! Run against a throwaway in-memory store.
//! ```sh
//! STORE=memory RUST_LOG=info cargo run
//! ```
//!
//! Run against Redis.
//! ```sh
//! REDIS_URL=redis://localhost:6379 RUST_LOG=info cargo run
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderName, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod models;
pub mod posts;
pub mod reconcile;
pub mod routes;
pub mod shards;
pub mod state;
pub mod store;
pub mod toggle;

use reconcile::spawn_reconciler;
use routes::{USER_HEADER, count_handler, favorited_handler, reconcile_handler, toggle_handler};
use state::State;

pub fn app(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(USER_HEADER)])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route(
            "/posts/{post_id}/favorite",
            post(toggle_handler).get(favorited_handler),
        )
        .route("/posts/{post_id}/favorites/count", get(count_handler))
        .route(
            "/posts/{post_id}/favorites/reconcile",
            post(reconcile_handler),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    if let Err(e) = run().await {
        error!("Server failed: {e:#}");
        std::process::exit(1);
    }

    info!("Server shut down");
}

async fn run() -> Result<()> {
    info!("Initializing state...");
    let state = State::new().await?;

    info!("Starting reconciler...");
    let reconciler = spawn_reconciler(state.favorites.clone(), state.config.reconcile_interval);

    info!("Starting server...");
    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reconciler.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
