use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{self, Path},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::info;

use crate::{
    error::AppError,
    models::{PostId, ReconcileReport, ToggleOutcome, UserId},
    state::State,
};

/// Set by the auth proxy in front of this service once the session checks out.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Deserialize, Default)]
pub struct ToggleRequest {
    /// Favorited state the client showed when the user clicked.
    pub observed: Option<bool>,
}

#[derive(Serialize, Deserialize)]
pub struct FavoritedResponse {
    pub is_favorited: bool,
}

#[derive(Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

fn user_from(headers: &HeaderMap) -> Result<UserId, AppError> {
    let raw = headers.get(USER_HEADER).and_then(|value| value.to_str().ok());

    Ok(UserId::authenticated(raw)?)
}

fn toggle_request(body: &Bytes) -> Result<ToggleRequest, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ToggleRequest::default());
    }

    serde_json::from_slice(body).map_err(|_| AppError::MalformedPayload)
}

/// The toggle runs on its own task, so a client that gives up mid-commit does not
/// cancel it. On timeout the outcome is unknown and the client must re-query.
pub async fn toggle_handler(
    extract::State(state): extract::State<Arc<State>>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ToggleOutcome>, AppError> {
    let user_id = user_from(&headers)?;
    let request = toggle_request(&body)?;
    let post_id = PostId::new(post_id);

    let favorites = state.favorites.clone();
    let task = tokio::spawn(async move {
        favorites
            .toggle_favorite(&post_id, &user_id, request.observed)
            .await
    });

    match timeout(state.config.toggle_timeout, task).await {
        Ok(Ok(outcome)) => Ok(Json(outcome?)),
        Ok(Err(join_error)) => Err(AppError::InternalError(Box::new(join_error))),
        Err(_) => Err(AppError::Timeout),
    }
}

pub async fn favorited_handler(
    extract::State(state): extract::State<Arc<State>>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<FavoritedResponse>, AppError> {
    let user_id = user_from(&headers)?;
    let is_favorited = state
        .favorites
        .is_favorited(&PostId::new(post_id), &user_id)
        .await?;

    Ok(Json(FavoritedResponse { is_favorited }))
}

pub async fn count_handler(
    extract::State(state): extract::State<Arc<State>>,
    Path(post_id): Path<String>,
) -> Result<Json<CountResponse>, AppError> {
    let count = state.favorites.favorite_count(&PostId::new(post_id)).await?;

    Ok(Json(CountResponse { count }))
}

/// Operator trigger. Needs the same upstream identity as the user routes.
pub async fn reconcile_handler(
    extract::State(state): extract::State<Arc<State>>,
    Path(post_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ReconcileReport>, AppError> {
    let user_id = user_from(&headers)?;
    let post_id = PostId::new(post_id);

    info!("Reconciliation of post {post_id} requested by {user_id}");
    let report = state.favorites.reconcile(&post_id).await?;

    Ok(Json(report))
}
