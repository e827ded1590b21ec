use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::models::PostId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum FavoriteError {
    #[error("Missing or invalid user identity")]
    Unauthenticated,

    #[error("Post {0} cannot be favorited")]
    PostNotFavoritable(PostId),

    #[error("Toggle failed after {attempts} attempt(s), no change was made")]
    ToggleFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Reconciliation of post {post_id} failed")]
    ReconciliationFailed {
        post_id: PostId,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of every 500. The cause only goes to the log.
pub const INTERNAL_ERROR_BODY: &str = "Internal server error";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Request timed out, favorite state unknown: re-query before retrying")]
    Timeout,

    #[error(transparent)]
    Favorite(#[from] FavoriteError),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Favorite(error) => match error {
                FavoriteError::Unauthenticated => StatusCode::UNAUTHORIZED,
                FavoriteError::PostNotFavoritable(_) => StatusCode::NOT_FOUND,
                FavoriteError::ToggleFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                FavoriteError::ReconciliationFailed { .. } | FavoriteError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {self:?}");
            return (status, INTERNAL_ERROR_BODY).into_response();
        }

        (status, self.to_string()).into_response()
    }
}
