//! User API key management
//!
//! Endpoints:
//! - GET    /keys: saved user keys (masked) and the current pool summary
//! - PUT    /keys: replace the user key list, rebuilding the pool
//! - DELETE /keys: forget the user keys; the pool falls back to system keys
//!
//! Key material never leaves the service unmasked.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use key_pool::{Credential, KeyPool};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::api::error_response;

#[derive(Clone)]
pub struct KeysState {
    pub pool: Arc<KeyPool>,
}

pub fn build_keys_router(state: KeysState) -> Router {
    Router::new()
        .route("/keys", get(list_keys).put(replace_keys).delete(clear_keys))
        .with_state(state)
}

async fn summary(pool: &KeyPool) -> Response {
    let saved: Vec<String> = pool
        .user_credentials()
        .await
        .into_iter()
        .map(|key| Credential::new(key).masked())
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "user_keys": saved,
            "pool": pool.health().await,
        })),
    )
        .into_response()
}

async fn list_keys(State(state): State<KeysState>) -> Response {
    summary(&state.pool).await
}

#[derive(Deserialize)]
struct ReplaceKeys {
    keys: Vec<String>,
}

/// PUT /keys: store a new list. Blank entries are dropped, so an
/// all-blank list behaves like DELETE.
async fn replace_keys(
    State(state): State<KeysState>,
    payload: Result<Json<ReplaceKeys>, JsonRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &rejection.body_text(),
                &request_id,
            );
        }
    };
    store_keys(&state.pool, body.keys, &request_id).await
}

async fn clear_keys(State(state): State<KeysState>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    store_keys(&state.pool, Vec::new(), &request_id).await
}

async fn store_keys(pool: &KeyPool, keys: Vec<String>, request_id: &str) -> Response {
    match pool.set_user_credentials(keys).await {
        Ok(saved) => {
            info!(keys = saved.len(), "user keys replaced");
            summary(pool).await
        }
        Err(key_pool::Error::InvalidKeys(message)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, request_id)
        }
        Err(err) => {
            warn!(error = %err, "failed to save user keys");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "key_store_error",
                &err.to_string(),
                request_id,
            )
        }
    }
}
