// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP JSON read path.
//!
//! Thin handlers over the registry:
//!
//! - `GET /healthz` - liveness check, empty 200
//! - `GET /server` - JSON array of all online servers
//! - `GET /server/{server_id}` - one server, 400 on a malformed id
//! - anything else - 404

use crate::storage::{Registry, RegistryError, ServerDetail};
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// JSON error body.
#[derive(Serialize, Debug)]
pub struct ApiError {
    message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    fn invalid_server_id() -> Self {
        Self {
            message: "server_id is invalid".into(),
            status: StatusCode::BAD_REQUEST,
        }
    }

    fn server_not_found() -> Self {
        Self {
            message: "server not found".into(),
            status: StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub fn build_router(registry: Arc<dyn Registry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/server", get(server_list))
        .route("/server/:server_id", get(server_entry))
        .fallback(fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// GET /healthz
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// GET /server
async fn server_list(
    State(registry): State<Arc<dyn Registry>>,
) -> Result<Json<Vec<ServerDetail>>, ApiError> {
    Ok(Json(registry.get_server_list_for_web()?))
}

/// GET /server/{server_id}
async fn server_entry(
    State(registry): State<Arc<dyn Registry>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerDetail>, ApiError> {
    if !is_valid_server_id(&server_id) {
        return Err(ApiError::invalid_server_id());
    }
    match registry.get_server_info_for_web(&server_id)? {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::server_not_found()),
    }
}

async fn fallback(uri: Uri) -> StatusCode {
    warn!("unexpected URL: {}", uri);
    StatusCode::NOT_FOUND
}

/// A server id is exactly 32 lowercase hex characters.
fn is_valid_server_id(server_id: &str) -> bool {
    server_id.len() == 32
        && server_id
            .chars()
            .all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}
