//! Read-only JSON handlers.
//!
//! Each handler returns the `{success, data, error}` wrapper.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use polyfier_core::{ConfigKind, Configuration};
use polyfier_state::{ConfigStore, ResultStore};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.registry().snapshot().await;
    ApiResponse::ok(snapshot)
}

/// GET /api/v1/configs/{kind}/{hash}
pub async fn get_config(
    State(state): State<ApiState>,
    Path((kind, hash)): Path<(String, u64)>,
) -> impl IntoResponse {
    let kind: ConfigKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };
    match state.store.get(kind, hash) {
        Ok(Some(canonical)) => match Configuration::from_canonical(kind, &canonical) {
            Ok(config) => ApiResponse::ok(config).into_response(),
            Err(e) => {
                error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
            }
        },
        Ok(None) => error_response("configuration not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/workers/{key}/results
pub async fn list_results(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.store.list_results(&key) {
        Ok(results) => ApiResponse::ok(results).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}
