//! HTTP surface of the sync service: trigger endpoints and a healthcheck.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intim_adapters::TriggerError;
use intim_core::{SubjectType, TriggerPayload, TriggerRequest};
use intim_sync::SyncState;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "intim-web";

pub fn app(state: SyncState) -> Router {
    Router::new()
        .route("/trigger", post(trigger_handler))
        .route("/company", post(company_handler))
        .route("/associate", post(associate_handler))
        .route("/healthcheck", get(healthcheck_handler))
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(state: SyncState, port: u16, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn healthcheck_handler() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<SyncState>>,
    payload: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    accept(&state, payload, None)
}

async fn company_handler(
    State(state): State<Arc<SyncState>>,
    payload: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    accept(&state, payload, Some(SubjectType::Company))
}

async fn associate_handler(
    State(state): State<Arc<SyncState>>,
    payload: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    accept(&state, payload, Some(SubjectType::Associate))
}

fn accept(
    state: &SyncState,
    payload: Result<Json<TriggerPayload>, JsonRejection>,
    fixed_type: Option<SubjectType>,
) -> Response {
    let mut payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if let Some(kind) = fixed_type {
        payload.subject_type = Some(kind.as_str().to_string());
    }
    let request = match TriggerRequest::try_from(payload) {
        Ok(request) => request,
        Err(err) => return bad_request(err.to_string()),
    };

    match state.spawn_run(request) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Processing started" })),
        )
            .into_response(),
        Err(TriggerError::Unavailable(reason)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "detail": reason })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": err.to_string() })),
        )
            .into_response(),
    }
}

fn bad_request(detail: String) -> Response {
    warn!(%detail, "rejected trigger request");
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
}
