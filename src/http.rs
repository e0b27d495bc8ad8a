//! HTTP surface: the managed-endpoint container contract.
//!
//! * `GET /ping`: health check polled by the hosting platform.
//! * `POST /invocations`: JSON wire request in, [`ResponseEnvelope`] out.
//!
//! The HTTP status mirrors the envelope's error kind; the envelope body
//! carries the details either way.

use crate::output::ResponseEnvelope;
use crate::pipeline::lifecycle::ModelState;
use crate::receiver::OcrService;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    service: Arc<OcrService>,
}

/// Build the router for `service`.
pub fn router(service: Arc<OcrService>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/invocations", post(invocations))
        .with_state(AppState { service })
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

/// Health status for a model state.
///
/// An unloaded model is healthy unless preloading was requested: lazy
/// loading happens on the first invocation.
pub fn ping_status(state: ModelState, preload: bool) -> StatusCode {
    match state {
        ModelState::Ready => StatusCode::OK,
        ModelState::Unloaded if !preload => StatusCode::OK,
        ModelState::Unloaded | ModelState::Loading => StatusCode::SERVICE_UNAVAILABLE,
        ModelState::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[tracing::instrument(skip_all)]
async fn ping(State(state): State<AppState>) -> StatusCode {
    let service = &state.service;
    ping_status(service.lifecycle().state(), service.config().preload)
}

#[tracing::instrument(skip_all, fields(bytes = body.len()))]
async fn invocations(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<ResponseEnvelope>) {
    let envelope = state.service.handle_wire(&body).await;
    let status = envelope
        .error_kind()
        .map(|kind| {
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        })
        .unwrap_or(StatusCode::OK);
    (status, Json(envelope))
}
