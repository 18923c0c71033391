//! HTTP control surface
//!
//! Thin axum layer over the controller handle. Every endpoint answers
//! HTTP 200 with a JSON envelope; control failures become
//! `{"status": "error", "message": ...}` instead of error status codes,
//! which is what existing clients expect.

use crate::events::VideoMode;
use crate::session::{ControllerHandle, PauseOutcome, StartOutcome};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub controller: ControllerHandle,
}

pub fn router(controller: ControllerHandle) -> Router {
    Router::new()
        .route("/start_voice", post(start_voice))
        .route("/stop_voice", post(stop_voice))
        .route("/terminate_voice", post(terminate_voice))
        .route("/get_transcription", get(get_transcription))
        .with_state(AppState { controller })
}

#[derive(Debug, Deserialize, Default)]
struct StartRequest {
    mode: Option<VideoMode>,
}

fn error_envelope(e: impl std::fmt::Display) -> Json<Value> {
    error!("control call failed: {}", e);
    Json(json!({ "status": "error", "message": e.to_string() }))
}

/// Start a new session, or resume a paused one.
async fn start_voice(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Json<Value> {
    let mode = body.and_then(|Json(request)| request.mode);
    match state.controller.start(mode).await {
        Ok(StartOutcome::Started) => Json(json!({ "status": "started" })),
        Ok(StartOutcome::Resumed) => Json(json!({ "status": "resumed" })),
        Ok(StartOutcome::AlreadyRunning) => Json(json!({ "status": "already_running" })),
        Err(e) => error_envelope(e),
    }
}

/// Pause the active session. The remote connection stays open so a
/// later start resumes without reconnecting.
async fn stop_voice(State(state): State<AppState>) -> Json<Value> {
    match state.controller.pause().await {
        Ok(PauseOutcome::Paused) => Json(json!({ "status": "paused" })),
        Ok(PauseOutcome::NotRunning) => Json(json!({ "status": "not_running" })),
        Err(e) => error_envelope(e),
    }
}

/// Tear the session down completely.
async fn terminate_voice(State(state): State<AppState>) -> Json<Value> {
    match state.controller.terminate().await {
        Ok(()) => Json(json!({ "status": "terminated" })),
        Err(e) => error_envelope(e),
    }
}

async fn get_transcription(State(state): State<AppState>) -> Json<Value> {
    let text = state.controller.transcription().map(|t| t.text);
    Json(json!({ "transcription": text }))
}
