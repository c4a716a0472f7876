//! HTTP route handlers for the web server.
//!
//! Translates the REST/WebSocket surface into session manager and
//! orchestrator calls. All business logic lives behind those two.

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::Engine;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::auth;
use crate::ops::{SubmitError, SubmitRequest};
use crate::progress::ProgressEvent;
use crate::session::SessionError;
use crate::AppConfig;
use crate::AppState;

/// JSON error response helper
fn err_response(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({ "error": msg })))
}

/// Map session errors onto HTTP statuses.
fn session_error_response(error: SessionError) -> axum::response::Response {
    let status = match &error {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::AlreadyActive(_) | SessionError::ConcurrencyConflict => StatusCode::CONFLICT,
        SessionError::CaptchaTimeout => StatusCode::REQUEST_TIMEOUT,
        SessionError::NotAuthenticated(_)
        | SessionError::Expired
        | SessionError::InvalidState { .. } => StatusCode::BAD_REQUEST,
        SessionError::Driver(_) | SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err_response(status, &error.to_string()).into_response()
}

/// Build the API router with all endpoints.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Config & health
        .route("/config", get(get_config).post(configure))
        .route("/health", get(health))
        // Login handoff
        .route("/auth/login", post(trigger_login))
        .route("/auth/login/confirm", post(confirm_login))
        .route("/auth/captcha/refresh", post(refresh_captcha))
        .route("/auth/logout", post(logout))
        // Sessions & bills
        .route("/sessions", get(list_sessions))
        .route("/bills/:ewb", get(get_bill))
        // Operations
        .route("/operations", post(submit_operation).get(list_operations))
        .route("/operations/:id", get(get_operation))
        .route("/operations/:id/cancel", post(cancel_operation))
        .route("/operations/:id/events", get(operation_events))
        // Logs
        .route("/logs/dir", get(get_log_dir))
        // Auth middleware (only if EWB_WEB_PASS is set)
        .layer(middleware::from_fn(auth::basic_auth_middleware))
        .layer(Extension(state))
}

// ========== Config & Health Handlers ==========

async fn get_config(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let config = state.config.read().await.clone();
    Json(config)
}

async fn configure(
    Extension(state): Extension<Arc<AppState>>,
    Json(config): Json<AppConfig>,
) -> impl IntoResponse {
    info!("Configuring application via web API");
    state.configure(config).await;
    StatusCode::OK
}

async fn health(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    let sessions = state.sessions.list().await;
    Json(serde_json::json!({
        "status": "ok",
        "sessions": sessions.len(),
    }))
}

// ========== Login Handoff Handlers ==========

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerLoginRequest {
    owner_profile: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn trigger_login(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<TriggerLoginRequest>,
) -> impl IntoResponse {
    let profile = match req.owner_profile {
        Some(p) if !p.is_empty() => p,
        _ => state.config.read().await.owner_profile.clone(),
    };
    info!("Login triggered via web API (profile: {})", profile);

    match state.sessions.trigger_login(&profile, req.force).await {
        Ok(handoff) => Json(serde_json::json!({
            "sessionId": handoff.session_id,
            "captchaImage": base64::engine::general_purpose::STANDARD.encode(handoff.captcha_image),
        }))
        .into_response(),
        Err(e) => session_error_response(e),
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    session_id: String,
}

async fn confirm_login(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> impl IntoResponse {
    match state.sessions.confirm_login(&req.session_id).await {
        Ok(session) => Json(session).into_response(),
        Err(e) => session_error_response(e),
    }
}

async fn refresh_captcha(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> impl IntoResponse {
    match state.sessions.refresh_captcha(&req.session_id).await {
        Ok(image) => Json(serde_json::json!({
            "captchaImage": base64::engine::general_purpose::STANDARD.encode(image),
        }))
        .into_response(),
        Err(e) => session_error_response(e),
    }
}

async fn logout(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> impl IntoResponse {
    info!("Logout via web API: {}", req.session_id);
    match state.sessions.invalidate(&req.session_id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => session_error_response(e),
    }
}

// ========== Session & Bill Handlers ==========

async fn list_sessions(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.sessions.list().await)
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct BillQuery {
    session_id: String,
}

async fn get_bill(
    Extension(state): Extension<Arc<AppState>>,
    Path(ewb): Path<String>,
    Query(query): Query<BillQuery>,
) -> impl IntoResponse {
    match state.sessions.read_bill(&query.session_id, &ewb).await {
        Ok(bill) => Json(bill).into_response(),
        Err(e) => session_error_response(e),
    }
}

// ========== Operation Handlers ==========

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOperationRequest {
    session_id: String,
    operation: SubmitRequest,
}

async fn submit_operation(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<SubmitOperationRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .submit(&req.session_id, req.operation)
        .await
    {
        Ok(operation_id) => Json(serde_json::json!({ "operationId": operation_id })).into_response(),
        Err(SubmitError::Validation(msg)) => {
            err_response(StatusCode::BAD_REQUEST, &msg).into_response()
        }
        Err(e) => err_response(StatusCode::BAD_REQUEST, &e.to_string()).into_response(),
    }
}

async fn list_operations(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.orchestrator.list_operations().await)
}

async fn get_operation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_status(&id).await {
        Ok(operation) => Json(operation).into_response(),
        Err(e) => err_response(StatusCode::NOT_FOUND, &e.to_string()).into_response(),
    }
}

async fn cancel_operation(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    info!("Cancelling operation via web API: {}", id);
    match state.orchestrator.cancel(&id).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => err_response(StatusCode::NOT_FOUND, &e.to_string()).into_response(),
    }
}

/// WebSocket relay of an operation's progress events.
///
/// Streams events from subscription forward; a late joiner fetches the
/// operation snapshot over REST first. The socket closes when the
/// operation reaches a terminal status.
async fn operation_events(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.progress.subscribe(&id).await {
        Some(rx) => ws.on_upgrade(move |socket| relay_events(socket, rx)).into_response(),
        None => err_response(
            StatusCode::NOT_FOUND,
            "Operation has finished or does not exist",
        )
        .into_response(),
    }
}

async fn relay_events(mut socket: WebSocket, mut rx: broadcast::Receiver<ProgressEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Failed to serialize progress event: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    debug!("Progress subscriber went away");
                    break;
                }
            }
            // Slow consumer: events were dropped rather than stalling the
            // publisher; keep streaming from here.
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Progress subscriber lagged, skipped {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.close().await;
}

// ========== Log Handlers ==========

async fn get_log_dir() -> impl IntoResponse {
    match crate::log_dir() {
        Some(p) => Json(serde_json::json!({ "path": p.to_string_lossy() })).into_response(),
        None => err_response(StatusCode::INTERNAL_SERVER_ERROR, "Could not determine log directory").into_response(),
    }
}
