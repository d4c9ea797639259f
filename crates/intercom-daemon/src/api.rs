//! The daemon HTTP surface.
//!
//! Signed with this machine's token, except `GET /api/discover` and
//! `GET /health`. The hub calls `mission/start` and `session/deliver`;
//! the local tool servers register their sessions here.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use intercom_auth::{VerifyOutcome, HEADER_MACHINE, HEADER_SIG, HEADER_TS};
use intercom_types::wire::{
    DeliverRequest, DeliverResponse, DiscoverResponse, MissionStartRequest, MissionStartResponse,
    MissionStopResponse, SessionRegisterRequest,
};
use intercom_types::{InboxEntry, IntercomError, SessionInfo};

use crate::DaemonState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn build_router(state: Arc<DaemonState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/discover", get(discover));

    let signed = Router::new()
        .route("/api/mission/start", post(mission_start))
        .route("/api/mission/{id}/stop", post(mission_stop))
        .route("/api/missions/{id}", get(mission_status))
        .route("/api/session/register", post(session_register))
        .route("/api/session/unregister", post(session_unregister))
        .route("/api/sessions", get(list_sessions))
        .route("/api/session/deliver", post(session_deliver))
        .route("/api/session/{id}/status", get(session_status))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            require_signature,
        ));

    public.merge(signed).with_state(state)
}

fn error_response(e: &IntercomError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({"error": e.label(), "detail": e.to_string()})),
    )
        .into_response()
}

/// Verify the signature headers against this machine's token.
async fn require_signature(
    State(state): State<Arc<DaemonState>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return error_response(&IntercomError::BadEnvelope("body too large".into())),
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let machine = header(HEADER_MACHINE);
    let ts = header(HEADER_TS);
    let sig = header(HEADER_SIG);

    let outcome = intercom_auth::verify(
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        &ts,
        &sig,
        Some(state.token.as_str()),
    );
    match outcome {
        VerifyOutcome::Ok => {}
        VerifyOutcome::Stale => return error_response(&IntercomError::AuthStale),
        VerifyOutcome::BadSignature => return error_response(&IntercomError::AuthBadSignature),
        VerifyOutcome::UnknownMachine => {
            return error_response(&IntercomError::AuthUnknownMachine(machine))
        }
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn health(State(state): State<Arc<DaemonState>>) -> Json<serde_json::Value> {
    Json(json!({
        "machine_id": state.machine_id,
        "status": "ok",
        "active_missions": state.launcher.active_count().await,
    }))
}

async fn discover(State(state): State<Arc<DaemonState>>) -> Json<DiscoverResponse> {
    Json(DiscoverResponse {
        hub: false,
        version: env!("CARGO_PKG_VERSION").to_string(),
        machine_id: state.machine_id.clone(),
    })
}

async fn mission_start(State(state): State<Arc<DaemonState>>, body: Bytes) -> Response {
    let request: MissionStartRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };

    let project_path = state.project_path(&request.project);
    match state.launcher.launch(&request, &project_path).await {
        Ok(()) => {
            info!(
                mission = request.mission_id.as_str(),
                project = request.project.as_str(),
                "mission launched"
            );
            Json(MissionStartResponse {
                status: "launched".into(),
                mission_id: request.mission_id,
                error: None,
            })
            .into_response()
        }
        Err(e @ IntercomError::PathNotAllowed(_)) => (
            StatusCode::BAD_REQUEST,
            Json(MissionStartResponse {
                status: "launch_failed".into(),
                mission_id: request.mission_id,
                error: Some(e.label().to_string()),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn mission_stop(State(state): State<Arc<DaemonState>>, Path(id): Path<String>) -> Response {
    if state.launcher.snapshot(&id, 0).await.is_none() {
        return error_response(&IntercomError::not_found("mission", &id));
    }
    let stopped = state.launcher.stop(&id).await;
    Json(MissionStopResponse { ok: true, stopped }).into_response()
}

#[derive(serde::Deserialize)]
struct FeedbackSince {
    #[serde(default)]
    feedback_since: u64,
}

async fn mission_status(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
    Query(since): Query<FeedbackSince>,
) -> Response {
    match state.launcher.snapshot(&id, since.feedback_since).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(&IntercomError::not_found("mission", &id)),
    }
}

async fn session_register(State(state): State<Arc<DaemonState>>, body: Bytes) -> Response {
    let request: SessionRegisterRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    state
        .sessions
        .register(SessionInfo {
            session_id: request.session_id,
            project: request.project,
            pid: request.pid,
            inbox_path: request.inbox_path,
            registered_at: chrono::Utc::now(),
            status: intercom_types::SessionStatus::Active,
            summary: None,
            recent_activity: Vec::new(),
        })
        .await;
    Json(json!({"ok": true})).into_response()
}

#[derive(serde::Deserialize)]
struct UnregisterBody {
    session_id: String,
}

async fn session_unregister(State(state): State<Arc<DaemonState>>, body: Bytes) -> Response {
    let request: UnregisterBody = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    let removed = state.sessions.unregister(&request.session_id).await;
    Json(json!({"ok": true, "removed": removed})).into_response()
}

async fn list_sessions(State(state): State<Arc<DaemonState>>) -> Response {
    Json(json!({"sessions": state.sessions.list_live().await})).into_response()
}

async fn session_deliver(State(state): State<Arc<DaemonState>>, body: Bytes) -> Response {
    let request: DeliverRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };

    let mut entry = InboxEntry::new(&request.thread_id, &request.from_agent, &request.message);
    entry.timestamp = request.timestamp;

    match state
        .sessions
        .deliver(request.session_id.as_deref(), &request.project, entry)
        .await
    {
        Ok(session_id) => Json(DeliverResponse {
            status: "delivered".into(),
            session_id: Some(session_id),
        })
        .into_response(),
        // NoActiveSession maps to the 404 the hub treats as a routing
        // outcome rather than a failure.
        Err(e) => error_response(&e),
    }
}

async fn session_status(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(session) = state.sessions.get(&id).await else {
        return error_response(&IntercomError::not_found("session", &id));
    };
    let pending = match state.sessions.inbox_pending(&session).await {
        Ok(n) => n,
        Err(e) => return error_response(&e),
    };
    Json(json!({
        "session": session,
        "inbox_pending": pending,
    }))
    .into_response()
}
