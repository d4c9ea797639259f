//! The hub HTTP surface.
//!
//! All endpoints are signed except `GET /api/discover`, `POST /api/join`
//! (a joining machine has no token yet), and `GET /api/join/status/*`
//! (polled while waiting for approval, token delivered here once).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use tracing::{info, warn};

use intercom_auth::{VerifyOutcome, HEADER_MACHINE, HEADER_SIG, HEADER_TS};
use intercom_console::JoinDecision;
use intercom_registry::AgentFilter;
use intercom_types::wire::{
    DiscoverResponse, FeedbackSubmission, HeartbeatBody, JoinRequest, JoinResponse,
    MissionSnapshot, RegisterManifest,
};
use intercom_types::{IntercomError, MachineStatus, Message, MessageType, MissionStatus};

use crate::{generate_token, router, HubState};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The verified signer of a request, injected by the auth middleware.
#[derive(Debug, Clone)]
pub struct SignerMachine(pub String);

/// Build the hub router.
pub fn build_router(state: Arc<HubState>) -> Router {
    let public = Router::new()
        .route("/api/discover", get(discover))
        .route("/api/join", post(join))
        .route("/api/join/status/{machine_id}", get(join_status));

    let signed = Router::new()
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/register", post(register))
        .route("/api/agents", get(list_agents))
        .route("/api/machines", get(list_machines))
        .route("/api/machines/{id}/revoke", post(revoke_machine))
        .route("/api/route", post(route_message))
        .route("/api/missions/{id}", get(mission_status))
        .route("/api/missions/{id}/stop", post(mission_stop))
        .route("/api/missions/{id}/history", get(mission_history))
        .route("/api/feedback", post(feedback))
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

/// Verify the three signature headers against the signer's registry token
/// and stash the machine id in request extensions.
async fn require_signature(
    State(state): State<Arc<HubState>>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
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

    if machine.is_empty() {
        return error_response(&IntercomError::AuthUnknownMachine("<missing>".into()));
    }

    let token = match state.registry.lock().await.get_machine_token(&machine) {
        Ok(t) => t,
        Err(e) => return error_response(&e),
    };

    let outcome = intercom_auth::verify(
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        &ts,
        &sig,
        token.as_deref(),
    );
    match outcome {
        VerifyOutcome::Ok => {}
        VerifyOutcome::Stale => return error_response(&IntercomError::AuthStale),
        VerifyOutcome::BadSignature => return error_response(&IntercomError::AuthBadSignature),
        VerifyOutcome::UnknownMachine => {
            return error_response(&IntercomError::AuthUnknownMachine(machine))
        }
    }

    parts.extensions.insert(SignerMachine(machine));
    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

async fn discover(State(state): State<Arc<HubState>>) -> Json<DiscoverResponse> {
    Json(DiscoverResponse {
        hub: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        machine_id: state.machine_id.clone(),
    })
}

/// First contact from a daemon. Creates a pending row and puts the request
/// in front of the operator; the daemon polls `join/status` for the token.
async fn join(State(state): State<Arc<HubState>>, body: Bytes) -> Response {
    let request: JoinRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    if request.machine_id.is_empty() {
        return error_response(&IntercomError::BadEnvelope("machine_id required".into()));
    }

    let (status, existing_token, newly_created) = {
        let registry = state.registry.lock().await;
        match registry.get_machine(&request.machine_id) {
            Ok(Some(machine)) => (machine.status, machine.token, false),
            Ok(None) => {
                let daemon_url = if request.daemon_url.is_empty() {
                    format!("http://{}:7700", request.overlay_ip)
                } else {
                    request.daemon_url.clone()
                };
                if let Err(e) = registry.request_join(
                    &request.machine_id,
                    &request.display_name,
                    &request.overlay_ip,
                    &daemon_url,
                ) {
                    return error_response(&e);
                }
                (MachineStatus::Pending, String::new(), true)
            }
            Err(e) => return error_response(&e),
        }
    };

    if newly_created {
        info!(machine = request.machine_id.as_str(), "join request received");
        tokio::spawn(announce_join(Arc::clone(&state), request.clone()));
    }

    let response = match status {
        MachineStatus::Approved => JoinResponse {
            status: "approved".into(),
            token: Some(existing_token),
        },
        MachineStatus::Denied | MachineStatus::Revoked => JoinResponse {
            status: "denied".into(),
            token: None,
        },
        MachineStatus::Pending => JoinResponse {
            status: "pending_approval".into(),
            token: None,
        },
    };
    Json(response).into_response()
}

/// Put the join in front of the operator and apply the decision.
async fn announce_join(state: Arc<HubState>, request: JoinRequest) {
    let decision = state
        .console
        .announce_join(
            &request.machine_id,
            &request.display_name,
            &request.overlay_ip,
        )
        .await;
    let registry = state.registry.lock().await;
    let result = match decision {
        Some(JoinDecision::Approved) => {
            let token = generate_token(&request.machine_id);
            registry.approve_join(&request.machine_id, &token).map(|_| ())
        }
        Some(JoinDecision::Denied) => registry.deny_join(&request.machine_id),
        // Operator did not act; the join stays pending.
        None => Ok(()),
    };
    if let Err(e) = result {
        warn!(machine = request.machine_id.as_str(), "join decision failed: {e}");
    }
}

async fn join_status(
    State(state): State<Arc<HubState>>,
    Path(machine_id): Path<String>,
) -> Response {
    let machine = match state.registry.lock().await.get_machine(&machine_id) {
        Ok(Some(m)) => m,
        Ok(None) => return error_response(&IntercomError::not_found("machine", &machine_id)),
        Err(e) => return error_response(&e),
    };
    let response = match machine.status {
        MachineStatus::Approved => JoinResponse {
            status: "approved".into(),
            token: Some(machine.token),
        },
        MachineStatus::Pending => JoinResponse {
            status: "pending".into(),
            token: None,
        },
        MachineStatus::Denied | MachineStatus::Revoked => JoinResponse {
            status: "denied".into(),
            token: None,
        },
    };
    Json(response).into_response()
}

async fn heartbeat(
    State(state): State<Arc<HubState>>,
    Extension(signer): Extension<SignerMachine>,
    body: Bytes,
) -> Response {
    let beat: HeartbeatBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    if beat.machine_id != signer.0 {
        return error_response(&IntercomError::AuthUnknownMachine(beat.machine_id));
    }

    let overlay_ip = (!beat.overlay_ip.is_empty()).then_some(beat.overlay_ip.as_str());
    let daemon_url = (!beat.daemon_url.is_empty()).then_some(beat.daemon_url.as_str());
    if let Err(e) =
        state
            .registry
            .lock()
            .await
            .update_heartbeat(&beat.machine_id, overlay_ip, daemon_url)
    {
        return error_response(&e);
    }
    state
        .presence
        .lock()
        .await
        .insert(beat.machine_id.clone(), beat.active_sessions);
    Json(json!({"ok": true})).into_response()
}

async fn register(
    State(state): State<Arc<HubState>>,
    Extension(signer): Extension<SignerMachine>,
    body: Bytes,
) -> Response {
    let manifest: RegisterManifest = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    if manifest.machine_id != signer.0 {
        return error_response(&IntercomError::AuthUnknownMachine(manifest.machine_id));
    }

    let registry = state.registry.lock().await;
    for project in &manifest.projects {
        if let Err(e) = registry.register_project(
            &manifest.machine_id,
            &project.id,
            &project.description,
            &project.capabilities,
            &project.path,
        ) {
            return error_response(&e);
        }
    }
    info!(
        machine = manifest.machine_id.as_str(),
        projects = manifest.projects.len(),
        "manifest registered"
    );
    Json(json!({"ok": true})).into_response()
}

async fn list_agents(
    State(state): State<Arc<HubState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filter = AgentFilter::parse(params.get("filter").map(String::as_str).unwrap_or("all"));
    let rows = match state.registry.lock().await.list_agents(&filter) {
        Ok(rows) => rows,
        Err(e) => return error_response(&e),
    };
    let presence = state.presence.lock().await;
    let agents: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|row| {
            let session = presence
                .get(&row.project.machine_id)
                .and_then(|sessions| {
                    sessions
                        .iter()
                        .find(|s| s.project == row.project.project_id)
                });
            json!({
                "machine_id": row.project.machine_id,
                "project_id": row.project.project_id,
                "description": row.project.description,
                "capabilities": row.project.capabilities,
                "status": row.machine_status,
                "online": row.online,
                "session": session,
            })
        })
        .collect();
    Json(json!({"agents": agents})).into_response()
}

async fn list_machines(State(state): State<Arc<HubState>>) -> Response {
    match state.registry.lock().await.list_machines() {
        Ok(machines) => Json(json!({"machines": machines})).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Revoke a machine: its token is cleared, its signed requests stop
/// verifying, and the router refuses it as a target.
async fn revoke_machine(
    State(state): State<Arc<HubState>>,
    Extension(signer): Extension<SignerMachine>,
    Path(machine_id): Path<String>,
) -> Response {
    if let Err(e) = state.registry.lock().await.revoke_machine(&machine_id) {
        return error_response(&e);
    }
    state.presence.lock().await.remove(&machine_id);
    info!(
        machine = machine_id.as_str(),
        by = signer.0.as_str(),
        "machine revoked"
    );
    state
        .console
        .notify_feedback("note", &format!("machine {machine_id} revoked by {}", signer.0))
        .await;
    Json(json!({"ok": true})).into_response()
}

async fn mission_stop(State(state): State<Arc<HubState>>, Path(id): Path<String>) -> Response {
    match router::stop_mission(&state, &id).await {
        Ok(stopped) => Json(json!({"ok": true, "stopped": stopped})).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn route_message(State(state): State<Arc<HubState>>, body: Bytes) -> Response {
    let msg: Message = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };

    // Mission-store queries never touch policy or dispatch.
    match msg.kind {
        MessageType::Status => return mission_query(&state, &msg, false).await,
        MessageType::History => return mission_query(&state, &msg, true).await,
        _ => {}
    }

    match router::route(&state, msg).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Answer a `status`/`history` routed query from the mission store.
async fn mission_query(state: &HubState, msg: &Message, history: bool) -> Response {
    let Some(mission_id) = msg
        .payload
        .get("mission_id")
        .and_then(|v| v.as_str())
        .or(msg.mission_id.as_deref())
    else {
        return error_response(&IntercomError::BadEnvelope("mission_id required".into()));
    };
    let missions = state.missions.lock().await;
    let Some(mission) = missions.get(mission_id) else {
        return error_response(&IntercomError::not_found("mission", mission_id));
    };
    if history {
        let limit = msg
            .payload
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(50) as usize;
        let skip = mission.messages.len().saturating_sub(limit);
        Json(json!({
            "mission_id": mission.mission_id,
            "messages": &mission.messages[skip..],
        }))
        .into_response()
    } else {
        Json(snapshot_of(mission, 0)).into_response()
    }
}

#[derive(serde::Deserialize)]
struct FeedbackSince {
    #[serde(default)]
    feedback_since: u64,
}

/// Mission status with incremental feedback. While the mission runs on a
/// remote daemon the hub proxies the daemon's snapshot and folds the
/// result back into its own store.
async fn mission_status(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
    Query(since): Query<FeedbackSince>,
) -> Response {
    let (kind, status, target) = {
        let missions = state.missions.lock().await;
        let Some(mission) = missions.get(&id) else {
            return error_response(&IntercomError::not_found("mission", &id));
        };
        (
            mission.kind,
            mission.status.clone(),
            mission.to_agent.clone(),
        )
    };

    // While the mission runs remotely, pull the daemon's tail into the
    // hub record so polls after completion still see the full log.
    if kind.is_mission() && status == MissionStatus::Running {
        proxy_mission_status(&state, &id, &target).await;
    }

    let missions = state.missions.lock().await;
    match missions.get(&id) {
        Some(mission) => Json(snapshot_of(mission, since.feedback_since)).into_response(),
        None => error_response(&IntercomError::not_found("mission", &id)),
    }
}

/// Fetch feedback the hub has not cached yet and fold it (plus status and
/// output) into the mission record. Best-effort; a failed proxy leaves
/// the cached view in place.
async fn proxy_mission_status(state: &HubState, mission_id: &str, target: &str) {
    let Some(machine_id) = target.split('/').next() else {
        return;
    };
    let machine = match state.registry.lock().await.get_machine(machine_id) {
        Ok(Some(m)) => m,
        _ => return,
    };

    let cached_cursor = {
        let missions = state.missions.lock().await;
        missions
            .get(mission_id)
            .and_then(|m| m.feedback.last().map(|f| f.cursor))
            .unwrap_or(0)
    };

    match state
        .daemons
        .mission_status(&machine.daemon_url, &machine.token, mission_id, cached_cursor)
        .await
    {
        Ok(snapshot) => {
            let mut missions = state.missions.lock().await;
            if let Some(mission) = missions.get_mut(mission_id) {
                mission.status = snapshot.status.clone();
                mission.output.clone_from(&snapshot.output);
                if snapshot.status == MissionStatus::Failed {
                    mission.error.clone_from(&snapshot.error);
                }
                for item in snapshot.feedback {
                    if item.cursor > mission.feedback.last().map(|f| f.cursor).unwrap_or(0) {
                        mission.feedback.push(item);
                    }
                }
            }
        }
        Err(e) => {
            warn!(mission = mission_id, "status proxy failed: {e}");
        }
    }
}

fn snapshot_of(mission: &intercom_types::Mission, since: u64) -> MissionSnapshot {
    MissionSnapshot {
        mission_id: mission.mission_id.clone(),
        status: mission.status.clone(),
        output: mission.output.clone(),
        error: mission.error.clone(),
        feedback: mission.feedback_since(since).to_vec(),
        feedback_total: mission.feedback.last().map(|f| f.cursor).unwrap_or(0),
    }
}

#[derive(serde::Deserialize)]
struct HistoryParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn mission_history(
    State(state): State<Arc<HubState>>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let missions = state.missions.lock().await;
    let Some(mission) = missions.get(&id) else {
        return error_response(&IntercomError::not_found("mission", &id));
    };
    let skip = mission.messages.len().saturating_sub(params.limit);
    Json(json!({
        "mission_id": mission.mission_id,
        "messages": &mission.messages[skip..],
    }))
    .into_response()
}

async fn feedback(State(state): State<Arc<HubState>>, body: Bytes) -> Response {
    let submission: FeedbackSubmission = match serde_json::from_slice(&body) {
        Ok(s) => s,
        Err(e) => return error_response(&IntercomError::BadEnvelope(e.to_string())),
    };
    state
        .console
        .notify_feedback(
            &submission.kind,
            &format!("{}: {}", submission.from_agent, submission.description),
        )
        .await;
    Json(json!({"ok": true})).into_response()
}
