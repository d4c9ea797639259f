//! The message router.
//!
//! Turns an inbound envelope into an outbound delivery: attach a mission
//! and thread, consult the policy engine (parking on the operator when
//! required), dispatch to the target daemon, and keep the mission store
//! and operator console in step.
//!
//! Ordering: a per-mission async mutex serialises every route through the
//! same mission, including across approval pauses, so the mission log
//! observes hub-arrival order. Routes for different missions never
//! contend.

use std::str::FromStr;

use tracing::{info, warn};

use intercom_console::ApprovalReply;
use intercom_policy::{Decision, GrantScope};
use intercom_types::wire::{DeliverRequest, MissionStartRequest, RouteResponse};
use intercom_types::{
    ids::new_thread_id, AgentAddr, IntercomError, MachineRecord, MachineStatus, Message,
    MessageType, MissionStatus,
};

use crate::daemon_client::DeliverOutcome;
use crate::HubState;

/// How many trailing mission messages ride along as launch context.
const CONTEXT_MESSAGES: usize = 20;

/// Route one message. Route-level outcomes (denied, no session, offline
/// target) come back as [`RouteResponse`]; only envelope and lookup
/// failures surface as errors.
pub async fn route(state: &HubState, mut msg: Message) -> Result<RouteResponse, IntercomError> {
    msg.validate()?;

    let (mission_id, thread_id) = attach_mission(state, &mut msg).await?;

    // Serialise with other messages of the same mission.
    let lock = state.mission_lock(&mission_id).await;
    let _guard = lock.lock().await;

    if msg.kind == MessageType::Response {
        return record_response(state, &msg, &mission_id).await;
    }

    let target = AgentAddr::from_str(&msg.to_agent)?;
    let machine = match lookup_target(state, &target).await? {
        Ok(machine) => machine,
        Err(resp) => return Ok(resp),
    };

    // Policy check. `decide` is pure; the lock is held only for the call.
    let decision = state.policy.lock().await.decide(&msg);
    let notify = match decision {
        Decision::AutoAllow { notify } => notify,
        Decision::AutoDeny { reason } => {
            info!(mission = mission_id.as_str(), %reason, "auto-denied");
            fail_mission(state, &msg, &mission_id, MissionStatus::Denied, &reason).await;
            return Ok(RouteResponse::new("denied")
                .with_mission(mission_id)
                .with_error(reason));
        }
        Decision::AskOperator {
            label,
            prompt,
            scopes,
        } => {
            state
                .missions
                .lock()
                .await
                .get_or_create(&mission_id, &msg.from_agent, &msg.to_agent, msg.kind)
                .status = MissionStatus::PendingApproval;

            let reply = state
                .console
                .ask_approval(intercom_console::ApprovalRequest {
                    label,
                    prompt,
                    scopes,
                })
                .await;

            match reply {
                ApprovalReply::Granted(scope) => {
                    state.policy.lock().await.record(&msg, scope, true);
                    true
                }
                ApprovalReply::Denied => {
                    // Remember the denial so the rest of the mission fails
                    // without prompting again.
                    state
                        .policy
                        .lock()
                        .await
                        .record(&msg, GrantScope::Mission, false);
                    fail_mission(state, &msg, &mission_id, MissionStatus::Denied, "denied by operator")
                        .await;
                    return Ok(RouteResponse::new("denied")
                        .with_mission(mission_id)
                        .with_error(IntercomError::DeniedByOperator.label()));
                }
                ApprovalReply::TimedOut => {
                    fail_mission(state, &msg, &mission_id, MissionStatus::Denied, "approval timed out")
                        .await;
                    return Ok(RouteResponse::new("denied")
                        .with_mission(mission_id)
                        .with_error(IntercomError::ApprovalTimeout.label()));
                }
            }
        }
    };

    // Record the message in arrival order before dispatching.
    let context = {
        let mut missions = state.missions.lock().await;
        let mission = missions.get_or_create(&mission_id, &msg.from_agent, &msg.to_agent, msg.kind);
        mission.status = MissionStatus::Approved;
        mission.push_message(&msg.from_agent, mission_text(&msg));
        let skip = mission.messages.len().saturating_sub(CONTEXT_MESSAGES + 1);
        mission.messages[skip..mission.messages.len() - 1].to_vec()
    };

    if notify {
        state
            .console
            .post_to_mission(
                &mission_id,
                &format!("{} → {} [{}]: {}", msg.from_agent, msg.to_agent, msg.kind, mission_text(&msg)),
            )
            .await;
    }

    if msg.kind.is_session() {
        let thread_id = thread_id.unwrap_or_else(new_thread_id);
        return deliver_chat(state, &msg, &mission_id, &thread_id, &target, &machine).await;
    }

    let request = MissionStartRequest {
        mission_id: mission_id.clone(),
        project: target.project.clone(),
        from_agent: msg.from_agent.clone(),
        mission: mission_text(&msg),
        context_messages: context,
    };
    match state
        .daemons
        .mission_start(&machine.daemon_url, &machine.token, &request)
        .await
    {
        Ok(resp) if resp.status == "launched" => {
            state
                .missions
                .lock()
                .await
                .set_status(&mission_id, MissionStatus::Running);
            info!(mission = mission_id.as_str(), target = %target, "mission launched");
            Ok(RouteResponse::new("queued").with_mission(mission_id))
        }
        Ok(resp) => {
            let error = resp.error.unwrap_or_else(|| "launch failed".into());
            fail_mission(state, &msg, &mission_id, MissionStatus::Failed, &error).await;
            Ok(RouteResponse::new("error")
                .with_mission(mission_id)
                .with_error(error))
        }
        Err(e) => {
            warn!(mission = mission_id.as_str(), "mission dispatch failed: {e}");
            fail_mission(state, &msg, &mission_id, MissionStatus::Failed, &e.to_string()).await;
            Ok(RouteResponse::new("unreachable")
                .with_mission(mission_id)
                .with_error(e.to_string()))
        }
    }
}

/// Stop a mission's child agent on its daemon. Returns whether a running
/// child was actually killed. Shared by the signed HTTP route and the
/// operator's `/stop` command.
pub async fn stop_mission(state: &HubState, mission_id: &str) -> Result<bool, IntercomError> {
    let (kind, target) = {
        let missions = state.missions.lock().await;
        let mission = missions
            .get(mission_id)
            .ok_or_else(|| IntercomError::not_found("mission", mission_id))?;
        (mission.kind, mission.to_agent.clone())
    };
    if !kind.is_mission() {
        return Err(IntercomError::BadEnvelope(format!(
            "mission {mission_id} has no child agent to stop"
        )));
    }

    let target: AgentAddr = target.parse()?;
    let machine = state
        .registry
        .lock()
        .await
        .get_machine(&target.machine)?
        .ok_or_else(|| IntercomError::not_found("machine", &target.machine))?;

    let response = state
        .daemons
        .mission_stop(&machine.daemon_url, &machine.token, mission_id)
        .await?;

    if response.stopped {
        {
            let mut missions = state.missions.lock().await;
            if let Some(mission) = missions.get_mut(mission_id) {
                mission.status = MissionStatus::Failed;
                mission.error = Some("stopped".into());
            }
        }
        state
            .console
            .post_to_mission(mission_id, "mission stopped by operator")
            .await;
        info!(mission = mission_id, "mission stopped");
    }
    Ok(response.stopped)
}

/// Resolve the thread (for chat/reply) and the owning mission id.
async fn attach_mission(
    state: &HubState,
    msg: &mut Message,
) -> Result<(String, Option<String>), IntercomError> {
    match msg.kind {
        MessageType::Reply => {
            let thread_id = msg
                .thread_id()
                .map(str::to_string)
                .ok_or_else(|| IntercomError::BadEnvelope("reply requires thread_id".into()))?;

            let missions = state.missions.lock().await;
            let thread = missions
                .thread(&thread_id)
                .ok_or_else(|| IntercomError::not_found("thread", &thread_id))?;
            let mission_id = thread.mission_id.clone();
            if msg.to_agent.is_empty() {
                msg.to_agent = missions
                    .resolve_reply_target(&thread_id, &msg.from_agent)
                    .ok_or_else(|| {
                        IntercomError::BadEnvelope(format!(
                            "{} is not a participant of {thread_id}",
                            msg.from_agent
                        ))
                    })?;
            }
            msg.mission_id = Some(mission_id.clone());
            Ok((mission_id, Some(thread_id)))
        }
        MessageType::Chat => {
            let thread_id = msg
                .thread_id()
                .map(str::to_string)
                .unwrap_or_else(new_thread_id);

            let mut missions = state.missions.lock().await;
            let mission_id = match missions.thread(&thread_id) {
                Some(thread) => thread.mission_id.clone(),
                None => {
                    let mission_id = msg.ensure_mission_id();
                    missions.bind_thread(&thread_id, &msg.from_agent, &msg.to_agent, &mission_id);
                    mission_id
                }
            };
            msg.mission_id = Some(mission_id.clone());
            Ok((mission_id, Some(thread_id)))
        }
        _ => Ok((msg.ensure_mission_id(), None)),
    }
}

/// Look up the target machine and screen its status. Route-level refusals
/// come back as `Err(RouteResponse)` inside `Ok`.
async fn lookup_target(
    state: &HubState,
    target: &AgentAddr,
) -> Result<Result<MachineRecord, RouteResponse>, IntercomError> {
    let machine = state
        .registry
        .lock()
        .await
        .get_machine(&target.machine)?;
    let Some(machine) = machine else {
        return Ok(Err(RouteResponse::new("error")
            .with_error(format!("unknown machine: {}", target.machine))));
    };
    match machine.status {
        MachineStatus::Approved => {}
        MachineStatus::Revoked => {
            return Ok(Err(RouteResponse::new("error")
                .with_error(format!("machine {} is revoked", target.machine))));
        }
        MachineStatus::Pending | MachineStatus::Denied => {
            return Ok(Err(RouteResponse::new("error")
                .with_error(format!("machine {} is not approved", target.machine))));
        }
    }
    if !machine.is_online(chrono::Utc::now()) {
        return Ok(Err(RouteResponse::new("unreachable")
            .with_error(format!("machine {} is offline", target.machine))));
    }
    Ok(Ok(machine))
}

/// A `response` message: fold the agent's answer into the mission record.
async fn record_response(
    state: &HubState,
    msg: &Message,
    mission_id: &str,
) -> Result<RouteResponse, IntercomError> {
    {
        let mut missions = state.missions.lock().await;
        let mission = missions
            .get_mut(mission_id)
            .ok_or_else(|| IntercomError::not_found("mission", mission_id))?;
        mission.push_message(&msg.from_agent, msg.text());
        mission.output = Some(msg.text().to_string());
        mission.status = MissionStatus::Completed;
    }
    state
        .console
        .post_to_mission(mission_id, &format!("{}: {}", msg.from_agent, msg.text()))
        .await;
    Ok(RouteResponse::new("delivered").with_mission(mission_id.to_string()))
}

async fn deliver_chat(
    state: &HubState,
    msg: &Message,
    mission_id: &str,
    thread_id: &str,
    target: &AgentAddr,
    machine: &MachineRecord,
) -> Result<RouteResponse, IntercomError> {
    let request = DeliverRequest {
        project: target.project.clone(),
        session_id: msg
            .payload
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        thread_id: thread_id.to_string(),
        from_agent: msg.from_agent.clone(),
        message: msg.text().to_string(),
        timestamp: msg.timestamp,
    };

    match state
        .daemons
        .session_deliver(&machine.daemon_url, &machine.token, &request)
        .await
    {
        Ok(DeliverOutcome::Delivered { session_id }) => {
            state
                .missions
                .lock()
                .await
                .set_status(mission_id, MissionStatus::Running);
            info!(
                mission = mission_id,
                thread = thread_id,
                session = session_id.as_deref().unwrap_or("?"),
                "chat delivered"
            );
            Ok(RouteResponse::new("delivered")
                .with_mission(mission_id.to_string())
                .with_thread(thread_id.to_string()))
        }
        Ok(DeliverOutcome::NoActiveSession) => {
            // Deliberately no agent launch here; tell the sender and leave
            // a visibility note.
            state
                .console
                .post_to_mission(
                    mission_id,
                    &format!("chat to {target} not delivered: no active session"),
                )
                .await;
            Ok(RouteResponse::new("no_active_session")
                .with_mission(mission_id.to_string())
                .with_thread(thread_id.to_string()))
        }
        Err(e) => {
            warn!(mission = mission_id, "chat dispatch failed: {e}");
            fail_mission(state, msg, mission_id, MissionStatus::Failed, &e.to_string()).await;
            Ok(RouteResponse::new("unreachable")
                .with_mission(mission_id.to_string())
                .with_thread(thread_id.to_string())
                .with_error(e.to_string()))
        }
    }
}

async fn fail_mission(
    state: &HubState,
    msg: &Message,
    mission_id: &str,
    status: MissionStatus,
    error: &str,
) {
    let mut missions = state.missions.lock().await;
    let mission = missions.get_or_create(mission_id, &msg.from_agent, &msg.to_agent, msg.kind);
    mission.status = status;
    mission.error = Some(error.to_string());
}

/// The text a mission message carries: `message` for chat-like payloads,
/// `mission`/`prompt` for launches.
fn mission_text(msg: &Message) -> String {
    let text = msg.text();
    if !text.is_empty() {
        return text.to_string();
    }
    for key in ["mission", "prompt"] {
        if let Some(v) = msg.payload.get(key).and_then(|v| v.as_str()) {
            return v.to_string();
        }
    }
    String::new()
}
