//! Shared helpers for the integration tests: in-process hub and daemon
//! servers on ephemeral ports, signed HTTP helpers, and scripted
//! operator consoles.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use intercom::console::{ApprovalReply, ApprovalRequest, JoinDecision, OperatorConsole};
use intercom::daemon::launcher::AgentLauncher;
use intercom::daemon::DaemonState;
use intercom::hub::HubState;
use intercom::policy::{ApprovalEngine, GrantScope, PolicyFile};
use intercom::registry::Registry;
use intercom::types::{AgentLauncherConfig, MachineStatus, Message, MessageType, SessionInfo};

pub const TOKEN_A: &str = "ict_machine-a_0123456789abcdef";
pub const TOKEN_B: &str = "ict_machine-b_fedcba9876543210";

/// An operator console with a canned approval reply that counts prompts
/// and records mission posts.
pub struct CountingConsole {
    reply: ApprovalReply,
    pub prompts: AtomicUsize,
    posts: std::sync::Mutex<Vec<(String, String)>>,
}

impl CountingConsole {
    pub fn granting(scope: GrantScope) -> Self {
        Self::with_reply(ApprovalReply::Granted(scope))
    }

    pub fn denying() -> Self {
        Self::with_reply(ApprovalReply::Denied)
    }

    pub fn with_reply(reply: ApprovalReply) -> Self {
        Self {
            reply,
            prompts: AtomicUsize::new(0),
            posts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> Vec<(String, String)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorConsole for CountingConsole {
    async fn announce_join(&self, _m: &str, _d: &str, _ip: &str) -> Option<JoinDecision> {
        Some(JoinDecision::Approved)
    }

    async fn ask_approval(&self, _request: ApprovalRequest) -> ApprovalReply {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }

    async fn post_to_mission(&self, mission_id: &str, text: &str) {
        self.posts
            .lock()
            .unwrap()
            .push((mission_id.to_string(), text.to_string()));
    }

    async fn notify_feedback(&self, _kind: &str, _text: &str) {}
}

/// A hub with an in-memory registry and the given policy/console.
pub fn hub_state(policy_yaml: &str, console: Arc<dyn OperatorConsole>) -> Arc<HubState> {
    let registry = Registry::open_in_memory().expect("in-memory registry");
    let policy = ApprovalEngine::new(PolicyFile::from_yaml(policy_yaml).expect("policy yaml"));
    Arc::new(HubState::new("hub", registry, policy, console))
}

/// Serve a hub on an ephemeral port; returns its base URL.
pub async fn spawn_hub(state: Arc<HubState>) -> String {
    let app = intercom::hub::api::build_router(state);
    spawn_app(app).await
}

/// A daemon state with a shell-script launcher that emits the given
/// stdout lines as its child agent.
pub fn daemon_state(machine_id: &str, token: &str, script: &str) -> Arc<DaemonState> {
    let launcher = AgentLauncher::new(AgentLauncherConfig {
        default_command: "sh".into(),
        // The mission prompt lands in $1 and is ignored by the script.
        default_args: vec!["-c".into(), script.into(), "sh".into()],
        allowed_paths: Vec::new(),
        max_mission_duration: 30,
    });
    Arc::new(DaemonState::new(
        machine_id,
        token,
        launcher,
        Default::default(),
    ))
}

/// Serve a daemon on an ephemeral port; returns its base URL.
pub async fn spawn_daemon(state: Arc<DaemonState>) -> String {
    let app = intercom::daemon::api::build_router(state);
    spawn_app(app).await
}

async fn spawn_app(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Approve a machine in the hub registry and mark it online.
pub async fn approve_machine(
    hub: &HubState,
    machine_id: &str,
    token: &str,
    daemon_url: &str,
) {
    let registry = hub.registry.lock().await;
    registry
        .register_machine(machine_id, machine_id, "127.0.0.1", daemon_url, token, MachineStatus::Approved)
        .expect("register machine");
    registry
        .register_project(machine_id, "p", "", &[], "")
        .expect("register project");
    registry
        .update_heartbeat(machine_id, None, None)
        .expect("heartbeat");
}

/// POST a signed JSON body.
pub async fn post_signed(
    base_url: &str,
    path: &str,
    machine_id: &str,
    token: &str,
    body: &serde_json::Value,
) -> reqwest::Response {
    let bytes = serde_json::to_vec(body).expect("serialize body");
    let headers = intercom::auth::sign("POST", path, &bytes, token, machine_id);
    let client = reqwest::Client::new();
    let mut req = client
        .post(format!("{base_url}{path}"))
        .header("Content-Type", "application/json")
        .body(bytes);
    for (name, value) in headers.iter() {
        req = req.header(name, value);
    }
    req.send().await.expect("send request")
}

/// GET a signed path.
pub async fn get_signed(
    base_url: &str,
    path: &str,
    query: &[(&str, String)],
    machine_id: &str,
    token: &str,
) -> reqwest::Response {
    let headers = intercom::auth::sign("GET", path, b"", token, machine_id);
    let client = reqwest::Client::new();
    let mut req = client.get(format!("{base_url}{path}")).query(query);
    for (name, value) in headers.iter() {
        req = req.header(name, value);
    }
    req.send().await.expect("send request")
}

/// A chat message envelope.
pub fn chat_message(from: &str, to: &str, text: &str, thread_id: &str) -> Message {
    Message::new(
        from,
        to,
        MessageType::Chat,
        serde_json::json!({"message": text, "thread_id": thread_id}),
    )
}

/// Register an in-process session whose pid is the test process itself.
pub async fn register_session(
    daemon: &DaemonState,
    session_id: &str,
    project: &str,
    inbox_dir: &Path,
) -> std::path::PathBuf {
    let inbox_path = inbox_dir.join(format!("{session_id}.jsonl"));
    daemon
        .sessions
        .register(SessionInfo {
            session_id: session_id.into(),
            project: project.into(),
            pid: std::process::id(),
            inbox_path: inbox_path.display().to_string(),
            registered_at: chrono::Utc::now(),
            status: intercom::types::SessionStatus::Active,
            summary: None,
            recent_activity: Vec::new(),
        })
        .await;
    inbox_path
}
