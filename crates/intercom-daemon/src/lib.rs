//! The Intercom machine daemon.
//!
//! Authenticates to the hub (join flow on first contact), uploads its
//! project manifest, announces session presence via heartbeats, serves
//! the session-inbox delivery surface, and supervises child agent
//! processes for remote missions.

pub mod api;
pub mod discovery;
pub mod hub_client;
pub mod inbox;
pub mod launcher;
pub mod sessions;
pub mod summarize;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use intercom_types::wire::{HeartbeatBody, JoinRequest, ProjectManifest, RegisterManifest};
use intercom_types::{IntercomConfig, IntercomError};

use crate::hub_client::HubClient;
use crate::launcher::AgentLauncher;
use crate::sessions::SessionRegistry;

/// Daemon listen address; the default Intercom port.
const LISTEN_ADDR: &str = "0.0.0.0:7700";
/// Heartbeat tick.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Join-status poll interval while waiting for operator approval.
const JOIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Shared daemon state, one per process.
pub struct DaemonState {
    pub machine_id: String,
    /// This machine's shared secret.
    pub token: String,
    pub sessions: SessionRegistry,
    pub launcher: AgentLauncher,
    /// project id -> on-disk root, from discovery.
    pub project_paths: HashMap<String, PathBuf>,
}

impl DaemonState {
    pub fn new(
        machine_id: impl Into<String>,
        token: impl Into<String>,
        launcher: AgentLauncher,
        project_paths: HashMap<String, PathBuf>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            token: token.into(),
            sessions: SessionRegistry::new(),
            launcher,
            project_paths,
        }
    }

    /// Working directory for a project's missions. Unknown projects and
    /// `home` run in the home directory.
    pub fn project_path(&self, project: &str) -> PathBuf {
        self.project_paths
            .get(project)
            .cloned()
            .unwrap_or_else(home_dir)
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Run the daemon until shutdown, on the default port.
pub async fn run_daemon(config: IntercomConfig) -> Result<(), IntercomError> {
    run_daemon_on(config, LISTEN_ADDR).await
}

/// Run the daemon on an explicit listen address (standalone mode puts the
/// daemon beside the hub on a second port).
pub async fn run_daemon_on(
    config: IntercomConfig,
    listen_addr: &str,
) -> Result<(), IntercomError> {
    let machine_id = config.machine_id().to_string();
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| IntercomError::Config(format!("{}: {e}", state_dir.display())))?;

    let projects = discovery::discover_projects(&config.discovery);
    let project_paths: HashMap<String, PathBuf> = projects
        .iter()
        .filter(|p| !p.path.is_empty())
        .map(|p| (p.id.clone(), PathBuf::from(&p.path)))
        .collect();

    // Token preference: config, then the one persisted at join approval.
    let token_path = state_dir.join("token");
    let mut token = config.auth.token.clone();
    if token.is_empty() {
        token = std::fs::read_to_string(&token_path)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
    }

    let mut hub: Option<Arc<HubClient>> = None;
    if !config.hub.url.is_empty() {
        let mut client = HubClient::new(&config.hub.url, &machine_id, &token);
        if token.is_empty() {
            token = join_hub(&mut client, &config, &machine_id).await?;
            if let Err(e) = std::fs::write(&token_path, &token) {
                warn!("failed to persist token: {e}");
            }
        }
        hub = Some(Arc::new(client));
    }

    let state = Arc::new(DaemonState::new(
        &machine_id,
        &token,
        AgentLauncher::new(config.agent_launcher.clone()),
        project_paths,
    ));

    if let Some(hub) = &hub {
        let manifest = RegisterManifest {
            machine_id: machine_id.clone(),
            projects,
        };
        if let Err(e) = hub.register(&manifest).await {
            warn!("failed to register with hub: {e}");
        }
        tokio::spawn(heartbeat_loop(Arc::clone(hub), Arc::clone(&state)));
    }

    let app = api::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| IntercomError::Config(format!("bind {listen_addr}: {e}")))?;
    info!(machine = machine_id.as_str(), listen = listen_addr, "daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| IntercomError::Internal(e.to_string()))
}

/// First-contact join: announce, then poll until the operator decides.
async fn join_hub(
    client: &mut HubClient,
    config: &IntercomConfig,
    machine_id: &str,
) -> Result<String, IntercomError> {
    let request = JoinRequest {
        machine_id: machine_id.to_string(),
        display_name: if config.machine.display_name.is_empty() {
            machine_id.to_string()
        } else {
            config.machine.display_name.clone()
        },
        overlay_ip: String::new(),
        daemon_url: String::new(),
    };

    let response = client.join(&request).await?;
    if response.status == "approved" {
        let token = response.token.unwrap_or_default();
        client.set_token(&token);
        return Ok(token);
    }
    if response.status == "denied" {
        return Err(IntercomError::Config("join request denied".into()));
    }

    info!(machine = machine_id, "join pending, waiting for operator approval");
    loop {
        tokio::time::sleep(JOIN_POLL_INTERVAL).await;
        match client.join_status().await {
            Ok(status) if status.status == "approved" => {
                let token = status.token.unwrap_or_default();
                client.set_token(&token);
                info!(machine = machine_id, "join approved");
                return Ok(token);
            }
            Ok(status) if status.status == "denied" => {
                return Err(IntercomError::Config("join request denied".into()));
            }
            Ok(_) => {}
            Err(e) => warn!("join status poll failed: {e}"),
        }
    }
}

/// Best-effort heartbeat: failures are logged and retried next tick,
/// never surfaced. The hub already knows this machine's addresses from
/// the join request, so the body only refreshes presence.
async fn heartbeat_loop(hub: Arc<HubClient>, state: Arc<DaemonState>) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let body = HeartbeatBody {
            machine_id: state.machine_id.clone(),
            overlay_ip: String::new(),
            daemon_url: String::new(),
            active_sessions: state.sessions.presence().await,
        };
        if let Err(e) = hub.heartbeat(&body).await {
            warn!("heartbeat failed: {e}");
        }
    }
}

/// Manifest helper for the tool server: which project does `cwd` belong
/// to on this machine?
pub fn current_project(config: &IntercomConfig, cwd: &std::path::Path) -> String {
    let projects: Vec<ProjectManifest> = discovery::discover_projects(&config.discovery);
    discovery::detect_current_project(&projects, cwd)
}
