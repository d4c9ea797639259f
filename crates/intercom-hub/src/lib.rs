//! The Intercom hub: registry owner, approval policy, and message router.
//!
//! All hub state hangs off [`HubState`], threaded explicitly into every
//! handler: the durable [`Registry`], the in-memory mission store and
//! thread map, the policy engine with its runtime grants, session
//! presence from heartbeats, and the operator console adapter. No
//! process-wide singletons.

pub mod api;
pub mod daemon_client;
pub mod missions;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{info, warn};

use intercom_console::telegram::{OperatorCommand, TelegramConsole};
use intercom_console::{NoopConsole, OperatorConsole};
use intercom_policy::{ApprovalEngine, PolicyFile};
use intercom_registry::Registry;
use intercom_types::wire::SessionPresence;
use intercom_types::{IntercomConfig, IntercomError};

use crate::daemon_client::DaemonClient;
use crate::missions::MissionStore;

/// Shared hub state, one per process.
pub struct HubState {
    /// The hub's own machine id (used as signer identity toward daemons).
    pub machine_id: String,
    pub registry: Mutex<Registry>,
    pub missions: Mutex<MissionStore>,
    pub policy: Mutex<ApprovalEngine>,
    /// machine_id -> active sessions from the latest heartbeat.
    pub presence: Mutex<HashMap<String, Vec<SessionPresence>>>,
    pub console: Arc<dyn OperatorConsole>,
    pub daemons: DaemonClient,
    /// Per-mission wait points; held across approval parking so messages
    /// of one mission stay in arrival order.
    mission_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HubState {
    pub fn new(
        machine_id: impl Into<String>,
        registry: Registry,
        policy: ApprovalEngine,
        console: Arc<dyn OperatorConsole>,
    ) -> Self {
        let machine_id = machine_id.into();
        Self {
            daemons: DaemonClient::new(&machine_id),
            machine_id,
            registry: Mutex::new(registry),
            missions: Mutex::new(MissionStore::new()),
            policy: Mutex::new(policy),
            presence: Mutex::new(HashMap::new()),
            console,
            mission_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The wait primitive for one mission. Entries live for the process
    /// lifetime, bounded by the mission count.
    pub async fn mission_lock(&self, mission_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.mission_locks.lock().await;
        Arc::clone(
            locks
                .entry(mission_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Generate a machine token: `ict_<machine>_<32 hex>`.
pub fn generate_token(machine_id: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("ict_{machine_id}_{}", hex::encode(bytes))
}

/// Run the hub until shutdown: HTTP surface, console poller, and the
/// pending-join garbage collector.
pub async fn run_hub(config: IntercomConfig) -> Result<(), IntercomError> {
    let state_dir = config.state_dir();
    std::fs::create_dir_all(&state_dir)
        .map_err(|e| IntercomError::Config(format!("{}: {e}", state_dir.display())))?;

    let registry = Registry::open(&state_dir.join("registry.db"))?;
    let policy_file = PolicyFile::load(&state_dir.join("policies.yml"))?;
    info!(rules = policy_file.rules.len(), "policy loaded");
    let policy = ApprovalEngine::new(policy_file);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Wire the operator console: Telegram when configured, no-op otherwise.
    let mut telegram: Option<(Arc<TelegramConsole>, tokio::sync::mpsc::Receiver<OperatorCommand>)> =
        None;
    let console: Arc<dyn OperatorConsole> = if config.telegram.is_configured() {
        let (tg, commands) = TelegramConsole::new(
            &config.telegram.bot_token,
            config.telegram.supergroup_id,
            config.telegram.allowed_users.clone(),
        );
        let tg = Arc::new(tg);
        telegram = Some((Arc::clone(&tg), commands));
        tg
    } else {
        warn!("no operator console configured, approvals auto-deny");
        Arc::new(NoopConsole::new())
    };

    let state = Arc::new(HubState::new(
        config.machine_id(),
        registry,
        policy,
        console,
    ));

    if let Some((tg, commands)) = telegram {
        tg.start(shutdown_rx.clone());
        tokio::spawn(handle_operator_commands(
            Arc::clone(&state),
            tg,
            commands,
        ));
    }

    // Pending/denied joins are garbage-collected after a week.
    {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let registry = state.registry.lock().await;
                        if let Err(e) = registry.gc_stale_joins(chrono::Duration::days(7)) {
                            warn!("join GC failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    let app = api::build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.hub.listen)
        .await
        .map_err(|e| IntercomError::Config(format!("bind {}: {e}", config.hub.listen)))?;
    info!(listen = config.hub.listen.as_str(), "hub listening");

    let mut shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.wait_for(|&v| v) => {}
            }
        })
        .await
        .map_err(|e| IntercomError::Internal(e.to_string()))?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Answer `/agents` and `/machines` operator commands from the registry.
async fn handle_operator_commands(
    state: Arc<HubState>,
    console: Arc<TelegramConsole>,
    mut commands: tokio::sync::mpsc::Receiver<OperatorCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            OperatorCommand::ListAgents => {
                let agents = {
                    let registry = state.registry.lock().await;
                    registry.list_agents(&intercom_registry::AgentFilter::All)
                };
                let text = match agents {
                    Ok(agents) if agents.is_empty() => "No agents registered.".to_string(),
                    Ok(agents) => {
                        let mut lines = vec!["Registered agents:".to_string()];
                        for a in agents {
                            lines.push(format!(
                                "- {}/{} ({})",
                                a.project.machine_id,
                                a.project.project_id,
                                if a.online { "online" } else { "offline" },
                            ));
                        }
                        lines.join("\n")
                    }
                    Err(e) => format!("registry error: {e}"),
                };
                console.reply(&text).await;
            }
            OperatorCommand::ListMachines => {
                let machines = {
                    let registry = state.registry.lock().await;
                    registry.list_machines()
                };
                let text = match machines {
                    Ok(machines) if machines.is_empty() => "No machines registered.".to_string(),
                    Ok(machines) => {
                        let mut lines = vec!["Machines:".to_string()];
                        for m in machines {
                            lines.push(format!(
                                "- {} ({}) {}",
                                m.machine_id, m.status, m.display_name
                            ));
                        }
                        lines.join("\n")
                    }
                    Err(e) => format!("registry error: {e}"),
                };
                console.reply(&text).await;
            }
            OperatorCommand::StopMission { mission_id } => {
                let text = if mission_id.is_empty() {
                    "Usage: /stop <mission-id>".to_string()
                } else {
                    match router::stop_mission(&state, &mission_id).await {
                        Ok(true) => format!("Mission {mission_id} stopped."),
                        Ok(false) => format!("Mission {mission_id} has no running agent."),
                        Err(e) => format!("Stop failed: {e}"),
                    }
                };
                console.reply(&text).await;
            }
            OperatorCommand::TopicMessage { thread_id, text } => {
                // Operator typed into a mission topic; today that is just
                // logged for visibility.
                info!(thread_id, text = text.as_str(), "operator message in mission topic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_carry_machine_and_entropy() {
        let t1 = generate_token("box-a");
        let t2 = generate_token("box-a");
        assert!(t1.starts_with("ict_box-a_"));
        assert_eq!(t1.len(), "ict_box-a_".len() + 32);
        assert_ne!(t1, t2);
    }

    #[tokio::test]
    async fn mission_locks_are_per_mission() {
        let state = HubState::new(
            "hub",
            Registry::open_in_memory().unwrap(),
            ApprovalEngine::new(Default::default()),
            Arc::new(NoopConsole::new()),
        );
        let a1 = state.mission_lock("m-1").await;
        let a2 = state.mission_lock("m-1").await;
        let b = state.mission_lock("m-2").await;
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        // Holding m-1 must not block m-2.
        let _guard = a1.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(a2.try_lock().is_err());
    }
}
