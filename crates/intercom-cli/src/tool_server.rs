//! The per-agent session shim.
//!
//! Announces a new session (with its inbox file) to the local daemon,
//! holds the registration while the agent runs, and unregisters on
//! shutdown. The agent-facing tool surface lives outside this crate;
//! this shim is what gives the agent chat presence.

use std::time::Duration;

use tracing::{info, warn};

use intercom_types::ids::new_session_id;
use intercom_types::wire::SessionRegisterRequest;
use intercom_types::{IntercomConfig, IntercomError};

/// Local daemon base URL.
const DAEMON_URL: &str = "http://127.0.0.1:7700";
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(config: IntercomConfig) -> Result<(), IntercomError> {
    let cwd = std::env::current_dir()?;
    let project = intercom_daemon::current_project(&config, &cwd);

    let session_id = new_session_id();
    let inbox_dir = config.inbox_dir();
    std::fs::create_dir_all(&inbox_dir)
        .map_err(|e| IntercomError::Config(format!("{}: {e}", inbox_dir.display())))?;
    let inbox_path = inbox_dir.join(format!("{session_id}.jsonl"));

    let request = SessionRegisterRequest {
        session_id: session_id.clone(),
        project: project.clone(),
        pid: std::process::id(),
        inbox_path: inbox_path.display().to_string(),
    };

    let client = reqwest::Client::new();
    post_signed(
        &client,
        &config,
        "/api/session/register",
        &serde_json::to_vec(&request)?,
        REGISTER_TIMEOUT,
    )
    .await?;
    info!(
        session = session_id.as_str(),
        project = project.as_str(),
        inbox = %inbox_path.display(),
        "session registered"
    );

    // Hand the session identity to the embedding agent runtime.
    println!(
        "{}",
        serde_json::json!({
            "session_id": session_id,
            "project": project,
            "inbox_path": inbox_path,
        })
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| IntercomError::Internal(e.to_string()))?;

    if let Err(e) = post_signed(
        &client,
        &config,
        "/api/session/unregister",
        &serde_json::to_vec(&serde_json::json!({"session_id": session_id}))?,
        UNREGISTER_TIMEOUT,
    )
    .await
    {
        warn!("failed to unregister session: {e}");
    }
    Ok(())
}

async fn post_signed(
    client: &reqwest::Client,
    config: &IntercomConfig,
    path: &str,
    body: &[u8],
    timeout: Duration,
) -> Result<(), IntercomError> {
    let headers = intercom_auth::sign(
        "POST",
        path,
        body,
        &config.auth.token,
        config.machine_id(),
    );
    let mut req = client
        .post(format!("{DAEMON_URL}{path}"))
        .timeout(timeout)
        .header("Content-Type", "application/json")
        .body(body.to_vec());
    for (name, value) in headers.iter() {
        req = req.header(name, value);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
    if resp.status().as_u16() == 401 {
        return Err(IntercomError::AuthBadSignature);
    }
    if !resp.status().is_success() {
        return Err(IntercomError::Unreachable(format!(
            "{path} returned {}",
            resp.status()
        )));
    }
    Ok(())
}
