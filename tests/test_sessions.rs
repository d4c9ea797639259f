//! Daemon session surface: register/deliver/status over HTTP, pid
//! liveness, and the check-inbox drain semantics.

mod common;

use serde_json::json;
use tempfile::TempDir;

use intercom::daemon::inbox;

use common::{daemon_state, get_signed, post_signed, register_session, spawn_daemon, TOKEN_B};

#[tokio::test]
async fn register_deliver_status_roundtrip() {
    let daemon = daemon_state("machine-b", TOKEN_B, "true");
    let url = spawn_daemon(daemon.clone()).await;
    let dir = TempDir::new().unwrap();
    let inbox_path = dir.path().join("s-20250101-abc123.jsonl");

    let resp = post_signed(
        &url,
        "/api/session/register",
        "machine-b",
        TOKEN_B,
        &json!({
            "session_id": "s-20250101-abc123",
            "project": "api",
            "pid": std::process::id(),
            "inbox_path": inbox_path.display().to_string(),
        }),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp = post_signed(
        &url,
        "/api/session/deliver",
        "machine-b",
        TOKEN_B,
        &json!({
            "project": "api",
            "thread_id": "t-111111",
            "from_agent": "machine-a/p",
            "message": "salut",
            "timestamp": chrono::Utc::now(),
        }),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "delivered");
    assert_eq!(body["session_id"], "s-20250101-abc123");

    let resp = get_signed(
        &url,
        "/api/session/s-20250101-abc123/status",
        &[],
        "machine-b",
        TOKEN_B,
    )
    .await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["session"]["project"], "api");
    assert_eq!(body["inbox_pending"], 1);

    let resp = get_signed(&url, "/api/sessions", &[], "machine-b", TOKEN_B).await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn deliver_to_dead_pid_removes_the_session() {
    let daemon = daemon_state("machine-b", TOKEN_B, "true");
    let url = spawn_daemon(daemon.clone()).await;
    let dir = TempDir::new().unwrap();

    // Far beyond any real pid space.
    let resp = post_signed(
        &url,
        "/api/session/register",
        "machine-b",
        TOKEN_B,
        &json!({
            "session_id": "s-dead",
            "project": "api",
            "pid": 0x3FFF_FFFFu32,
            "inbox_path": dir.path().join("s-dead.jsonl").display().to_string(),
        }),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 200);

    let resp = post_signed(
        &url,
        "/api/session/deliver",
        "machine-b",
        TOKEN_B,
        &json!({
            "project": "api",
            "thread_id": "t-1",
            "from_agent": "machine-a/p",
            "message": "anyone home?",
            "timestamp": chrono::Utc::now(),
        }),
    )
    .await;
    assert_eq!(resp.status().as_u16(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "no_active_session");

    // Entry gone, no inbox file created.
    let resp = get_signed(&url, "/api/sessions", &[], "machine-b", TOKEN_B).await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["sessions"].as_array().unwrap().is_empty());
    assert!(!dir.path().join("s-dead.jsonl").exists());
}

#[tokio::test]
async fn unregister_removes_presence() {
    let daemon = daemon_state("machine-b", TOKEN_B, "true");
    let url = spawn_daemon(daemon.clone()).await;
    let dir = TempDir::new().unwrap();
    register_session(&daemon, "s-1", "api", dir.path()).await;

    let resp = post_signed(
        &url,
        "/api/session/unregister",
        "machine-b",
        TOKEN_B,
        &json!({"session_id": "s-1"}),
    )
    .await;
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], true);

    assert!(daemon.sessions.presence().await.is_empty());
}

#[tokio::test]
async fn daemon_surface_requires_signatures() {
    let daemon = daemon_state("machine-b", TOKEN_B, "true");
    let url = spawn_daemon(daemon).await;
    let client = reqwest::Client::new();

    // Unsigned deliver is rejected.
    let resp = client
        .post(format!("{url}/api/session/deliver"))
        .json(&json!({"project": "api"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Health and discover stay open.
    let resp = client.get(format!("{url}/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = client
        .get(format!("{url}/api/discover"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["hub"], false);
    assert_eq!(body["machine_id"], "machine-b");
}

#[tokio::test]
async fn drain_is_exactly_once_across_deliveries() {
    let daemon = daemon_state("machine-b", TOKEN_B, "true");
    let dir = TempDir::new().unwrap();
    let inbox_path = register_session(&daemon, "s-1", "api", dir.path()).await;

    for text in ["un", "deux"] {
        daemon
            .sessions
            .deliver(
                None,
                "api",
                intercom::types::InboxEntry::new("t-1", "machine-a/p", text),
            )
            .await
            .unwrap();
    }

    let first = inbox::drain_unread(&inbox_path).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].message, "un");

    // Unchanged inbox: second drain is empty.
    assert!(inbox::drain_unread(&inbox_path).unwrap().is_empty());

    // A delivery after the drain is picked up alone.
    daemon
        .sessions
        .deliver(
            None,
            "api",
            intercom::types::InboxEntry::new("t-1", "machine-a/p", "trois"),
        )
        .await
        .unwrap();
    let third = inbox::drain_unread(&inbox_path).unwrap();
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].message, "trois");
}
