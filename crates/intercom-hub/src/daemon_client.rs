//! Signed HTTP dispatch from the hub to target daemons.
//!
//! Two calls: `mission/start` (launch a child agent) and `session/deliver`
//! (drop a chat line into a session inbox). Requests are signed with the
//! *target machine's* token under the hub's identity, so the daemon can
//! verify with the one secret it holds.

use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use intercom_types::wire::{
    DeliverRequest, DeliverResponse, MissionSnapshot, MissionStartRequest, MissionStartResponse,
    MissionStopResponse,
};
use intercom_types::IntercomError;

/// Timeout for mission launches.
const MISSION_START_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for inbox delivery.
const DELIVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a chat delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverOutcome {
    Delivered { session_id: Option<String> },
    NoActiveSession,
}

pub struct DaemonClient {
    http: Client,
    /// Machine identity the hub signs as.
    hub_machine_id: String,
}

impl DaemonClient {
    pub fn new(hub_machine_id: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            hub_machine_id: hub_machine_id.into(),
        }
    }

    async fn post_signed(
        &self,
        daemon_url: &str,
        path: &str,
        token: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let headers = intercom_auth::sign("POST", path, body, token, &self.hub_machine_id);
        let mut req = self
            .http
            .post(format!("{}{path}", daemon_url.trim_end_matches('/')))
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        req.send().await
    }

    /// Fetch a mission snapshot (status + feedback tail) from the daemon
    /// running it.
    pub async fn mission_status(
        &self,
        daemon_url: &str,
        token: &str,
        mission_id: &str,
        feedback_since: u64,
    ) -> Result<MissionSnapshot, IntercomError> {
        let path = format!("/api/missions/{mission_id}");
        let headers = intercom_auth::sign("GET", &path, b"", token, &self.hub_machine_id);
        let mut req = self
            .http
            .get(format!("{}{path}", daemon_url.trim_end_matches('/')))
            .query(&[("feedback_since", feedback_since)])
            .timeout(MISSION_START_TIMEOUT);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Err(IntercomError::not_found("mission", mission_id));
        }
        if !resp.status().is_success() {
            return Err(IntercomError::Unreachable(format!(
                "missions/{mission_id} returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| IntercomError::Unreachable(format!("bad mission snapshot: {e}")))
    }

    /// Ask a daemon to launch a child agent for a mission.
    pub async fn mission_start(
        &self,
        daemon_url: &str,
        token: &str,
        request: &MissionStartRequest,
    ) -> Result<MissionStartResponse, IntercomError> {
        let body = serde_json::to_vec(request)?;
        let resp = self
            .post_signed(daemon_url, "/api/mission/start", token, &body, MISSION_START_TIMEOUT)
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status.as_u16() == 400 {
            // 400 carries a launch_failed body (e.g. path_not_allowed).
            return resp.json().await.map_err(|e| {
                IntercomError::Unreachable(format!("bad mission/start response: {e}"))
            });
        }
        let text = resp.text().await.unwrap_or_default();
        Err(IntercomError::Unreachable(format!(
            "mission/start returned {status}: {text}"
        )))
    }

    /// Kill a running mission's child agent on its daemon.
    pub async fn mission_stop(
        &self,
        daemon_url: &str,
        token: &str,
        mission_id: &str,
    ) -> Result<MissionStopResponse, IntercomError> {
        let path = format!("/api/mission/{mission_id}/stop");
        let resp = self
            .post_signed(daemon_url, &path, token, b"", MISSION_START_TIMEOUT)
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Err(IntercomError::not_found("mission", mission_id));
        }
        if !resp.status().is_success() {
            return Err(IntercomError::Unreachable(format!(
                "mission/stop returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| IntercomError::Unreachable(format!("bad mission/stop response: {e}")))
    }

    /// Deliver a chat line to a session inbox on a daemon.
    ///
    /// Idempotent at the inbox level, so one retry with a 1 s backoff is
    /// allowed on transport failure. A 404 means no live session; that is
    /// a routing outcome, not an error.
    pub async fn session_deliver(
        &self,
        daemon_url: &str,
        token: &str,
        request: &DeliverRequest,
    ) -> Result<DeliverOutcome, IntercomError> {
        let body = serde_json::to_vec(request)?;

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            match self
                .post_signed(daemon_url, "/api/session/deliver", token, &body, DELIVER_TIMEOUT)
                .await
            {
                Ok(resp) if resp.status().as_u16() == 404 => {
                    return Ok(DeliverOutcome::NoActiveSession);
                }
                Ok(resp) if resp.status().is_success() => {
                    let parsed: DeliverResponse = resp.json().await.map_err(|e| {
                        IntercomError::Unreachable(format!("bad deliver response: {e}"))
                    })?;
                    return Ok(DeliverOutcome::Delivered {
                        session_id: parsed.session_id,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    return Err(IntercomError::Unreachable(format!(
                        "session/deliver returned {status}"
                    )));
                }
                Err(e) => {
                    warn!(attempt, "deliver transport failure: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(IntercomError::Unreachable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}
