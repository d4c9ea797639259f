//! Signed HTTP client for the hub, used by the daemon and the tool
//! server.
//!
//! Join and join-status are the two unauthenticated calls (the machine
//! has no token yet); everything else is signed with this machine's
//! token.

use std::time::Duration;

use reqwest::Client;

use intercom_types::wire::{
    DiscoverResponse, HeartbeatBody, JoinRequest, JoinResponse, MissionSnapshot, RegisterManifest,
    RouteResponse,
};
use intercom_types::{IntercomError, Message};

/// Default timeout for routing calls.
const ROUTE_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeats are best-effort and give up quickly.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HubClient {
    http: Client,
    hub_url: String,
    machine_id: String,
    token: String,
}

impl HubClient {
    pub fn new(hub_url: &str, machine_id: &str, token: &str) -> Self {
        Self {
            http: Client::new(),
            hub_url: hub_url.trim_end_matches('/').to_string(),
            machine_id: machine_id.to_string(),
            token: token.to_string(),
        }
    }

    /// Swap in the token issued at join approval.
    pub fn set_token(&mut self, token: &str) {
        self.token = token.to_string();
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    async fn post_signed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &[u8],
        timeout: Duration,
    ) -> Result<T, IntercomError> {
        let headers = intercom_auth::sign("POST", path, body, &self.token, &self.machine_id);
        let mut req = self
            .http
            .post(format!("{}{path}", self.hub_url))
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
        decode(resp, path).await
    }

    async fn get_signed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, IntercomError> {
        let headers = intercom_auth::sign("GET", path, b"", &self.token, &self.machine_id);
        let mut req = self
            .http
            .get(format!("{}{path}", self.hub_url))
            .query(query)
            .timeout(ROUTE_TIMEOUT);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        decode(resp, path).await
    }

    /// Identify the hub.
    pub async fn discover(&self) -> Result<DiscoverResponse, IntercomError> {
        let resp = self
            .http
            .get(format!("{}/api/discover", self.hub_url))
            .timeout(ROUTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        decode(resp, "/api/discover").await
    }

    /// First contact: unauthenticated join request.
    pub async fn join(&self, request: &JoinRequest) -> Result<JoinResponse, IntercomError> {
        let resp = self
            .http
            .post(format!("{}/api/join", self.hub_url))
            .timeout(ROUTE_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        decode(resp, "/api/join").await
    }

    /// Poll for the operator's join decision (and the token).
    pub async fn join_status(&self) -> Result<JoinResponse, IntercomError> {
        let resp = self
            .http
            .get(format!("{}/api/join/status/{}", self.hub_url, self.machine_id))
            .timeout(ROUTE_TIMEOUT)
            .send()
            .await
            .map_err(|e| IntercomError::Unreachable(e.to_string()))?;
        decode(resp, "/api/join/status").await
    }

    /// Upload this machine's project manifest.
    pub async fn register(&self, manifest: &RegisterManifest) -> Result<(), IntercomError> {
        let body = serde_json::to_vec(manifest)?;
        let _: serde_json::Value = self
            .post_signed("/api/register", &body, ROUTE_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Send one heartbeat with current session presence.
    pub async fn heartbeat(&self, body: &HeartbeatBody) -> Result<(), IntercomError> {
        let bytes = serde_json::to_vec(body)?;
        let _: serde_json::Value = self
            .post_signed("/api/heartbeat", &bytes, HEARTBEAT_TIMEOUT)
            .await?;
        Ok(())
    }

    /// List agents on the network.
    pub async fn list_agents(&self, filter: &str) -> Result<serde_json::Value, IntercomError> {
        self.get_signed("/api/agents", &[("filter", filter.to_string())])
            .await
    }

    /// Route a message through the hub.
    pub async fn route(&self, msg: &Message) -> Result<RouteResponse, IntercomError> {
        let body = serde_json::to_vec(msg)?;
        self.post_signed("/api/route", &body, ROUTE_TIMEOUT).await
    }

    /// Mission status with incremental feedback.
    pub async fn mission_status(
        &self,
        mission_id: &str,
        feedback_since: u64,
    ) -> Result<MissionSnapshot, IntercomError> {
        self.get_signed(
            &format!("/api/missions/{mission_id}"),
            &[("feedback_since", feedback_since.to_string())],
        )
        .await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    path: &str,
) -> Result<T, IntercomError> {
    let status = resp.status();
    if status.as_u16() == 401 {
        return Err(IntercomError::AuthStale);
    }
    if status.as_u16() == 403 {
        return Err(IntercomError::AuthUnknownMachine(path.to_string()));
    }
    if status.as_u16() == 404 {
        return Err(IntercomError::not_found("resource", path));
    }
    if !status.is_success() {
        return Err(IntercomError::Unreachable(format!(
            "{path} returned {status}"
        )));
    }
    resp.json()
        .await
        .map_err(|e| IntercomError::Unreachable(format!("bad response from {path}: {e}")))
}
