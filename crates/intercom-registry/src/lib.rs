//! SQLite-backed registry of machines, projects, and join requests.
//!
//! The hub owns one [`Registry`]; writes are serialised by the caller
//! (the hub keeps it behind an async mutex), reads go through the same
//! handle. WAL mode keeps the single-writer pattern cheap.
//!
//! Invariants maintained here:
//! - `token` is non-empty iff `status = approved`;
//! - `status` transitions are monotonic except `approved -> revoked`;
//! - `last_seen` is set only by heartbeats.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use intercom_types::{IntercomError, MachineRecord, MachineStatus, ProjectRecord};

/// Filter for [`Registry::list_agents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentFilter {
    All,
    /// Machines with a heartbeat inside the online window.
    Online,
    /// A single machine.
    Machine(String),
}

impl AgentFilter {
    /// Parse the `filter` query value: `all`, `online`, or `machine:<id>`.
    pub fn parse(value: &str) -> Self {
        match value {
            "" | "all" => AgentFilter::All,
            "online" => AgentFilter::Online,
            other => match other.strip_prefix("machine:") {
                Some(id) => AgentFilter::Machine(id.to_string()),
                None => AgentFilter::All,
            },
        }
    }
}

/// A project row joined with its machine, as returned by `list_agents`.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub project: ProjectRecord,
    pub machine_status: MachineStatus,
    pub online: bool,
}

/// The durable registry.
pub struct Registry {
    conn: Connection,
}

impl Registry {
    /// Open (or create) the registry database at the given path.
    pub fn open(path: &Path) -> Result<Self, IntercomError> {
        let conn = Connection::open(path)
            .map_err(|e| IntercomError::Registry(format!("failed to open database: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| IntercomError::Registry(format!("failed to set WAL mode: {e}")))?;
        Self::init(conn)
    }

    /// In-memory registry for tests. No WAL; memory databases only
    /// support their own journal mode.
    pub fn open_in_memory() -> Result<Self, IntercomError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| IntercomError::Registry(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, IntercomError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL DEFAULT '',
                overlay_ip TEXT NOT NULL DEFAULT '',
                daemon_url TEXT NOT NULL DEFAULT '',
                token TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                last_seen TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS projects (
                machine_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                capabilities TEXT NOT NULL DEFAULT '[]',
                path TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (machine_id, project_id)
            );
            CREATE INDEX IF NOT EXISTS idx_machines_status ON machines(status);",
        )
        .map_err(|e| IntercomError::Registry(format!("failed to create schema: {e}")))?;

        Ok(Self { conn })
    }

    /// Register or update a machine (upsert). Status and token are written
    /// as given; callers use [`approve_join`](Self::approve_join) /
    /// [`deny_join`](Self::deny_join) for the join lifecycle.
    pub fn register_machine(
        &self,
        machine_id: &str,
        display_name: &str,
        overlay_ip: &str,
        daemon_url: &str,
        token: &str,
        status: MachineStatus,
    ) -> Result<(), IntercomError> {
        self.conn
            .execute(
                "INSERT INTO machines (id, display_name, overlay_ip, daemon_url, token, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     display_name = excluded.display_name,
                     overlay_ip = excluded.overlay_ip,
                     daemon_url = excluded.daemon_url,
                     token = excluded.token,
                     status = excluded.status",
                params![
                    machine_id,
                    display_name,
                    overlay_ip,
                    daemon_url,
                    token,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(wrap)?;
        Ok(())
    }

    /// Record a join request: creates a `pending` row, or leaves an
    /// existing row untouched (re-joining while pending is a no-op, and an
    /// approved machine keeps its approval).
    pub fn request_join(
        &self,
        machine_id: &str,
        display_name: &str,
        overlay_ip: &str,
        daemon_url: &str,
    ) -> Result<MachineStatus, IntercomError> {
        if let Some(existing) = self.get_machine(machine_id)? {
            return Ok(existing.status);
        }
        self.register_machine(
            machine_id,
            display_name,
            overlay_ip,
            daemon_url,
            "",
            MachineStatus::Pending,
        )?;
        Ok(MachineStatus::Pending)
    }

    /// Approve a pending join and issue its token. Idempotent: approving
    /// an already-approved machine returns the token it already has.
    pub fn approve_join(&self, machine_id: &str, token: &str) -> Result<String, IntercomError> {
        let machine = self
            .get_machine(machine_id)?
            .ok_or_else(|| IntercomError::not_found("machine", machine_id))?;

        if machine.status == MachineStatus::Approved {
            return Ok(machine.token);
        }

        self.conn
            .execute(
                "UPDATE machines SET status = 'approved', token = ?1 WHERE id = ?2",
                params![token, machine_id],
            )
            .map_err(wrap)?;
        tracing::info!(machine = machine_id, "join approved");
        Ok(token.to_string())
    }

    /// Deny a join. Idempotent; clears any token.
    pub fn deny_join(&self, machine_id: &str) -> Result<(), IntercomError> {
        let n = self
            .conn
            .execute(
                "UPDATE machines SET status = 'denied', token = '' WHERE id = ?1",
                params![machine_id],
            )
            .map_err(wrap)?;
        if n == 0 {
            return Err(IntercomError::not_found("machine", machine_id));
        }
        Ok(())
    }

    /// Revoke an approved machine: status `revoked`, token cleared.
    pub fn revoke_machine(&self, machine_id: &str) -> Result<(), IntercomError> {
        let n = self
            .conn
            .execute(
                "UPDATE machines SET status = 'revoked', token = '' WHERE id = ?1",
                params![machine_id],
            )
            .map_err(wrap)?;
        if n == 0 {
            return Err(IntercomError::not_found("machine", machine_id));
        }
        tracing::info!(machine = machine_id, "machine revoked");
        Ok(())
    }

    pub fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRecord>, IntercomError> {
        self.conn
            .query_row(
                "SELECT id, display_name, overlay_ip, daemon_url, token, status, last_seen
                 FROM machines WHERE id = ?1",
                params![machine_id],
                machine_from_row,
            )
            .optional()
            .map_err(wrap)
    }

    /// Token lookup for request verification. `None` when the machine is
    /// unknown or not approved (its token column is empty then).
    pub fn get_machine_token(&self, machine_id: &str) -> Result<Option<String>, IntercomError> {
        let token: Option<String> = self
            .conn
            .query_row(
                "SELECT token FROM machines WHERE id = ?1",
                params![machine_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(wrap)?;
        Ok(token.filter(|t| !t.is_empty()))
    }

    /// Register or update a project (upsert). Ensures the machine's
    /// synthetic `home` project exists alongside it.
    pub fn register_project(
        &self,
        machine_id: &str,
        project_id: &str,
        description: &str,
        capabilities: &[String],
        path: &str,
    ) -> Result<(), IntercomError> {
        let caps = serde_json::to_string(capabilities)
            .map_err(|e| IntercomError::Registry(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO projects (machine_id, project_id, description, capabilities, path)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(machine_id, project_id) DO UPDATE SET
                     description = excluded.description,
                     capabilities = excluded.capabilities,
                     path = excluded.path",
                params![machine_id, project_id, description, caps, path],
            )
            .map_err(wrap)?;

        if project_id != "home" {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO projects (machine_id, project_id, description)
                     VALUES (?1, 'home', 'General agent for this machine')",
                    params![machine_id],
                )
                .map_err(wrap)?;
        }
        Ok(())
    }

    /// Refresh a machine's heartbeat, optionally updating its addresses.
    pub fn update_heartbeat(
        &self,
        machine_id: &str,
        overlay_ip: Option<&str>,
        daemon_url: Option<&str>,
    ) -> Result<(), IntercomError> {
        let n = self
            .conn
            .execute(
                "UPDATE machines SET
                     last_seen = ?1,
                     overlay_ip = COALESCE(?2, overlay_ip),
                     daemon_url = COALESCE(?3, daemon_url)
                 WHERE id = ?4",
                params![Utc::now().to_rfc3339(), overlay_ip, daemon_url, machine_id],
            )
            .map_err(wrap)?;
        if n == 0 {
            return Err(IntercomError::not_found("machine", machine_id));
        }
        Ok(())
    }

    /// List projects joined with their machines, applying the filter.
    pub fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<AgentRow>, IntercomError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.machine_id, p.project_id, p.description, p.capabilities, p.path,
                        m.status, m.last_seen
                 FROM projects p JOIN machines m ON p.machine_id = m.id
                 ORDER BY p.machine_id, p.project_id",
            )
            .map_err(wrap)?;

        let now = Utc::now();
        let rows = stmt
            .query_map([], |row| {
                let caps: String = row.get(3)?;
                let status: String = row.get(5)?;
                let last_seen: Option<String> = row.get(6)?;
                Ok(AgentRow {
                    project: ProjectRecord {
                        machine_id: row.get(0)?,
                        project_id: row.get(1)?,
                        description: row.get(2)?,
                        capabilities: serde_json::from_str(&caps).unwrap_or_default(),
                        path: row.get(4)?,
                    },
                    machine_status: MachineStatus::parse(&status)
                        .unwrap_or(MachineStatus::Pending),
                    online: is_online(&status, last_seen.as_deref(), now),
                })
            })
            .map_err(wrap)?;

        let mut agents = Vec::new();
        for row in rows {
            let agent = row.map_err(wrap)?;
            let keep = match filter {
                AgentFilter::All => true,
                AgentFilter::Online => agent.online,
                AgentFilter::Machine(id) => &agent.project.machine_id == id,
            };
            if keep {
                agents.push(agent);
            }
        }
        Ok(agents)
    }

    pub fn list_machines(&self) -> Result<Vec<MachineRecord>, IntercomError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, display_name, overlay_ip, daemon_url, token, status, last_seen
                 FROM machines ORDER BY id",
            )
            .map_err(wrap)?;
        let rows = stmt.query_map([], machine_from_row).map_err(wrap)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(wrap)
    }

    pub fn get_pending_joins(&self) -> Result<Vec<MachineRecord>, IntercomError> {
        Ok(self
            .list_machines()?
            .into_iter()
            .filter(|m| m.status == MachineStatus::Pending)
            .collect())
    }

    /// Garbage-collect `pending`/`denied` rows older than `max_age`.
    /// Returns the number removed.
    pub fn gc_stale_joins(&self, max_age: Duration) -> Result<usize, IntercomError> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        let n = self
            .conn
            .execute(
                "DELETE FROM machines
                 WHERE status IN ('pending', 'denied') AND created_at < ?1",
                params![cutoff],
            )
            .map_err(wrap)?;
        if n > 0 {
            tracing::debug!(removed = n, "garbage-collected stale join requests");
        }
        Ok(n)
    }
}

fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<MachineRecord> {
    let status: String = row.get(5)?;
    let last_seen: Option<String> = row.get(6)?;
    Ok(MachineRecord {
        machine_id: row.get(0)?,
        display_name: row.get(1)?,
        overlay_ip: row.get(2)?,
        daemon_url: row.get(3)?,
        token: row.get(4)?,
        status: MachineStatus::parse(&status).unwrap_or(MachineStatus::Pending),
        last_seen: last_seen.as_deref().and_then(parse_ts),
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn is_online(status: &str, last_seen: Option<&str>, now: DateTime<Utc>) -> bool {
    status == "approved"
        && last_seen
            .and_then(parse_ts)
            .is_some_and(|seen| (now - seen).num_seconds() <= intercom_types::ONLINE_WINDOW_SECS)
}

fn wrap(e: rusqlite::Error) -> IntercomError {
    IntercomError::Registry(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::open_in_memory().unwrap()
    }

    #[test]
    fn open_creates_schema_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.db");
        let reg = Registry::open(&path).unwrap();
        assert!(reg.list_machines().unwrap().is_empty());
        assert!(path.exists());
    }

    #[test]
    fn join_lifecycle_issues_token_only_on_approval() {
        let reg = registry();
        let status = reg
            .request_join("box-a", "Box A", "100.64.0.2", "http://100.64.0.2:7700")
            .unwrap();
        assert_eq!(status, MachineStatus::Pending);

        let m = reg.get_machine("box-a").unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::Pending);
        assert!(m.token.is_empty());
        assert!(reg.get_machine_token("box-a").unwrap().is_none());

        let token = reg.approve_join("box-a", "ict_box-a_feedface").unwrap();
        assert_eq!(token, "ict_box-a_feedface");
        let m = reg.get_machine("box-a").unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::Approved);
        assert_eq!(
            reg.get_machine_token("box-a").unwrap().as_deref(),
            Some("ict_box-a_feedface")
        );
    }

    #[test]
    fn approve_join_is_idempotent() {
        let reg = registry();
        reg.request_join("box-a", "Box A", "", "").unwrap();
        let first = reg.approve_join("box-a", "ict_box-a_token1").unwrap();
        // Second approval keeps the original token.
        let second = reg.approve_join("box-a", "ict_box-a_token2").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejoin_while_pending_is_a_noop() {
        let reg = registry();
        reg.request_join("box-a", "Box A", "", "").unwrap();
        let status = reg.request_join("box-a", "Box A again", "", "").unwrap();
        assert_eq!(status, MachineStatus::Pending);
        assert_eq!(reg.get_pending_joins().unwrap().len(), 1);
    }

    #[test]
    fn rejoin_after_approval_reports_approved() {
        let reg = registry();
        reg.request_join("box-a", "Box A", "", "").unwrap();
        reg.approve_join("box-a", "ict_box-a_tok").unwrap();
        let status = reg.request_join("box-a", "Box A", "", "").unwrap();
        assert_eq!(status, MachineStatus::Approved);
    }

    #[test]
    fn deny_and_revoke_clear_tokens() {
        let reg = registry();
        reg.request_join("box-a", "", "", "").unwrap();
        reg.deny_join("box-a").unwrap();
        let m = reg.get_machine("box-a").unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::Denied);
        assert!(m.token.is_empty());
        // Idempotent.
        reg.deny_join("box-a").unwrap();

        reg.request_join("box-b", "", "", "").unwrap();
        reg.approve_join("box-b", "ict_box-b_tok").unwrap();
        reg.revoke_machine("box-b").unwrap();
        let m = reg.get_machine("box-b").unwrap().unwrap();
        assert_eq!(m.status, MachineStatus::Revoked);
        assert!(reg.get_machine_token("box-b").unwrap().is_none());
    }

    #[test]
    fn register_machine_is_idempotent_upsert() {
        let reg = registry();
        for _ in 0..2 {
            reg.register_machine(
                "box-a",
                "Box A",
                "100.64.0.2",
                "http://100.64.0.2:7700",
                "tok",
                MachineStatus::Approved,
            )
            .unwrap();
        }
        assert_eq!(reg.list_machines().unwrap().len(), 1);
        let m = reg.get_machine("box-a").unwrap().unwrap();
        assert_eq!(m.display_name, "Box A");
        assert_eq!(m.token, "tok");
    }

    #[test]
    fn register_project_creates_home_implicitly() {
        let reg = registry();
        reg.register_machine("box-a", "", "", "", "tok", MachineStatus::Approved)
            .unwrap();
        reg.register_project("box-a", "api-server", "The API", &["rust".into()], "/code/api")
            .unwrap();

        let agents = reg.list_agents(&AgentFilter::All).unwrap();
        let ids: Vec<&str> = agents
            .iter()
            .map(|a| a.project.project_id.as_str())
            .collect();
        assert_eq!(ids, vec!["api-server", "home"]);
    }

    #[test]
    fn heartbeat_sets_last_seen_and_online() {
        let reg = registry();
        reg.register_machine("box-a", "", "", "", "tok", MachineStatus::Approved)
            .unwrap();
        reg.register_project("box-a", "home", "", &[], "").unwrap();

        let before = reg.list_agents(&AgentFilter::Online).unwrap();
        assert!(before.is_empty());

        reg.update_heartbeat("box-a", Some("100.64.0.9"), None).unwrap();
        let m = reg.get_machine("box-a").unwrap().unwrap();
        assert!(m.last_seen.is_some());
        assert_eq!(m.overlay_ip, "100.64.0.9");

        let online = reg.list_agents(&AgentFilter::Online).unwrap();
        assert_eq!(online.len(), 1);
        assert!(online[0].online);
    }

    #[test]
    fn heartbeat_for_unknown_machine_errors() {
        let reg = registry();
        let err = reg.update_heartbeat("ghost", None, None).unwrap_err();
        assert_eq!(err.label(), "not_found");
    }

    #[test]
    fn list_agents_machine_filter() {
        let reg = registry();
        for id in ["box-a", "box-b"] {
            reg.register_machine(id, "", "", "", "tok", MachineStatus::Approved)
                .unwrap();
            reg.register_project(id, "home", "", &[], "").unwrap();
        }
        let filtered = reg
            .list_agents(&AgentFilter::Machine("box-b".into()))
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].project.machine_id, "box-b");
    }

    #[test]
    fn filter_parse() {
        assert_eq!(AgentFilter::parse("all"), AgentFilter::All);
        assert_eq!(AgentFilter::parse(""), AgentFilter::All);
        assert_eq!(AgentFilter::parse("online"), AgentFilter::Online);
        assert_eq!(
            AgentFilter::parse("machine:box-a"),
            AgentFilter::Machine("box-a".into())
        );
    }

    #[test]
    fn gc_removes_only_stale_pending_rows() {
        let reg = registry();
        reg.request_join("stale", "", "", "").unwrap();
        reg.request_join("fresh", "", "", "").unwrap();
        reg.approve_join("fresh", "tok").unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(reg.gc_stale_joins(Duration::hours(1)).unwrap(), 0);
        // Everything pending is older than "zero seconds ago".
        assert_eq!(reg.gc_stale_joins(Duration::seconds(-1)).unwrap(), 1);
        assert!(reg.get_machine("stale").unwrap().is_none());
        assert!(reg.get_machine("fresh").unwrap().is_some());
    }
}
