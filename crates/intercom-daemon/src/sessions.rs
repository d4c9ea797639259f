//! The daemon's active-session registry.
//!
//! Sessions are announced by each agent's tool server and live in an
//! in-process map. Delivery resolves a session by explicit id or by
//! project, probes the pid with a null signal, and appends to the
//! session's inbox file under a per-file mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::Mutex;
use tracing::{debug, info};

use intercom_types::wire::SessionPresence;
use intercom_types::{InboxEntry, IntercomError, SessionInfo};

use crate::inbox;

/// In-process registry of active sessions on this machine.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionInfo>>,
    /// Serialises read-modify-write per inbox file.
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. The newest registration for a project is the
    /// authoritative one; older sessions for the same project whose
    /// process has died are dropped on the spot.
    pub async fn register(&self, info: SessionInfo) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, existing| {
            existing.project != info.project || pid_alive(existing.pid)
        });
        info!(
            session = info.session_id.as_str(),
            project = info.project.as_str(),
            pid = info.pid,
            "session registered"
        );
        sessions.insert(info.session_id.clone(), info);
    }

    /// Remove a session. Returns whether it existed.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(session_id).is_some();
        if removed {
            info!(session = session_id, "session unregistered");
        }
        removed
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// All sessions, pruning entries whose pid is gone.
    pub async fn list_live(&self) -> Vec<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|id, s| {
            let alive = pid_alive(s.pid);
            if !alive {
                debug!(session = id.as_str(), pid = s.pid, "pruning dead session");
            }
            alive
        });
        let mut list: Vec<SessionInfo> = sessions.values().cloned().collect();
        list.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        list
    }

    /// Presence entries for the heartbeat body.
    pub async fn presence(&self) -> Vec<SessionPresence> {
        self.list_live()
            .await
            .into_iter()
            .map(|s| SessionPresence {
                session_id: s.session_id,
                project: s.project,
                status: s.status,
                summary: s.summary,
            })
            .collect()
    }

    /// Resolve the delivery target: explicit session id, else the most
    /// recently registered live session for the project.
    async fn resolve(
        &self,
        session_id: Option<&str>,
        project: &str,
    ) -> Result<SessionInfo, IntercomError> {
        let mut sessions = self.sessions.lock().await;

        let candidate = match session_id {
            Some(id) => sessions.get(id).cloned(),
            None => {
                let mut matching: Vec<&SessionInfo> = sessions
                    .values()
                    .filter(|s| s.project == project)
                    .collect();
                matching.sort_by(|a, b| b.registered_at.cmp(&a.registered_at));
                matching.first().map(|s| (*s).clone())
            }
        };

        let Some(session) = candidate else {
            return Err(IntercomError::NoActiveSession(project.to_string()));
        };

        // A dead process means no session: drop the entry atomically with
        // the lookup so the next resolve cannot find it again.
        if !pid_alive(session.pid) {
            sessions.remove(&session.session_id);
            return Err(IntercomError::NoActiveSession(project.to_string()));
        }
        Ok(session)
    }

    /// Deliver a chat line into a session inbox. Returns the session the
    /// line landed in.
    pub async fn deliver(
        &self,
        session_id: Option<&str>,
        project: &str,
        entry: InboxEntry,
    ) -> Result<String, IntercomError> {
        let session = self.resolve(session_id, project).await?;
        let path = PathBuf::from(&session.inbox_path);

        let lock = self.file_lock(&path).await;
        let _guard = lock.lock().await;
        inbox::append_entry(&path, &entry)?;
        Ok(session.session_id)
    }

    /// Unread count for a session's inbox.
    pub async fn inbox_pending(&self, session: &SessionInfo) -> Result<usize, IntercomError> {
        let path = PathBuf::from(&session.inbox_path);
        let lock = self.file_lock(&path).await;
        let _guard = lock.lock().await;
        inbox::pending_count(&path)
    }

    async fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        Arc::clone(
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Null-signal probe: does the pid exist (and is it signalable)?
fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(id: &str, project: &str, pid: u32, dir: &Path) -> SessionInfo {
        SessionInfo {
            session_id: id.into(),
            project: project.into(),
            pid,
            inbox_path: dir.join(format!("{id}.jsonl")).display().to_string(),
            registered_at: chrono::Utc::now(),
            status: intercom_types::SessionStatus::Active,
            summary: None,
            recent_activity: Vec::new(),
        }
    }

    fn own_pid() -> u32 {
        std::process::id()
    }

    // A pid that does not exist. Pid 1 always exists; the max pid space
    // is far below this value on Linux.
    const DEAD_PID: u32 = 0x3FFF_FFFF;

    #[tokio::test]
    async fn deliver_appends_one_line_to_the_right_inbox() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry
            .register(session("s-1", "api", own_pid(), dir.path()))
            .await;

        let sid = registry
            .deliver(None, "api", InboxEntry::new("t-111111", "a/p", "hi"))
            .await
            .unwrap();
        assert_eq!(sid, "s-1");

        let entries = inbox::read_entries(&dir.path().join("s-1.jsonl")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].from_agent, "a/p");
        assert!(!entries[0].read);
    }

    #[tokio::test]
    async fn deliver_to_unknown_project_is_no_active_session() {
        let registry = SessionRegistry::new();
        let err = registry
            .deliver(None, "ghost", InboxEntry::new("t-1", "a/p", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.label(), "no_active_session");
    }

    #[tokio::test]
    async fn dead_pid_is_removed_and_reported_as_no_session() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry
            .register(session("s-dead", "api", DEAD_PID, dir.path()))
            .await;

        let err = registry
            .deliver(None, "api", InboxEntry::new("t-1", "a/p", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.label(), "no_active_session");
        // The stale entry is gone.
        assert!(registry.get("s-dead").await.is_none());
        // No inbox file was created.
        assert!(!dir.path().join("s-dead.jsonl").exists());
    }

    #[tokio::test]
    async fn newest_registration_wins_for_a_project() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        let mut old = session("s-old", "api", own_pid(), dir.path());
        old.registered_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        registry.register(old).await;
        registry
            .register(session("s-new", "api", own_pid(), dir.path()))
            .await;

        let sid = registry
            .deliver(None, "api", InboxEntry::new("t-1", "a/p", "hi"))
            .await
            .unwrap();
        assert_eq!(sid, "s-new");
    }

    #[tokio::test]
    async fn explicit_session_id_overrides_project_match() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry
            .register(session("s-1", "api", own_pid(), dir.path()))
            .await;
        registry
            .register(session("s-2", "web", own_pid(), dir.path()))
            .await;

        let sid = registry
            .deliver(Some("s-2"), "api", InboxEntry::new("t-1", "a/p", "hi"))
            .await
            .unwrap();
        assert_eq!(sid, "s-2");
    }

    #[tokio::test]
    async fn list_live_prunes_dead_sessions() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry
            .register(session("s-live", "api", own_pid(), dir.path()))
            .await;
        registry
            .register(session("s-dead", "web", DEAD_PID, dir.path()))
            .await;

        let live = registry.list_live().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_id, "s-live");

        let presence = registry.presence().await;
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].project, "api");
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry
            .register(session("s-1", "api", own_pid(), dir.path()))
            .await;
        assert!(registry.unregister("s-1").await);
        assert!(!registry.unregister("s-1").await);
    }
}
