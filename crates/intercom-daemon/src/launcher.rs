//! The agent launcher: supervised child agents with streamed feedback.
//!
//! A mission spawns the configured agent command with the mission prompt
//! as its final argument, inside a working directory that must sit under
//! the allow-list. The child emits newline-delimited JSON activity events
//! on stdout; a producer task parses them onto a bounded queue drained by
//! the mission-log writer. When the queue is full, the oldest `text`
//! event is dropped first; `tool_use` and `turn` events anchor the
//! timeline and are never dropped. A wall-clock cap kills the child and
//! preserves the partial logs.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use intercom_types::wire::{MissionSnapshot, MissionStartRequest};
use intercom_types::{AgentLauncherConfig, FeedbackItem, FeedbackKind, IntercomError, MissionStatus};

/// Bounded feedback queue capacity.
const QUEUE_CAP: usize = 256;

/// A mission's local record on the daemon.
#[derive(Debug, Clone)]
pub struct MissionRecord {
    pub status: MissionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub feedback: Vec<FeedbackItem>,
    pub turns: u32,
    pub ignored_events: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MissionRecord {
    fn new() -> Self {
        Self {
            status: MissionStatus::Running,
            output: None,
            error: None,
            feedback: Vec::new(),
            turns: 0,
            ignored_events: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn push_feedback(&mut self, kind: FeedbackKind) {
        let cursor = self.feedback.last().map(|f| f.cursor).unwrap_or(0) + 1;
        self.feedback.push(FeedbackItem {
            cursor,
            timestamp: Utc::now(),
            kind,
        });
    }

    fn finish(&mut self, status: MissionStatus, output: Option<String>, error: Option<String>) {
        self.status = status;
        self.output = output;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

/// A parsed stdout event, before cursor assignment.
#[derive(Debug)]
enum ParsedEvent {
    Text(String),
    ToolUse { tool: String, summary: String },
    Turn,
}

/// Bounded queue between the stdout pump and the mission-log writer.
struct FeedbackQueue {
    events: Mutex<VecDeque<ParsedEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl FeedbackQueue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an event, applying the backpressure policy at capacity.
    async fn push(&self, event: ParsedEvent) {
        let mut events = self.events.lock().await;
        if events.len() >= QUEUE_CAP {
            if let Some(pos) = events
                .iter()
                .position(|e| matches!(e, ParsedEvent::Text(_)))
            {
                events.remove(pos);
            } else if matches!(event, ParsedEvent::Text(_)) {
                // Queue is solid tool_use/turn; the new text is the one
                // that gives way.
                self.notify.notify_one();
                return;
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Supervisor for child agent processes on this machine.
pub struct AgentLauncher {
    config: AgentLauncherConfig,
    missions: Arc<Mutex<HashMap<String, MissionRecord>>>,
    /// mission_id -> child pid, for /health and stop().
    active: Arc<Mutex<HashMap<String, u32>>>,
}

impl AgentLauncher {
    pub fn new(config: AgentLauncherConfig) -> Self {
        Self {
            config,
            missions: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a working directory is inside the allow-list. An empty
    /// allow-list permits everything.
    pub fn path_allowed(&self, path: &Path) -> bool {
        if self.config.allowed_paths.is_empty() {
            return true;
        }
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.config.allowed_paths.iter().any(|allowed| {
            let allowed = allowed
                .canonicalize()
                .unwrap_or_else(|_| allowed.clone());
            resolved.starts_with(&allowed)
        })
    }

    /// Start a mission in the background. Fails fast (and records the
    /// failed mission) when the working directory is not allowed; any
    /// later failure lands in the mission record instead.
    pub async fn launch(
        &self,
        request: &MissionStartRequest,
        project_path: &Path,
    ) -> Result<(), IntercomError> {
        if !self.path_allowed(project_path) {
            let mut missions = self.missions.lock().await;
            let mut record = MissionRecord::new();
            record.finish(
                MissionStatus::Failed,
                None,
                Some(IntercomError::PathNotAllowed(project_path.display().to_string()).label().to_string()),
            );
            missions.insert(request.mission_id.clone(), record);
            return Err(IntercomError::PathNotAllowed(
                project_path.display().to_string(),
            ));
        }

        self.missions
            .lock()
            .await
            .insert(request.mission_id.clone(), MissionRecord::new());

        let launcher = self.clone_handles();
        let request = request.clone();
        let project_path = project_path.to_path_buf();
        tokio::spawn(async move {
            run_mission(launcher, request, project_path).await;
        });
        Ok(())
    }

    fn clone_handles(&self) -> LauncherHandles {
        LauncherHandles {
            config: self.config.clone(),
            missions: Arc::clone(&self.missions),
            active: Arc::clone(&self.active),
        }
    }

    pub async fn snapshot(
        &self,
        mission_id: &str,
        feedback_since: u64,
    ) -> Option<MissionSnapshot> {
        let missions = self.missions.lock().await;
        let record = missions.get(mission_id)?;
        let start = record
            .feedback
            .partition_point(|f| f.cursor <= feedback_since);
        Some(MissionSnapshot {
            mission_id: mission_id.to_string(),
            status: record.status.clone(),
            output: record.output.clone(),
            error: record.error.clone(),
            feedback: record.feedback[start..].to_vec(),
            feedback_total: record.feedback.last().map(|f| f.cursor).unwrap_or(0),
        })
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Kill a running mission. Returns whether anything was stopped.
    pub async fn stop(&self, mission_id: &str) -> bool {
        let pid = self.active.lock().await.get(mission_id).copied();
        let Some(pid) = pid else { return false };
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        );
        if let Some(record) = self.missions.lock().await.get_mut(mission_id) {
            record.finish(MissionStatus::Failed, None, Some("stopped".into()));
        }
        info!(mission = mission_id, pid, "mission stopped");
        true
    }
}

struct LauncherHandles {
    config: AgentLauncherConfig,
    missions: Arc<Mutex<HashMap<String, MissionRecord>>>,
    active: Arc<Mutex<HashMap<String, u32>>>,
}

/// Build the child prompt: mission id, recent context, then the task.
fn build_prompt(request: &MissionStartRequest) -> String {
    let mut parts = vec![format!("You are handling mission {}.\n", request.mission_id)];
    if !request.context_messages.is_empty() {
        parts.push("Recent conversation context:".into());
        for msg in &request.context_messages {
            parts.push(format!("  {}: {}", msg.from_agent, msg.message));
        }
        parts.push(String::new());
    }
    parts.push(format!("Current task:\n{}", request.mission));
    parts.push(format!(
        "\nUse the history verb with mission id {} if you need the full conversation.",
        request.mission_id
    ));
    parts.join("\n")
}

/// The supervised run: spawn, pump stdout, enforce the wall clock.
async fn run_mission(launcher: LauncherHandles, request: MissionStartRequest, cwd: PathBuf) {
    let prompt = build_prompt(&request);
    let mission_id = request.mission_id.clone();

    let mut command = Command::new(&launcher.config.default_command);
    command
        .args(&launcher.config.default_args)
        .arg(&prompt)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        // A nested agent refuses to start when it thinks it is already
        // inside one.
        .env_remove("CLAUDECODE");

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let error = format!("failed to spawn {}: {e}", launcher.config.default_command);
            warn!(mission = mission_id.as_str(), "{error}");
            if let Some(record) = launcher.missions.lock().await.get_mut(&mission_id) {
                record.finish(MissionStatus::Failed, None, Some(error));
            }
            return;
        }
    };

    if let Some(pid) = child.id() {
        launcher.active.lock().await.insert(mission_id.clone(), pid);
        info!(mission = mission_id.as_str(), pid, "child agent spawned");
    }

    let stdout = child.stdout.take();
    let queue = Arc::new(FeedbackQueue::new());

    // Mission-log writer: drains the queue into the record, assigning
    // cursors and turn numbers in order.
    let writer = {
        let queue = Arc::clone(&queue);
        let missions = Arc::clone(&launcher.missions);
        let mission_id = mission_id.clone();
        tokio::spawn(async move {
            loop {
                let closed = queue.closed.load(Ordering::Acquire);
                let drained: Vec<ParsedEvent> = {
                    let mut events = queue.events.lock().await;
                    events.drain(..).collect()
                };
                if !drained.is_empty() {
                    let mut missions = missions.lock().await;
                    if let Some(record) = missions.get_mut(&mission_id) {
                        for event in drained {
                            match event {
                                ParsedEvent::Text(text) => {
                                    record.push_feedback(FeedbackKind::Text { text })
                                }
                                ParsedEvent::ToolUse { tool, summary } => {
                                    record.push_feedback(FeedbackKind::ToolUse { tool, summary })
                                }
                                ParsedEvent::Turn => {
                                    record.turns += 1;
                                    let turn = record.turns;
                                    record.push_feedback(FeedbackKind::Turn { turn });
                                }
                            }
                        }
                    }
                }
                if closed {
                    return;
                }
                queue.notify.notified().await;
            }
        })
    };

    // Stdout pump with the wall-clock cap around it.
    let max_duration = Duration::from_secs(launcher.config.max_mission_duration);
    let pump = pump_stdout(stdout, &queue, &launcher, &mission_id);
    let timed_out = tokio::time::timeout(max_duration, pump).await.is_err();

    let outcome = if timed_out {
        let _ = child.kill().await;
        warn!(
            mission = mission_id.as_str(),
            cap = launcher.config.max_mission_duration,
            "mission hit wall-clock cap"
        );
        Err(launcher.config.max_mission_duration)
    } else {
        Ok(child.wait().await)
    };

    queue.close();
    let _ = writer.await;
    launcher.active.lock().await.remove(&mission_id);

    let mut missions = launcher.missions.lock().await;
    let Some(record) = missions.get_mut(&mission_id) else {
        return;
    };
    // stop() may have finalized the record before the killed child was
    // reaped; its verdict stands.
    if record.finished_at.is_some() {
        return;
    }
    match outcome {
        Err(cap) => {
            let output = record.output.take();
            record.finish(
                MissionStatus::Failed,
                output,
                Some(IntercomError::Timeout(cap).to_string()),
            );
        }
        Ok(Ok(status)) if status.success() => {
            let output = record.output.take();
            record.finish(MissionStatus::Completed, output, None);
            info!(mission = mission_id.as_str(), "mission completed");
        }
        Ok(Ok(status)) => {
            let output = record.output.take();
            record.finish(
                MissionStatus::Failed,
                output,
                Some(format!("agent exited with {status}")),
            );
        }
        Ok(Err(e)) => {
            record.finish(MissionStatus::Failed, None, Some(e.to_string()));
        }
    }
}

/// Read stdout line by line, parse activity events, feed the queue.
async fn pump_stdout(
    stdout: Option<tokio::process::ChildStdout>,
    queue: &Arc<FeedbackQueue>,
    launcher: &LauncherHandles,
    mission_id: &str,
) {
    let Some(stdout) = stdout else { return };
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            // Non-JSON output is part of the raw capture, not feedback.
            continue;
        };
        match event.get("type").and_then(|v| v.as_str()) {
            Some("text") => {
                let text = event
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                // The latest prose doubles as the output-so-far.
                if let Some(record) = launcher.missions.lock().await.get_mut(mission_id) {
                    record.output = Some(text.clone());
                }
                queue.push(ParsedEvent::Text(text)).await;
            }
            Some("tool_use") => {
                let tool = event
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let input = event.get("input").cloned().unwrap_or(serde_json::Value::Null);
                let summary = crate::summarize::summarize(&tool, &input);
                queue.push(ParsedEvent::ToolUse { tool, summary }).await;
            }
            Some("turn") => queue.push(ParsedEvent::Turn).await,
            Some("result") => {
                let text = event
                    .get("result")
                    .or_else(|| event.get("text"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if let Some(record) = launcher.missions.lock().await.get_mut(mission_id) {
                    record.output = Some(text.to_string());
                }
            }
            _ => {
                if let Some(record) = launcher.missions.lock().await.get_mut(mission_id) {
                    record.ignored_events += 1;
                }
            }
        }
    }
}
