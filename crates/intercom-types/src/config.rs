//! YAML configuration for hub and daemon processes.
//!
//! Loaded from `~/.config/intercom/config.yml` (or a `--config` override)
//! and layered with environment variables so secrets can stay out of the
//! file: `TELEGRAM_BOT_TOKEN`, `TELEGRAM_SUPERGROUP_ID`,
//! `TELEGRAM_OWNER_ID`, `HUB_URL`, `INTERCOM_TOKEN`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IntercomError;

/// Which roles this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Hub,
    Daemon,
    /// Hub and daemon in one process, for single-machine setups.
    Standalone,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Standalone
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSection {
    #[serde(default = "default_machine_id")]
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

fn default_machine_id() -> String {
    "unknown".into()
}

/// Operator-console (Telegram) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Forum-enabled supergroup where mission topics are created.
    #[serde(default)]
    pub supergroup_id: i64,
    /// Telegram user ids allowed to approve and command.
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && self.supergroup_id != 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubSection {
    /// Hub base URL as seen from daemons, e.g. `http://100.64.0.1:7700`.
    #[serde(default)]
    pub url: String,
    /// Listen address for the hub HTTP surface.
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:7700".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// This machine's shared secret, issued at join approval.
    #[serde(default)]
    pub token: String,
}

/// Project auto-discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Roots scanned one level deep for project markers.
    #[serde(default)]
    pub scan_paths: Vec<PathBuf>,
    /// Marker files identifying a project directory.
    #[serde(default = "default_markers")]
    pub detect_by: Vec<String>,
    /// Directory names to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_markers() -> Vec<String> {
    vec!["CLAUDE.md".into(), ".git".into(), "AGENTS.md".into()]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_paths: Vec::new(),
            detect_by: default_markers(),
            exclude: Vec::new(),
        }
    }
}

/// Child agent launcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLauncherConfig {
    #[serde(default = "default_command")]
    pub default_command: String,
    #[serde(default = "default_args")]
    pub default_args: Vec<String>,
    /// Working directories must be under one of these.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
    /// Wall-clock cap in seconds before the child is killed.
    #[serde(default = "default_max_duration")]
    pub max_mission_duration: u64,
}

fn default_command() -> String {
    "claude".into()
}

fn default_args() -> Vec<String> {
    vec!["-p".into()]
}

fn default_max_duration() -> u64 {
    1800
}

impl Default for AgentLauncherConfig {
    fn default() -> Self {
        Self {
            default_command: default_command(),
            default_args: default_args(),
            allowed_paths: Vec::new(),
            max_mission_duration: default_max_duration(),
        }
    }
}

/// Top-level configuration for an Intercom process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntercomConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub machine: MachineSection,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub agent_launcher: AgentLauncherConfig,
    /// State directory for inboxes and the registry database.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl IntercomConfig {
    /// Parse a configuration from a YAML string and apply env overrides.
    pub fn from_yaml(content: &str) -> Result<Self, IntercomError> {
        let mut config: IntercomConfig = serde_yaml::from_str(content)
            .map_err(|e| IntercomError::Config(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from a file path. A missing file yields the defaults (env
    /// overrides still apply), matching first-run behavior.
    pub fn load(path: &Path) -> Result<Self, IntercomError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| IntercomError::Config(format!("{}: {e}", path.display())))?;
            Self::from_yaml(&content)
        } else {
            let mut config = IntercomConfig::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine.id
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.mode, Mode::Hub | Mode::Standalone)
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self.mode, Mode::Daemon | Mode::Standalone)
    }

    /// State directory, defaulting to `~/.config/intercom`.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs_home()
            .join(".config")
            .join("intercom")
    }

    /// Inbox directory under the state dir.
    pub fn inbox_dir(&self) -> PathBuf {
        self.state_dir().join("inbox")
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
        }
        if let Ok(v) = std::env::var("TELEGRAM_SUPERGROUP_ID") {
            if let Ok(id) = v.parse() {
                self.telegram.supergroup_id = id;
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_OWNER_ID") {
            if let Ok(id) = v.parse() {
                self.telegram.allowed_users = vec![id];
            }
        }
        if let Ok(v) = std::env::var("HUB_URL") {
            self.hub.url = v;
        }
        if let Ok(v) = std::env::var("INTERCOM_TOKEN") {
            self.auth.token = v;
        }
    }
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
