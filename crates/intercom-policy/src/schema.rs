//! Policy file schema.
//!
//! The policy document is YAML: a `defaults` block with the fallback
//! approval level, and an ordered `rules` list. Rules match on sender and
//! recipient globs, an optional message type, and an optional
//! case-insensitive regex over the payload text.

use serde::{Deserialize, Serialize};

use intercom_types::IntercomError;

/// How much human oversight a matched message requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalLevel {
    /// Auto-approve without notifying the operator.
    Never,
    /// Auto-approve, but post to the operator console.
    AlwaysAllow,
    /// Block and ask the operator for every message.
    Once,
    /// Ask once per mission, then auto-approve the rest of that mission.
    Mission,
    /// Ask once per `(from, to)` pair in this hub lifetime.
    Session,
}

impl ApprovalLevel {
    /// Whether this level blocks on an operator prompt (absent a grant).
    pub fn requires_prompt(&self) -> bool {
        matches!(
            self,
            ApprovalLevel::Once | ApprovalLevel::Mission | ApprovalLevel::Session
        )
    }
}

/// One ordered policy rule. Absent filters match everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Glob over the sender address, e.g. `workstation/*`.
    #[serde(default = "match_all")]
    pub from: String,
    /// Glob over the recipient address.
    #[serde(default = "match_all")]
    pub to: String,
    /// Message type filter (`ask`, `send`, `chat`, ...); `*` matches any.
    #[serde(default = "match_all", rename = "type")]
    pub message_type: String,
    /// Case-insensitive regex applied to the payload text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_pattern: Option<String>,
    pub approval: ApprovalLevel,
    /// Operator-facing label shown in prompts and console lines.
    #[serde(default)]
    pub label: String,
}

fn match_all() -> String {
    "*".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefaults {
    #[serde(default = "default_level")]
    pub require_approval: ApprovalLevel,
}

fn default_level() -> ApprovalLevel {
    ApprovalLevel::Once
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            require_approval: ApprovalLevel::Once,
        }
    }
}

/// The full policy document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub defaults: PolicyDefaults,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyFile {
    /// Parse a policy document from YAML.
    pub fn from_yaml(content: &str) -> Result<Self, IntercomError> {
        serde_yaml::from_str(content).map_err(|e| IntercomError::Config(e.to_string()))
    }

    /// Load from a file path; a missing file yields the defaults.
    pub fn load(path: &std::path::Path) -> Result<Self, IntercomError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "no policy file, defaulting to require_approval=once");
            return Ok(PolicyFile::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| IntercomError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_document() {
        let yaml = r#"
defaults:
  require_approval: once
rules:
  - from: "workstation/*"
    to: "*/home"
    type: chat
    approval: never
    label: "internal chat"
  - from: "*"
    to: "*"
    message_pattern: "rm -rf|sudo"
    approval: once
    label: "dangerous command"
"#;
        let policy = PolicyFile::from_yaml(yaml).unwrap();
        assert_eq!(policy.defaults.require_approval, ApprovalLevel::Once);
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].message_type, "chat");
        assert_eq!(policy.rules[0].approval, ApprovalLevel::Never);
        assert_eq!(
            policy.rules[1].message_pattern.as_deref(),
            Some("rm -rf|sudo")
        );
    }

    #[test]
    fn empty_document_gets_defaults() {
        let policy = PolicyFile::from_yaml("{}").unwrap();
        assert_eq!(policy.defaults.require_approval, ApprovalLevel::Once);
        assert!(policy.rules.is_empty());
    }

    #[test]
    fn rule_filters_default_to_match_all() {
        let yaml = r#"
rules:
  - approval: always_allow
"#;
        let policy = PolicyFile::from_yaml(yaml).unwrap();
        assert_eq!(policy.rules[0].from, "*");
        assert_eq!(policy.rules[0].to, "*");
        assert_eq!(policy.rules[0].message_type, "*");
        assert!(policy.rules[0].message_pattern.is_none());
    }

    #[test]
    fn prompt_levels() {
        assert!(ApprovalLevel::Once.requires_prompt());
        assert!(ApprovalLevel::Mission.requires_prompt());
        assert!(ApprovalLevel::Session.requires_prompt());
        assert!(!ApprovalLevel::Never.requires_prompt());
        assert!(!ApprovalLevel::AlwaysAllow.requires_prompt());
    }

    #[test]
    fn unknown_level_is_an_error() {
        let yaml = "rules:\n  - approval: sometimes\n";
        assert!(PolicyFile::from_yaml(yaml).is_err());
    }
}
