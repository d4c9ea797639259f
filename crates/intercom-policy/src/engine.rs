//! The approval engine: pure rule evaluation plus a runtime grant cache.
//!
//! Evaluation priority:
//!   1. Mission grants (exact mission id + from + to)
//!   2. Pair grants (from + to, hub lifetime)
//!   3. Static rules, first match wins
//!   4. The default level
//!
//! [`ApprovalEngine::decide`] is pure: it reads the grant cache but never
//! mutates it and performs no I/O. The router calls
//! [`ApprovalEngine::record`] after the operator (or a rule) has spoken.

use std::collections::HashMap;

use glob::Pattern;
use regex::RegexBuilder;

use intercom_types::Message;

use crate::schema::{ApprovalLevel, PolicyFile, PolicyRule};

/// Scope of a runtime grant, as chosen by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrantScope {
    /// One message only; nothing is recorded.
    Once,
    /// The rest of the current mission.
    Mission,
    /// The `(from, to)` pair for this hub lifetime.
    Session,
    /// Like `Session`; the operator's "always" button.
    AlwaysAllow,
}

impl GrantScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantScope::Once => "once",
            GrantScope::Mission => "mission",
            GrantScope::Session => "session",
            GrantScope::AlwaysAllow => "always_allow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(GrantScope::Once),
            "mission" => Some(GrantScope::Mission),
            "session" => Some(GrantScope::Session),
            "always_allow" | "always" => Some(GrantScope::AlwaysAllow),
            _ => None,
        }
    }
}

/// What the router should do with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Deliver. `notify` is false only for `never` rules, which stay
    /// invisible to the operator.
    AutoAllow { notify: bool },
    /// Refuse without prompting; a negative grant covers this message.
    AutoDeny { reason: String },
    /// Park the message and ask the operator.
    AskOperator {
        label: String,
        prompt: String,
        scopes: Vec<GrantScope>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GrantKey {
    Mission {
        mission_id: String,
        from: String,
        to: String,
    },
    Pair {
        from: String,
        to: String,
    },
}

/// Policy engine with static rules and runtime grants.
pub struct ApprovalEngine {
    policy: PolicyFile,
    /// Positive (`true`) and negative (`false`) grants.
    grants: HashMap<GrantKey, bool>,
}

impl ApprovalEngine {
    pub fn new(policy: PolicyFile) -> Self {
        Self {
            policy,
            grants: HashMap::new(),
        }
    }

    /// Evaluate a message. Pure: no I/O, no mutation.
    pub fn decide(&self, msg: &Message) -> Decision {
        let mission_id = msg.mission_id.clone().unwrap_or_default();

        let mission_key = GrantKey::Mission {
            mission_id,
            from: msg.from_agent.clone(),
            to: msg.to_agent.clone(),
        };
        if let Some(&allowed) = self.grants.get(&mission_key) {
            return grant_decision(allowed, "mission");
        }

        let pair_key = GrantKey::Pair {
            from: msg.from_agent.clone(),
            to: msg.to_agent.clone(),
        };
        if let Some(&allowed) = self.grants.get(&pair_key) {
            return grant_decision(allowed, "pair");
        }

        let (level, label) = self
            .policy
            .rules
            .iter()
            .find(|rule| rule_matches(rule, msg))
            .map(|rule| (rule.approval, rule.label.clone()))
            .unwrap_or((self.policy.defaults.require_approval, String::new()));

        match level {
            ApprovalLevel::Never => Decision::AutoAllow { notify: false },
            ApprovalLevel::AlwaysAllow => Decision::AutoAllow { notify: true },
            ApprovalLevel::Once | ApprovalLevel::Mission | ApprovalLevel::Session => {
                Decision::AskOperator {
                    label: if label.is_empty() {
                        format!("{} from {}", msg.kind, msg.from_agent)
                    } else {
                        label
                    },
                    prompt: approval_prompt(msg),
                    scopes: vec![
                        GrantScope::Once,
                        GrantScope::Mission,
                        GrantScope::Session,
                        GrantScope::AlwaysAllow,
                    ],
                }
            }
        }
    }

    /// Record the operator's answer so later messages in the same scope
    /// skip the prompt. `Once` records nothing.
    pub fn record(&mut self, msg: &Message, scope: GrantScope, allowed: bool) {
        let key = match scope {
            GrantScope::Once => return,
            GrantScope::Mission => GrantKey::Mission {
                mission_id: msg.mission_id.clone().unwrap_or_default(),
                from: msg.from_agent.clone(),
                to: msg.to_agent.clone(),
            },
            GrantScope::Session | GrantScope::AlwaysAllow => GrantKey::Pair {
                from: msg.from_agent.clone(),
                to: msg.to_agent.clone(),
            },
        };
        self.grants.insert(key, allowed);
    }

    /// Drop all grants tied to a mission, e.g. when it reaches a terminal
    /// state.
    pub fn clear_mission_grants(&mut self, mission_id: &str) {
        self.grants.retain(|key, _| {
            !matches!(key, GrantKey::Mission { mission_id: m, .. } if m == mission_id)
        });
    }

    pub fn grant_count(&self) -> usize {
        self.grants.len()
    }
}

fn grant_decision(allowed: bool, scope: &str) -> Decision {
    if allowed {
        Decision::AutoAllow { notify: true }
    } else {
        Decision::AutoDeny {
            reason: format!("denied by prior {scope} decision"),
        }
    }
}

/// Check whether a rule matches a message. Invalid globs or regexes in a
/// rule never match, so a broken rule cannot silently allow traffic.
fn rule_matches(rule: &PolicyRule, msg: &Message) -> bool {
    if !glob_matches(&rule.from, &msg.from_agent) {
        return false;
    }
    if !glob_matches(&rule.to, &msg.to_agent) {
        return false;
    }
    if rule.message_type != "*" && rule.message_type != msg.kind.as_str() {
        return false;
    }
    if let Some(pattern) = &rule.message_pattern {
        let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            return false;
        };
        if !re.is_match(msg.text()) {
            return false;
        }
    }
    true
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(value),
        Err(_) => false,
    }
}

/// The operator-facing prompt body: sender, recipient, type, and a capped
/// payload preview.
fn approval_prompt(msg: &Message) -> String {
    let mut preview = msg.text().to_string();
    if preview.is_empty() {
        // start_agent carries its text under `mission` or `prompt`.
        for key in ["mission", "prompt"] {
            if let Some(v) = msg.payload.get(key).and_then(|v| v.as_str()) {
                preview = v.to_string();
                break;
            }
        }
    }
    if preview.chars().count() > 500 {
        preview = preview.chars().take(500).collect();
    }
    format!(
        "From: {}\nTo: {}\nType: {}\n\n{}",
        msg.from_agent, msg.to_agent, msg.kind, preview
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use intercom_types::MessageType;
    use serde_json::json;

    fn chat(from: &str, to: &str, text: &str) -> Message {
        let mut msg = Message::new(from, to, MessageType::Chat, json!({"message": text}));
        msg.mission_id = Some("m-20250101-aaaaaa".into());
        msg
    }

    fn engine(yaml: &str) -> ApprovalEngine {
        ApprovalEngine::new(PolicyFile::from_yaml(yaml).unwrap())
    }

    #[test]
    fn default_is_ask_once() {
        let engine = engine("{}");
        let decision = engine.decide(&chat("a/p", "b/q", "hi"));
        assert!(matches!(decision, Decision::AskOperator { .. }));
    }

    #[test]
    fn never_rule_allows_silently() {
        let engine = engine(
            r#"
rules:
  - from: "a/*"
    to: "b/*"
    approval: never
"#,
        );
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "hi")),
            Decision::AutoAllow { notify: false }
        );
    }

    #[test]
    fn always_allow_notifies() {
        let engine = engine("rules:\n  - approval: always_allow\n");
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "hi")),
            Decision::AutoAllow { notify: true }
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = engine(
            r#"
rules:
  - from: "a/*"
    approval: never
  - from: "*"
    approval: once
"#,
        );
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "hi")),
            Decision::AutoAllow { notify: false }
        );
        assert!(matches!(
            engine.decide(&chat("c/p", "b/q", "hi")),
            Decision::AskOperator { .. }
        ));
    }

    #[test]
    fn type_filter_applies() {
        let engine = engine(
            r#"
rules:
  - type: chat
    approval: never
"#,
        );
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "hi")),
            Decision::AutoAllow { notify: false }
        );
        let mut ask = chat("a/p", "b/q", "hi");
        ask.kind = MessageType::Ask;
        assert!(matches!(engine.decide(&ask), Decision::AskOperator { .. }));
    }

    #[test]
    fn message_pattern_is_case_insensitive() {
        let engine = engine(
            r#"
defaults:
  require_approval: never
rules:
  - message_pattern: "deploy"
    approval: once
    label: "deploy request"
"#,
        );
        match engine.decide(&chat("a/p", "b/q", "please DEPLOY to prod")) {
            Decision::AskOperator { label, .. } => assert_eq!(label, "deploy request"),
            other => panic!("expected AskOperator, got {other:?}"),
        }
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "just chatting")),
            Decision::AutoAllow { notify: false }
        );
    }

    #[test]
    fn invalid_regex_rule_never_matches() {
        let engine = engine(
            r#"
defaults:
  require_approval: never
rules:
  - message_pattern: "([unclosed"
    approval: once
"#,
        );
        assert_eq!(
            engine.decide(&chat("a/p", "b/q", "anything")),
            Decision::AutoAllow { notify: false }
        );
    }

    #[test]
    fn mission_grant_suppresses_later_prompts() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "step one");

        assert!(matches!(engine.decide(&msg), Decision::AskOperator { .. }));
        engine.record(&msg, GrantScope::Mission, true);

        let later = chat("a/p", "b/q", "step two");
        assert_eq!(
            engine.decide(&later),
            Decision::AutoAllow { notify: true }
        );

        // A different mission still prompts.
        let mut other = chat("a/p", "b/q", "unrelated");
        other.mission_id = Some("m-20250101-bbbbbb".into());
        assert!(matches!(engine.decide(&other), Decision::AskOperator { .. }));
    }

    #[test]
    fn session_grant_covers_the_pair() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "one");
        engine.record(&msg, GrantScope::Session, true);

        let mut other_mission = chat("a/p", "b/q", "two");
        other_mission.mission_id = Some("m-20250101-cccccc".into());
        assert_eq!(
            engine.decide(&other_mission),
            Decision::AutoAllow { notify: true }
        );

        // Reversed direction is a different pair.
        assert!(matches!(
            engine.decide(&chat("b/q", "a/p", "three")),
            Decision::AskOperator { .. }
        ));
    }

    #[test]
    fn negative_grant_short_circuits_to_deny() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "one");
        engine.record(&msg, GrantScope::Mission, false);

        match engine.decide(&chat("a/p", "b/q", "two")) {
            Decision::AutoDeny { reason } => assert!(reason.contains("mission")),
            other => panic!("expected AutoDeny, got {other:?}"),
        }
    }

    #[test]
    fn once_scope_records_nothing() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "one");
        engine.record(&msg, GrantScope::Once, true);
        assert_eq!(engine.grant_count(), 0);
        assert!(matches!(engine.decide(&msg), Decision::AskOperator { .. }));
    }

    #[test]
    fn mission_grant_beats_pair_grant() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "one");
        engine.record(&msg, GrantScope::Session, true);
        engine.record(&msg, GrantScope::Mission, false);
        assert!(matches!(engine.decide(&msg), Decision::AutoDeny { .. }));
    }

    #[test]
    fn clear_mission_grants_removes_only_that_mission() {
        let mut engine = engine("{}");
        let msg = chat("a/p", "b/q", "one");
        engine.record(&msg, GrantScope::Mission, true);
        let mut other = chat("a/p", "b/q", "two");
        other.mission_id = Some("m-20250101-dddddd".into());
        engine.record(&other, GrantScope::Mission, true);

        engine.clear_mission_grants("m-20250101-aaaaaa");
        assert_eq!(engine.grant_count(), 1);
        assert!(matches!(engine.decide(&msg), Decision::AskOperator { .. }));
        assert_eq!(
            engine.decide(&other),
            Decision::AutoAllow { notify: true }
        );
    }

    #[test]
    fn prompt_includes_parties_and_preview() {
        let engine = engine("{}");
        match engine.decide(&chat("a/p", "b/q", "list the disks")) {
            Decision::AskOperator { prompt, scopes, .. } => {
                assert!(prompt.contains("From: a/p"));
                assert!(prompt.contains("To: b/q"));
                assert!(prompt.contains("list the disks"));
                assert_eq!(scopes.len(), 4);
            }
            other => panic!("expected AskOperator, got {other:?}"),
        }
    }

    #[test]
    fn prompt_falls_back_to_mission_text() {
        let engine = engine("{}");
        let mut msg = Message::new(
            "a/p",
            "b/q",
            MessageType::StartAgent,
            json!({"mission": "refactor the parser"}),
        );
        msg.mission_id = Some("m-20250101-eeeeee".into());
        match engine.decide(&msg) {
            Decision::AskOperator { prompt, .. } => {
                assert!(prompt.contains("refactor the parser"))
            }
            other => panic!("expected AskOperator, got {other:?}"),
        }
    }

    #[test]
    fn scope_parse_accepts_telegram_callback_values() {
        assert_eq!(GrantScope::parse("once"), Some(GrantScope::Once));
        assert_eq!(GrantScope::parse("mission"), Some(GrantScope::Mission));
        assert_eq!(GrantScope::parse("always"), Some(GrantScope::AlwaysAllow));
        assert_eq!(GrantScope::parse("bogus"), None);
    }
}
