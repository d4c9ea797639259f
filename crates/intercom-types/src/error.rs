//! Error types shared across all Intercom crates.

/// Errors surfaced by the routing plane.
///
/// Each variant maps to an HTTP status and carries a short operator-facing
/// label in addition to the machine code.
#[derive(Debug, thiserror::Error)]
pub enum IntercomError {
    /// Malformed JSON or missing envelope fields.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// Signed request timestamp outside the drift window.
    #[error("stale request signature")]
    AuthStale,

    /// HMAC mismatch.
    #[error("bad request signature")]
    AuthBadSignature,

    /// Signer is not a registered, approved machine.
    #[error("unknown machine: {0}")]
    AuthUnknownMachine(String),

    /// A named entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Chat delivery target has no live session. Not an error to the hub.
    #[error("no active session for {0}")]
    NoActiveSession(String),

    /// Launcher refused a working directory outside the allow-list.
    #[error("path not allowed: {0}")]
    PathNotAllowed(String),

    /// Transport failure reaching a daemon.
    #[error("daemon unreachable: {0}")]
    Unreachable(String),

    /// A policy rule auto-denied the message.
    #[error("denied by policy: {0}")]
    DeniedByPolicy(String),

    /// The operator denied the message.
    #[error("denied by operator")]
    DeniedByOperator,

    /// The operator did not answer within the approval timeout.
    #[error("approval timed out")]
    ApprovalTimeout,

    /// Mission exceeded its wall-clock cap.
    #[error("mission timed out after {0}s")]
    Timeout(u64),

    /// Registry (SQLite) read/write failure.
    #[error("registry error: {0}")]
    Registry(String),

    /// Configuration loading or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntercomError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        IntercomError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// HTTP status code for the error.
    pub fn http_status(&self) -> u16 {
        match self {
            IntercomError::BadEnvelope(_) | IntercomError::PathNotAllowed(_) => 400,
            IntercomError::AuthStale | IntercomError::AuthBadSignature => 401,
            IntercomError::AuthUnknownMachine(_) => 403,
            IntercomError::NotFound { .. } | IntercomError::NoActiveSession(_) => 404,
            IntercomError::DeniedByPolicy(_)
            | IntercomError::DeniedByOperator
            | IntercomError::ApprovalTimeout => 409,
            IntercomError::Unreachable(_) => 503,
            IntercomError::Timeout(_) => 504,
            IntercomError::Registry(_)
            | IntercomError::Config(_)
            | IntercomError::Internal(_) => 500,
        }
    }

    /// Short operator-facing label, stable across wording changes.
    pub fn label(&self) -> &'static str {
        match self {
            IntercomError::BadEnvelope(_) => "bad_envelope",
            IntercomError::AuthStale => "auth_stale",
            IntercomError::AuthBadSignature => "auth_bad_signature",
            IntercomError::AuthUnknownMachine(_) => "auth_unknown_machine",
            IntercomError::NotFound { .. } => "not_found",
            IntercomError::NoActiveSession(_) => "no_active_session",
            IntercomError::PathNotAllowed(_) => "path_not_allowed",
            IntercomError::Unreachable(_) => "unreachable",
            IntercomError::DeniedByPolicy(_) => "denied_by_policy",
            IntercomError::DeniedByOperator => "denied_by_operator",
            IntercomError::ApprovalTimeout => "approval_timeout",
            IntercomError::Timeout(_) => "timeout",
            IntercomError::Registry(_) => "registry_error",
            IntercomError::Config(_) => "config_error",
            IntercomError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for IntercomError {
    fn from(e: std::io::Error) -> Self {
        IntercomError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for IntercomError {
    fn from(e: serde_json::Error) -> Self {
        IntercomError::BadEnvelope(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(IntercomError::BadEnvelope("x".into()).http_status(), 400);
        assert_eq!(IntercomError::AuthStale.http_status(), 401);
        assert_eq!(
            IntercomError::AuthUnknownMachine("m".into()).http_status(),
            403
        );
        assert_eq!(
            IntercomError::not_found("mission", "m-1").http_status(),
            404
        );
        assert_eq!(IntercomError::NoActiveSession("b/p".into()).http_status(), 404);
        assert_eq!(IntercomError::DeniedByOperator.http_status(), 409);
        assert_eq!(IntercomError::Unreachable("b".into()).http_status(), 503);
        assert_eq!(IntercomError::Timeout(1800).http_status(), 504);
        assert_eq!(IntercomError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(IntercomError::ApprovalTimeout.label(), "approval_timeout");
        assert_eq!(
            IntercomError::PathNotAllowed("/tmp/x".into()).label(),
            "path_not_allowed"
        );
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            IntercomError::not_found("thread", "t-1").to_string(),
            "thread not found: t-1"
        );
        assert_eq!(
            IntercomError::Timeout(60).to_string(),
            "mission timed out after 60s"
        );
    }
}
