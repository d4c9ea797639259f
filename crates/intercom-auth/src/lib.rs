//! HMAC-SHA256 request signing and verification.
//!
//! Every signed HTTP exchange carries three headers: the sender's machine
//! id, a unix timestamp, and `sha256=<hex>` over the canonical request
//! `method \n path \n ts \n sha256(body)`. Verification rejects
//! timestamps outside a ±60 s window, which is the only replay defense
//! (no per-nonce cache). Signature comparison is constant-time via
//! [`Mac::verify_slice`].

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signing machine id.
pub const HEADER_MACHINE: &str = "X-Intercom-Machine";
/// Header carrying the unix timestamp.
pub const HEADER_TS: &str = "X-Intercom-Ts";
/// Header carrying the signature, `sha256=<hex>`.
pub const HEADER_SIG: &str = "X-Intercom-Sig";

/// Maximum allowed clock drift between signer and verifier, in seconds.
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 60;

const SIG_PREFIX: &str = "sha256=";

/// The three signed headers produced by [`sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub machine: String,
    pub ts: String,
    pub sig: String,
}

impl SignedHeaders {
    /// Iterate `(header name, value)` pairs for attaching to a request.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (HEADER_MACHINE, self.machine.as_str()),
            (HEADER_TS, self.ts.as_str()),
            (HEADER_SIG, self.sig.as_str()),
        ]
        .into_iter()
    }
}

/// Outcome of verifying a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    /// Timestamp missing, unparseable, or outside the drift window.
    Stale,
    /// Signature missing, malformed, or not matching.
    BadSignature,
    /// The token lookup produced no machine (or an empty token).
    UnknownMachine,
}

/// The canonical request string both sides sign.
fn canonical_request(method: &str, path: &str, ts: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{method}\n{path}\n{ts}\n{body_hash}")
}

fn mac_for(token: &str, input: &str) -> HmacSha256 {
    // new_from_slice only fails on zero-length keys for some MACs; HMAC
    // accepts any key length, and callers never pass an empty token.
    let mut mac =
        HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(input.as_bytes());
    mac
}

/// Sign a request at the current time, producing the three headers.
pub fn sign(method: &str, path: &str, body: &[u8], token: &str, machine_id: &str) -> SignedHeaders {
    sign_at(method, path, body, token, machine_id, chrono::Utc::now().timestamp())
}

/// Sign with an explicit timestamp. Exposed so tests can produce expired
/// signatures deterministically.
pub fn sign_at(
    method: &str,
    path: &str,
    body: &[u8],
    token: &str,
    machine_id: &str,
    unix_ts: i64,
) -> SignedHeaders {
    let ts = unix_ts.to_string();
    let mac = mac_for(token, &canonical_request(method, path, &ts, body));
    let sig = hex::encode(mac.finalize().into_bytes());
    SignedHeaders {
        machine: machine_id.to_string(),
        ts,
        sig: format!("{SIG_PREFIX}{sig}"),
    }
}

/// Verify a signed request against the machine's current token.
///
/// `token` comes from the caller's registry lookup for the claimed machine
/// id; pass `None` when the machine is unknown. An empty token always
/// fails: unauthenticated endpoints skip verification entirely rather
/// than accepting empty-key signatures.
pub fn verify(
    method: &str,
    path: &str,
    body: &[u8],
    ts: &str,
    sig: &str,
    token: Option<&str>,
) -> VerifyOutcome {
    verify_at(method, path, body, ts, sig, token, chrono::Utc::now().timestamp())
}

/// [`verify`] with an explicit "now" for deterministic tests.
pub fn verify_at(
    method: &str,
    path: &str,
    body: &[u8],
    ts: &str,
    sig: &str,
    token: Option<&str>,
    now_unix: i64,
) -> VerifyOutcome {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return VerifyOutcome::UnknownMachine,
    };

    let parsed_ts: i64 = match ts.parse() {
        Ok(v) => v,
        Err(_) => return VerifyOutcome::Stale,
    };
    if (now_unix - parsed_ts).abs() > MAX_TIMESTAMP_DRIFT_SECS {
        return VerifyOutcome::Stale;
    }

    let Some(hex_sig) = sig.strip_prefix(SIG_PREFIX) else {
        return VerifyOutcome::BadSignature;
    };
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return VerifyOutcome::BadSignature;
    };

    let mac = mac_for(token, &canonical_request(method, path, ts, body));
    match mac.verify_slice(&sig_bytes) {
        Ok(()) => VerifyOutcome::Ok,
        Err(_) => VerifyOutcome::BadSignature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "ict_test_0123456789abcdef";

    #[test]
    fn sign_verify_roundtrip() {
        let body = br#"{"machine_id":"m1"}"#;
        let headers = sign("POST", "/api/heartbeat", body, TOKEN, "m1");
        assert_eq!(headers.machine, "m1");
        assert!(headers.sig.starts_with("sha256="));

        let outcome = verify(
            "POST",
            "/api/heartbeat",
            body,
            &headers.ts,
            &headers.sig,
            Some(TOKEN),
        );
        assert_eq!(outcome, VerifyOutcome::Ok);
    }

    #[test]
    fn tampered_body_fails() {
        let headers = sign("POST", "/api/route", b"original", TOKEN, "m1");
        let outcome = verify(
            "POST",
            "/api/route",
            b"tampered",
            &headers.ts,
            &headers.sig,
            Some(TOKEN),
        );
        assert_eq!(outcome, VerifyOutcome::BadSignature);
    }

    #[test]
    fn method_and_path_are_bound() {
        let headers = sign("POST", "/api/route", b"x", TOKEN, "m1");
        assert_eq!(
            verify("GET", "/api/route", b"x", &headers.ts, &headers.sig, Some(TOKEN)),
            VerifyOutcome::BadSignature
        );
        assert_eq!(
            verify("POST", "/api/other", b"x", &headers.ts, &headers.sig, Some(TOKEN)),
            VerifyOutcome::BadSignature
        );
    }

    #[test]
    fn wrong_token_fails() {
        let headers = sign("POST", "/api/route", b"x", TOKEN, "m1");
        let outcome = verify(
            "POST",
            "/api/route",
            b"x",
            &headers.ts,
            &headers.sig,
            Some("ict_other_token"),
        );
        assert_eq!(outcome, VerifyOutcome::BadSignature);
    }

    #[test]
    fn expired_timestamp_is_stale() {
        let now = chrono::Utc::now().timestamp();
        let headers = sign_at("POST", "/api/heartbeat", b"x", TOKEN, "m1", now - 120);
        let outcome = verify(
            "POST",
            "/api/heartbeat",
            b"x",
            &headers.ts,
            &headers.sig,
            Some(TOKEN),
        );
        assert_eq!(outcome, VerifyOutcome::Stale);
    }

    #[test]
    fn future_timestamp_is_stale() {
        let now = chrono::Utc::now().timestamp();
        let headers = sign_at("POST", "/api/heartbeat", b"x", TOKEN, "m1", now + 120);
        assert_eq!(
            verify("POST", "/api/heartbeat", b"x", &headers.ts, &headers.sig, Some(TOKEN)),
            VerifyOutcome::Stale
        );
    }

    #[test]
    fn drift_boundary_is_inclusive() {
        let now = chrono::Utc::now().timestamp();
        let headers = sign_at("GET", "/x", b"", TOKEN, "m1", now - MAX_TIMESTAMP_DRIFT_SECS);
        assert_eq!(
            verify_at("GET", "/x", b"", &headers.ts, &headers.sig, Some(TOKEN), now),
            VerifyOutcome::Ok
        );
        let headers = sign_at("GET", "/x", b"", TOKEN, "m1", now - MAX_TIMESTAMP_DRIFT_SECS - 1);
        assert_eq!(
            verify_at("GET", "/x", b"", &headers.ts, &headers.sig, Some(TOKEN), now),
            VerifyOutcome::Stale
        );
    }

    #[test]
    fn unparseable_timestamp_is_stale() {
        assert_eq!(
            verify("GET", "/x", b"", "not-a-number", "sha256=00", Some(TOKEN)),
            VerifyOutcome::Stale
        );
    }

    #[test]
    fn missing_prefix_or_bad_hex_is_bad_signature() {
        let now = chrono::Utc::now().timestamp().to_string();
        assert_eq!(
            verify("GET", "/x", b"", &now, "deadbeef", Some(TOKEN)),
            VerifyOutcome::BadSignature
        );
        assert_eq!(
            verify("GET", "/x", b"", &now, "sha256=zzzz", Some(TOKEN)),
            VerifyOutcome::BadSignature
        );
    }

    #[test]
    fn empty_or_missing_token_is_unknown_machine() {
        let headers = sign("GET", "/x", b"", TOKEN, "m1");
        assert_eq!(
            verify("GET", "/x", b"", &headers.ts, &headers.sig, Some("")),
            VerifyOutcome::UnknownMachine
        );
        assert_eq!(
            verify("GET", "/x", b"", &headers.ts, &headers.sig, None),
            VerifyOutcome::UnknownMachine
        );
    }

    #[test]
    fn headers_iter_yields_all_three() {
        let headers = sign("GET", "/x", b"", TOKEN, "m1");
        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, HEADER_MACHINE);
        assert_eq!(pairs[1].0, HEADER_TS);
        assert_eq!(pairs[2].0, HEADER_SIG);
    }
}
