//! PSK authenticator (spec.md §4.7).
//!
//! Proves an agent holds the shared secret without transporting it: the agent
//! signs `"agent_id:hostname:timestamp"` with HMAC-SHA256(psk, ..) and the
//! gateway recomputes the same signature and compares in constant time.

use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// What the agent sends on stream-open (spec.md §3 "PSK context").
#[derive(Clone, Debug)]
pub struct AuthClaim {
    pub agent_id: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    /// base64-encoded HMAC-SHA256 signature.
    pub signature: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// PSK verified.
    Authenticated,
    /// No PSK configured on the gateway: authentication is disabled globally.
    Unauthenticated { auto_enroll: bool },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("claimed timestamp outside the allowed clock-skew window")]
    ClockSkew,
    #[error("HMAC signature did not match")]
    BadSignature,
}

/// Compute the signature an agent should send for `(agent_id, hostname, timestamp)`.
pub fn sign(psk: &str, agent_id: &str, hostname: &str, timestamp: &DateTime<Utc>) -> String {
    sign_message(psk, &message(agent_id, hostname, timestamp))
}

fn message(agent_id: &str, hostname: &str, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{agent_id}:{hostname}:{}",
        timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    )
}

fn sign_message(psk: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(psk.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Gateway-side verifier. Holds an optional primary/previous PSK pair for
/// rotation (spec.md §4.7 "PSK rotation" — the only concession to rotation:
/// either key verifying is sufficient during the grace period).
pub struct PskAuthenticator {
    primary: Option<String>,
    previous: Option<String>,
    timestamp_window: chrono::Duration,
}

impl PskAuthenticator {
    pub fn new(primary: Option<String>, previous: Option<String>) -> Self {
        Self {
            primary,
            previous,
            timestamp_window: chrono::Duration::minutes(5),
        }
    }

    pub fn with_timestamp_window(mut self, window: chrono::Duration) -> Self {
        self.timestamp_window = window;
        self
    }

    /// Rotate out the previous key, ending its grace period.
    pub fn drop_previous_key(&mut self) {
        self.previous = None;
    }

    pub fn verify(&self, now: DateTime<Utc>, claim: &AuthClaim) -> Result<AuthOutcome, AuthError> {
        let Some(primary) = self.primary.as_deref() else {
            // Rule 1: no PSK configured means auth is disabled globally.
            return Ok(AuthOutcome::Unauthenticated { auto_enroll: true });
        };

        // Rule 2: clock skew bound.
        let skew = (now - claim.timestamp).abs();
        if skew > self.timestamp_window {
            return Err(AuthError::ClockSkew);
        }

        // Rule 3: constant-time HMAC comparison, primary then previous.
        let msg = message(&claim.agent_id, &claim.hostname, &claim.timestamp);
        if verify_one(primary, &msg, &claim.signature) {
            return Ok(AuthOutcome::Authenticated);
        }
        if let Some(previous) = self.previous.as_deref() {
            if verify_one(previous, &msg, &claim.signature) {
                return Ok(AuthOutcome::Authenticated);
            }
        }
        Err(AuthError::BadSignature)
    }
}

fn verify_one(psk: &str, message: &str, claimed_signature: &str) -> bool {
    let expected = sign_message(psk, message);
    // Constant-time compare over the decoded bytes so length-dependent early
    // exits never leak timing information about the signature contents.
    let (Ok(expected_bytes), Ok(claimed_bytes)) = (
        base64::engine::general_purpose::STANDARD.decode(&expected),
        base64::engine::general_purpose::STANDARD.decode(claimed_signature),
    ) else {
        return false;
    };
    expected_bytes.ct_eq(&claimed_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn claim(psk: &str, agent_id: &str, hostname: &str, ts: DateTime<Utc>) -> AuthClaim {
        AuthClaim {
            agent_id: agent_id.into(),
            hostname: hostname.into(),
            timestamp: ts,
            signature: sign(psk, agent_id, hostname, &ts),
        }
    }

    #[test]
    fn correct_signature_authenticates() {
        let auth = PskAuthenticator::new(Some("s3cret".into()), None);
        let now = Utc::now();
        let c = claim("s3cret", "agent-1", "host-1", now);
        assert_eq!(auth.verify(now, &c), Ok(AuthOutcome::Authenticated));
    }

    #[test]
    fn flipped_signature_bit_is_bad_signature() {
        let auth = PskAuthenticator::new(Some("s3cret".into()), None);
        let now = Utc::now();
        let mut c = claim("s3cret", "agent-1", "host-1", now);
        // flip one character of the base64 signature
        let mut bytes = c.signature.into_bytes();
        bytes[0] ^= 0x01;
        c.signature = String::from_utf8(bytes).unwrap();
        assert_eq!(auth.verify(now, &c), Err(AuthError::BadSignature));
    }

    #[test]
    fn wrong_psk_is_bad_signature() {
        let auth = PskAuthenticator::new(Some("s3cret".into()), None);
        let now = Utc::now();
        let c = claim("wrong-psk", "agent-1", "host-1", now);
        assert_eq!(auth.verify(now, &c), Err(AuthError::BadSignature));
    }

    #[test]
    fn tampered_message_is_bad_signature() {
        let auth = PskAuthenticator::new(Some("s3cret".into()), None);
        let now = Utc::now();
        let mut c = claim("s3cret", "agent-1", "host-1", now);
        c.hostname = "host-2".into();
        assert_eq!(auth.verify(now, &c), Err(AuthError::BadSignature));
    }

    #[test]
    fn timestamp_outside_window_is_clock_skew() {
        let auth = PskAuthenticator::new(Some("s3cret".into()), None);
        let now = Utc::now();
        let c = claim("s3cret", "agent-1", "host-1", now - Duration::minutes(10));
        assert_eq!(auth.verify(now, &c), Err(AuthError::ClockSkew));
    }

    #[test]
    fn no_psk_configured_admits_unauthenticated() {
        let auth = PskAuthenticator::new(None, None);
        let now = Utc::now();
        let c = claim("anything", "agent-1", "host-1", now);
        assert_eq!(
            auth.verify(now, &c),
            Ok(AuthOutcome::Unauthenticated { auto_enroll: true })
        );
    }

    #[test]
    fn previous_key_still_verifies_during_rotation_grace_period() {
        let auth = PskAuthenticator::new(Some("new-secret".into()), Some("old-secret".into()));
        let now = Utc::now();
        let c = claim("old-secret", "agent-1", "host-1", now);
        assert_eq!(auth.verify(now, &c), Ok(AuthOutcome::Authenticated));
    }

    #[test]
    fn previous_key_rejected_after_rotation_completes() {
        let mut auth = PskAuthenticator::new(Some("new-secret".into()), Some("old-secret".into()));
        auth.drop_previous_key();
        let now = Utc::now();
        let c = claim("old-secret", "agent-1", "host-1", now);
        assert_eq!(auth.verify(now, &c), Err(AuthError::BadSignature));
    }
}
