//! HMAC-SHA256 envelope signing and verification.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;
use uuid::Uuid;

use crate::error::{ProxyError, SecurityErrorKind};
use crate::protocol::{canonicalize, Envelope, ENVELOPE_VERSION};

use super::NonceCache;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Envelope signer/verifier holding the shared secret.
pub struct EnvelopeSigner {
    key: hmac::Key,
    /// Allowed clock skew between sender timestamp and local clock.
    allowed_skew_seconds: u64,
}

impl EnvelopeSigner {
    /// Create a new signer from the shared secret.
    pub fn new(secret: &[u8], allowed_skew_seconds: u64) -> Self {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        Self {
            key,
            allowed_skew_seconds,
        }
    }

    /// Load the HMAC secret from a file.
    ///
    /// Security: Verifies the file has restrictive permissions (0600 or 0400)
    /// before loading to prevent secrets from being readable by other users.
    pub fn load_secret(path: &Path) -> Result<Vec<u8>, ProxyError> {
        let metadata = std::fs::metadata(path).map_err(|e| ProxyError::Config {
            message: format!(
                "Failed to read HMAC secret metadata from {}: {}",
                path.display(),
                e
            ),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = metadata.permissions().mode();
            // Check that group and world bits are all zero (only owner can access)
            if mode & 0o077 != 0 {
                return Err(ProxyError::Config {
                    message: format!(
                        "HMAC secret file {} has insecure permissions {:04o}, expected 0600 or 0400",
                        path.display(),
                        mode & 0o777
                    ),
                });
            }
        }

        #[cfg(not(unix))]
        let _ = &metadata;

        std::fs::read(path).map_err(|e| ProxyError::Config {
            message: format!("Failed to read HMAC secret from {}: {}", path.display(), e),
        })
    }

    /// Compute the hex signature over `canonicalize(payload) || nonce || timestamp`.
    ///
    /// Concatenation order is fixed and must match on both signing and
    /// verifying sides; changing it is a protocol-breaking change.
    pub fn signature(&self, payload: &str, nonce: &str, timestamp: u64) -> String {
        let canonical = canonicalize(payload);
        let message = format!("{}{}{}", canonical.as_str(), nonce, timestamp);
        let tag = hmac::sign(&self.key, message.as_bytes());
        hex::encode(tag.as_ref())
    }

    /// Wrap a payload into a fresh signed envelope (new nonce, current time).
    pub fn wrap(&self, payload: &str) -> Envelope {
        let nonce = Uuid::new_v4().to_string();
        let timestamp = unix_now();
        let signature = self.signature(payload, &nonce, timestamp);

        Envelope {
            envelope_version: ENVELOPE_VERSION.to_string(),
            nonce,
            timestamp,
            signature,
            payload: payload.to_string(),
        }
    }

    /// Verify an envelope against the local clock.
    ///
    /// See [`verify_at`](Self::verify_at) for the check order.
    pub fn verify(&self, envelope: &Envelope, nonces: &NonceCache) -> Result<(), SecurityErrorKind> {
        self.verify_at(envelope, nonces, unix_now())
    }

    /// Verify an envelope at an injected clock reading.
    ///
    /// Checks run in a fixed, short-circuiting order:
    ///
    /// 1. timestamp skew (inclusive bound: exactly at the limit passes);
    /// 2. nonce replay: the nonce is recorded as seen here, before the
    ///    signature check, so a second copy of a tampered message reusing
    ///    the nonce is flagged as replay rather than re-validated;
    /// 3. constant-time signature comparison.
    ///
    /// Field presence and timestamp integer parsing are enforced earlier,
    /// by [`Envelope::classify`].
    pub fn verify_at(
        &self,
        envelope: &Envelope,
        nonces: &NonceCache,
        now: u64,
    ) -> Result<(), SecurityErrorKind> {
        if now.abs_diff(envelope.timestamp) > self.allowed_skew_seconds {
            return Err(SecurityErrorKind::TimestampSkew {
                now,
                timestamp: envelope.timestamp,
            });
        }

        if !nonces.check_and_record(&envelope.nonce, now) {
            return Err(SecurityErrorKind::ReplayDetected {
                nonce: envelope.nonce.clone(),
            });
        }

        let canonical = canonicalize(&envelope.payload);
        let message = format!("{}{}{}", canonical.as_str(), envelope.nonce, envelope.timestamp);

        let signature_bytes =
            hex::decode(&envelope.signature).map_err(|_| SecurityErrorKind::TamperDetected)?;

        hmac::verify(&self.key, message.as_bytes(), &signature_bytes)
            .map_err(|_| SecurityErrorKind::TamperDetected)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-key-32-bytes-long!!";
    const NOW: u64 = 1_700_000_000;

    fn signer() -> EnvelopeSigner {
        EnvelopeSigner::new(SECRET, 60)
    }

    fn cache() -> NonceCache {
        NonceCache::new(300, 1000)
    }

    fn signed_envelope(payload: &str, nonce: &str, timestamp: u64) -> Envelope {
        let s = signer();
        Envelope {
            envelope_version: ENVELOPE_VERSION.to_string(),
            nonce: nonce.to_string(),
            timestamp,
            signature: s.signature(payload, nonce, timestamp),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let envelope = signed_envelope(r#"[2,"1","Heartbeat",{}]"#, "n-1", NOW);
        signer().verify_at(&envelope, &cache(), NOW).unwrap();
        assert_eq!(envelope.payload, r#"[2,"1","Heartbeat",{}]"#);
    }

    #[test]
    fn test_signature_is_formatting_independent() {
        let s = signer();
        let compact = s.signature(r#"{"a":1,"b":2}"#, "n-1", NOW);
        let spaced = s.signature(r#"{ "b": 2, "a": 1 }"#, "n-1", NOW);
        assert_eq!(compact, spaced);
    }

    #[test]
    fn test_non_json_payload_signs_as_raw() {
        let envelope = signed_envelope("plain text frame", "n-raw", NOW);
        signer().verify_at(&envelope, &cache(), NOW).unwrap();
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut envelope = signed_envelope(r#"[2,"1","Heartbeat",{}]"#, "n-1", NOW);
        envelope.payload = r#"[2,"1","StopTransaction",{}]"#.to_string();

        let err = signer().verify_at(&envelope, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TamperDetected));
    }

    #[test]
    fn test_tampered_timestamp_detected() {
        let mut envelope = signed_envelope(r#"{}"#, "n-1", NOW);
        envelope.timestamp += 1; // still within skew, but not what was signed

        let err = signer().verify_at(&envelope, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TamperDetected));
    }

    #[test]
    fn test_non_hex_signature_detected_as_tamper() {
        let mut envelope = signed_envelope(r#"{}"#, "n-1", NOW);
        envelope.signature = "zz-not-hex".to_string();

        let err = signer().verify_at(&envelope, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TamperDetected));
    }

    #[test]
    fn test_skew_boundary_is_inclusive() {
        let s = signer();

        // Exactly at the boundary: accepted, both past and future.
        let at_past = signed_envelope(r#"{}"#, "n-past", NOW - 60);
        s.verify_at(&at_past, &cache(), NOW).unwrap();

        let at_future = signed_envelope(r#"{}"#, "n-future", NOW + 60);
        s.verify_at(&at_future, &cache(), NOW).unwrap();

        // One past the boundary: rejected.
        let beyond = signed_envelope(r#"{}"#, "n-old", NOW - 61);
        let err = s.verify_at(&beyond, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TimestampSkew { .. }));

        let ahead = signed_envelope(r#"{}"#, "n-ahead", NOW + 61);
        let err = s.verify_at(&ahead, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TimestampSkew { .. }));
    }

    #[test]
    fn test_replay_of_valid_envelope_rejected() {
        let s = signer();
        let nonces = cache();
        let envelope = signed_envelope(r#"{}"#, "n-1", NOW);

        s.verify_at(&envelope, &nonces, NOW).unwrap();

        let err = s.verify_at(&envelope, &nonces, NOW + 1).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ReplayDetected { .. }));
    }

    #[test]
    fn test_nonce_consumed_before_signature_check() {
        // A tampered message with a fresh nonce reports tamper, but its
        // nonce is recorded: a second message reusing it reports replay,
        // even if that second copy is validly signed.
        let s = signer();
        let nonces = cache();

        let mut tampered = signed_envelope(r#"{"v":1}"#, "n-shared", NOW);
        tampered.payload = r#"{"v":2}"#.to_string();
        let err = s.verify_at(&tampered, &nonces, NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TamperDetected));

        let valid = signed_envelope(r#"{"v":1}"#, "n-shared", NOW);
        let err = s.verify_at(&valid, &nonces, NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::ReplayDetected { .. }));
    }

    #[test]
    fn test_skew_rejection_does_not_consume_nonce() {
        // Skew is checked before the nonce is recorded, so a rejected
        // stale envelope does not poison its nonce.
        let s = signer();
        let nonces = cache();

        let stale = signed_envelope(r#"{}"#, "n-1", NOW - 120);
        let err = s.verify_at(&stale, &nonces, NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TimestampSkew { .. }));

        let fresh = signed_envelope(r#"{}"#, "n-1", NOW);
        s.verify_at(&fresh, &nonces, NOW).unwrap();
    }

    #[test]
    fn test_wrap_produces_verifiable_envelope() {
        let s = signer();
        let envelope = s.wrap(r#"[2,"1","BootNotification",{}]"#);

        assert_eq!(envelope.envelope_version, ENVELOPE_VERSION);
        assert!(!envelope.nonce.is_empty());
        s.verify(&envelope, &cache()).unwrap();
    }

    #[test]
    fn test_wrap_uses_fresh_nonces() {
        let s = signer();
        let a = s.wrap("{}");
        let b = s.wrap("{}");
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_wrong_key_detected() {
        let envelope = signed_envelope(r#"{}"#, "n-1", NOW);
        let other = EnvelopeSigner::new(b"a-completely-different-secret!!", 60);

        let err = other.verify_at(&envelope, &cache(), NOW).unwrap_err();
        assert!(matches!(err, SecurityErrorKind::TamperDetected));
    }
}
