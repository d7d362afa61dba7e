// Concierge Engine — Webhook Validators
//
// Signature verification for external callbacks. Both validators work on
// the EXACT raw body bytes (pre-deserialisation) and compare digests in
// constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Constant-time equality over hex strings.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Messenger-provider style: header `X-Hub-Signature-256: sha256=<hex>`
/// where the digest is HMAC-SHA256 over the raw body.
pub fn validate_messenger_signature(signature_header: &str, raw_body: &[u8], secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(provided) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let expected = hmac_hex(secret.as_bytes(), raw_body);
    constant_time_eq(provided, &expected)
}

/// Scheduling-link style: header `t=<unix>,v1=<hex>` where the digest is
/// HMAC-SHA256 over `"{t}.{raw_body}"`.
pub fn validate_timestamped_signature(
    signature_header: &str,
    raw_body: &[u8],
    secret: &str,
) -> bool {
    if secret.is_empty() {
        return false;
    }
    let mut timestamp = None;
    let mut provided = None;
    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v.to_string()),
            Some(("v1", v)) => provided = Some(v.to_string()),
            _ => {}
        }
    }
    let (Some(timestamp), Some(provided)) = (timestamp, provided) else {
        return false;
    };

    let mut payload = Vec::with_capacity(timestamp.len() + 1 + raw_body.len());
    payload.extend_from_slice(timestamp.as_bytes());
    payload.push(b'.');
    payload.extend_from_slice(raw_body);

    let expected = hmac_hex(secret.as_bytes(), &payload);
    constant_time_eq(&provided, &expected)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messenger_signature_roundtrip() {
        let body = br#"{"message_sid":"SM1","body":"hola"}"#;
        let secret = "shared-secret";
        let header = format!("sha256={}", hmac_hex(secret.as_bytes(), body));

        assert!(validate_messenger_signature(&header, body, secret));
        assert!(!validate_messenger_signature(&header, b"tampered", secret));
        assert!(!validate_messenger_signature(&header, body, "wrong-secret"));
        assert!(!validate_messenger_signature("sha256=zz", body, secret));
    }

    #[test]
    fn test_messenger_signature_requires_prefix_and_secret() {
        let body = b"x";
        let digest = hmac_hex(b"s", body);
        assert!(!validate_messenger_signature(&digest, body, "s"));
        assert!(!validate_messenger_signature(&format!("sha256={}", digest), body, ""));
    }

    #[test]
    fn test_timestamped_signature_roundtrip() {
        let body = br#"{"event":"invitee.created"}"#;
        let secret = "cal-secret";
        let t = "1734300000";
        let mut payload = Vec::new();
        payload.extend_from_slice(t.as_bytes());
        payload.push(b'.');
        payload.extend_from_slice(body);
        let header = format!("t={},v1={}", t, hmac_hex(secret.as_bytes(), &payload));

        assert!(validate_timestamped_signature(&header, body, secret));
        assert!(!validate_timestamped_signature(&header, body, "nope"));
        // a different timestamp invalidates the digest
        let bad = header.replace(t, "1734300001");
        assert!(!validate_timestamped_signature(&bad, body, secret));
    }

    #[test]
    fn test_timestamped_signature_malformed_header() {
        assert!(!validate_timestamped_signature("v1=abc", b"x", "s"));
        assert!(!validate_timestamped_signature("t=1", b"x", "s"));
        assert!(!validate_timestamped_signature("", b"x", "s"));
    }

    #[test]
    fn test_constant_time_eq_basics() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
