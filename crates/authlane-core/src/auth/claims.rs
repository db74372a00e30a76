//! Bearer token claim decoding.
//!
//! Reads the subject and expiry out of a JWT-shaped access token. The
//! signature is never verified; the server remains the authority on token
//! validity and these claims are only used for scheduling and display.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::{Map, Value};

/// Claims decoded from an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenClaims {
    /// The `sub` claim, when it is a number or a numeric string.
    pub subject: Option<u64>,
    /// The `exp` claim, in seconds since the Unix epoch.
    pub expires_at: Option<i64>,
}

impl TokenClaims {
    /// Signed seconds from `now` until expiry; negative once expired.
    /// Saturates at the `i64` bounds.
    pub fn expires_in(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|exp| exp.saturating_sub(now))
    }

    /// Seconds until expiry relative to the wall clock.
    pub fn expires_in_now(&self) -> Option<i64> {
        self.expires_in(Utc::now().timestamp())
    }
}

/// Decode the claims of a three-segment token. Returns `None` for anything that
/// is not `header.payload.signature` with a JSON object payload.
pub fn decode(token: &str) -> Option<TokenClaims> {
    let payload = decode_payload(token)?;
    Some(TokenClaims {
        subject: payload.get("sub").and_then(parse_subject),
        expires_at: payload.get("exp").and_then(parse_expiry),
    })
}

/// Seconds remaining on the token, if it carries an `exp` claim.
pub fn expires_in_secs(token: &str) -> Option<i64> {
    decode(token)?.expires_in_now()
}

pub fn subject(token: &str) -> Option<u64> {
    decode(token)?.subject
}

fn decode_payload(token: &str) -> Option<Map<String, Value>> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return None;
    }

    // URL-safe alphabet to standard, then restore the stripped padding
    let mut payload: String = segments[1]
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while payload.len() % 4 != 0 {
        payload.push('=');
    }

    let bytes = STANDARD.decode(payload.as_bytes()).ok()?;
    match serde_json::from_slice(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn parse_subject(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        _ => None,
    }
}

fn parse_expiry(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            // Fractional seconds are truncated; values outside i64 are rejected
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::test_tokens::token_with;
    use super::*;

    #[test]
    fn test_decode_subject_and_expiry() {
        let now = Utc::now().timestamp();
        let token = token_with(&json!({"sub": 42, "exp": now + 3600}));

        let claims = decode(&token).expect("well-formed token");
        assert_eq!(claims.subject, Some(42));
        assert_eq!(claims.expires_at, Some(now + 3600));

        let remaining = claims.expires_in_now().unwrap();
        assert!((3599..=3600).contains(&remaining), "remaining = {}", remaining);
    }

    #[test]
    fn test_decode_string_subject() {
        let token = token_with(&json!({"sub": "1234567890"}));
        assert_eq!(subject(&token), Some(1_234_567_890));

        let token = token_with(&json!({"sub": "alice"}));
        assert_eq!(subject(&token), None);
    }

    #[test]
    fn test_expired_token_is_negative() {
        let now = Utc::now().timestamp();
        let token = token_with(&json!({"exp": now - 30}));
        let claims = decode(&token).unwrap();
        assert_eq!(claims.expires_in(now), Some(-30));
    }

    #[test]
    fn test_extreme_expiry_does_not_overflow() {
        let now = Utc::now().timestamp();

        let ancient = decode(&token_with(&json!({"sub": 1, "exp": i64::MIN}))).unwrap();
        assert_eq!(ancient.expires_at, Some(i64::MIN));
        assert_eq!(ancient.expires_in(now), Some(i64::MIN));

        let distant = decode(&token_with(&json!({"sub": 1, "exp": i64::MAX}))).unwrap();
        assert_eq!(distant.expires_in(-now), Some(i64::MAX));

        let absurd = decode(&token_with(&json!({"sub": 1, "exp": 1e300}))).unwrap();
        assert_eq!(absurd.expires_at, None);
        assert_eq!(expires_in_secs(&token_with(&json!({"exp": -1e300}))), None);
    }

    #[test]
    fn test_segment_count_must_be_three() {
        let good = token_with(&json!({"sub": 1}));
        assert!(decode(&good).is_some());

        let parts: Vec<&str> = good.split('.').collect();
        assert_eq!(decode(""), None);
        assert_eq!(decode(parts[1]), None);
        assert_eq!(decode(&format!("{}.{}", parts[0], parts[1])), None);
        assert_eq!(decode(&format!("{}.extra", good)), None);
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert_eq!(decode(&token_with(&json!([1, 2, 3]))), None);
        assert_eq!(decode(&token_with(&json!("just a string"))), None);
        assert_eq!(decode("a.!!!not-base64!!!.c"), None);
    }

    #[test]
    fn test_url_safe_payload_needing_padding() {
        // "?>?" style bytes encode to '-' and '_' in the URL-safe alphabet
        let token = token_with(&json!({"sub": 7, "note": "??>>~~"}));
        let payload = token.split('.').nth(1).unwrap();
        assert!(payload.contains('-') || payload.contains('_') || payload.len() % 4 != 0);
        assert_eq!(subject(&token), Some(7));
    }

    #[test]
    fn test_missing_claims() {
        let claims = decode(&token_with(&json!({"name": "x"}))).unwrap();
        assert_eq!(claims, TokenClaims::default());
        assert_eq!(claims.expires_in(0), None);
    }

    #[test]
    fn test_decode_is_stable() {
        let token = token_with(&json!({"sub": 9, "exp": 2_000_000_000}));
        assert_eq!(decode(&token), decode(&token));
    }
}
