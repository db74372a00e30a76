//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use authlane_core::ClientConfig;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use wiremock::MockServer;

pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig {
        base_url: server.uri(),
        request_timeout_ms: 2000,
        ..Default::default()
    }
}

/// Unsigned token with a subject and a lifetime relative to now.
pub fn token(sub: u64, lifetime_secs: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = json!({"sub": sub, "exp": Utc::now().timestamp() + lifetime_secs});
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}

pub fn token_body(access: &str, refresh: &str) -> Value {
    json!({"access_token": access, "refresh_token": refresh, "token_type": "Bearer"})
}

pub fn user_body(id: i64) -> Value {
    json!({
        "id": id,
        "email": "ada@example.com",
        "first_name": "Ada",
        "last_name": "Lovelace",
        "organization_id": null
    })
}

pub async fn eventually(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
