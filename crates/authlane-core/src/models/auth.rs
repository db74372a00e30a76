use serde::Deserialize;

use crate::api::ApiError;
use crate::auth::session::{TokenPair, DEFAULT_TOKEN_TYPE};

/// Body returned by `/auth/login` and `/auth/refresh`.
#[derive(Deserialize, Default)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    /// Older servers send the access token under this name
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_token", &self.token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl TokenResponse {
    /// Normalise into a [`TokenPair`]. `access_token` wins over `token` when
    /// both are present; an absent token type means `Bearer`.
    pub fn into_tokens(self) -> Result<TokenPair, ApiError> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .or(self.token.filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                ApiError::ClientJsonParse("Token response is missing access_token".to_string())
            })?;

        Ok(TokenPair {
            access_token,
            refresh_token: self.refresh_token.unwrap_or_default(),
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ErrorKind;

    fn parse(json: &str) -> TokenResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_access_token_and_defaults() {
        let tokens = parse(r#"{"access_token": "a.b.c", "refresh_token": "r1"}"#)
            .into_tokens()
            .unwrap();
        assert_eq!(tokens.access_token, "a.b.c");
        assert_eq!(tokens.refresh_token, "r1");
        assert_eq!(tokens.token_type, "Bearer");
    }

    #[test]
    fn test_legacy_token_field() {
        let tokens = parse(r#"{"token": "legacy", "token_type": "JWT"}"#).into_tokens().unwrap();
        assert_eq!(tokens.access_token, "legacy");
        assert_eq!(tokens.refresh_token, "");
        assert_eq!(tokens.token_type, "JWT");

        let tokens = parse(r#"{"access_token": "new", "token": "legacy"}"#).into_tokens().unwrap();
        assert_eq!(tokens.access_token, "new");
    }

    #[test]
    fn test_missing_access_token() {
        let err = parse(r#"{"refresh_token": "r1"}"#).into_tokens().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientJsonParse);

        let err = parse(r#"{"access_token": ""}"#).into_tokens().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClientJsonParse);
    }

    #[test]
    fn test_debug_hides_tokens() {
        let body = r#"{"access_token": "s3cret", "refresh_token": "r3fresh"}"#;
        let rendered = format!("{:?}", parse(body));
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("r3fresh"));
    }
}
