use serde_json::Value;
use thiserror::Error;

use super::transport::Failure;

/// Discriminant of [`ApiError`], for callers that branch on the category only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    ClientJsonParse,
    Unknown,
    Network,
    Authentication,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Local input failure. No network call was made.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid JSON in response: {0}")]
    ClientJsonParse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::ClientJsonParse(_) => ErrorKind::ClientJsonParse,
            ApiError::Unknown(_) => ErrorKind::Unknown,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Authentication(_) => ErrorKind::Authentication,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::Validation(msg)
            | ApiError::ClientJsonParse(msg)
            | ApiError::Unknown(msg)
            | ApiError::Network(msg)
            | ApiError::Authentication(msg) => msg,
        }
    }

    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build a [`ApiError::ClientJsonParse`] carrying the parser offset.
    pub fn json_parse(body: &[u8], err: &serde_json::Error) -> Self {
        let offset = byte_offset(body, err.line(), err.column());
        ApiError::ClientJsonParse(format!("JSON parse error at offset {}: {}", offset, err))
    }

    /// Classify a raw error response body.
    ///
    /// A body that is not valid JSON is a [`ApiError::ClientJsonParse`] and that
    /// check runs before any code lookup. Otherwise the body must look like
    /// `{"error": {"code": "...", "message": "..."}}`; anything else is
    /// [`ApiError::Unknown`].
    pub fn classify(body: &[u8]) -> Self {
        let doc: Value = match serde_json::from_slice(body) {
            Ok(doc) => doc,
            Err(e) => return Self::json_parse(body, &e),
        };

        let Some(error) = doc.get("error").and_then(Value::as_object) else {
            return ApiError::Unknown(format!(
                "Unexpected error response: {}",
                Self::truncate_body(&doc.to_string())
            ));
        };

        let Some(code) = error.get("code").and_then(Value::as_str) else {
            return ApiError::Unknown("Error response is missing a string `code`".to_string());
        };

        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| code.to_string());

        match code.to_ascii_uppercase().as_str() {
            "VALIDATION_ERROR" => ApiError::Validation(message),
            "AUTHENTICATION_ERROR" | "UNAUTHORIZED" | "INVALID_CREDENTIALS" | "TOKEN_EXPIRED"
            | "INVALID_TOKEN" => ApiError::Authentication(message),
            _ => ApiError::Unknown(format!("{}: {}", code, message)),
        }
    }

    pub fn from_failure(failure: &Failure) -> Self {
        match failure {
            Failure::Timeout(timeout) => ApiError::Network(format!(
                "Request timed out after {}ms",
                timeout.as_millis()
            )),
            Failure::Network(msg) => ApiError::Network(msg.clone()),
            Failure::InvalidEndpoint(msg) => ApiError::Unknown(format!("Invalid endpoint {}", msg)),
            Failure::Discarded => {
                ApiError::Authentication(
                    "Session expired before the request could be retried".to_string(),
                )
            }
            Failure::Status { status, body } => {
                if body.iter().all(u8::is_ascii_whitespace) {
                    ApiError::Unknown(format!("Status {} with empty body", status))
                } else {
                    Self::classify(body)
                }
            }
        }
    }
}

impl From<Failure> for ApiError {
    fn from(failure: Failure) -> Self {
        ApiError::from_failure(&failure)
    }
}

/// Convert serde_json's 1-based line/column position into a byte offset.
fn byte_offset(body: &[u8], line: usize, column: usize) -> usize {
    let line_start: usize = body
        .split(|b| *b == b'\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    (line_start + column.saturating_sub(1)).min(body.len())
}
