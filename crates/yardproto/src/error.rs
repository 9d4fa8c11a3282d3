//! Client-visible error taxonomy.
//!
//! `ErrorCode` is the closed set of codes a client can observe; internal
//! errors are translated at the outermost boundary (Router or Executor) and
//! details are logged, never leaked.

use serde::{Deserialize, Serialize};

/// Error codes exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InvalidAction,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    InternalError,
    Timeout,
    ServiceUnavailable,
    ProcessingFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidAction => "INVALID_ACTION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    /// Hint to the client that resubmitting the same request may succeed.
    pub fn retry_hint(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::Timeout
                | ErrorCode::ServiceUnavailable
                | ErrorCode::InternalError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload carried by the `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<bool>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry: Some(code.retry_hint()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::ProcessingFailed).unwrap();
        assert_eq!(json, r#""PROCESSING_FAILED""#);
        let back: ErrorCode = serde_json::from_str(r#""RATE_LIMITED""#).unwrap();
        assert_eq!(back, ErrorCode::RateLimited);
    }

    #[test]
    fn retry_hints() {
        assert!(ErrorCode::RateLimited.retry_hint());
        assert!(ErrorCode::ServiceUnavailable.retry_hint());
        assert!(!ErrorCode::ValidationError.retry_hint());
        assert!(!ErrorCode::InvalidAction.retry_hint());
        assert!(!ErrorCode::Forbidden.retry_hint());
    }

    #[test]
    fn body_omits_empty_fields() {
        let body = ErrorBody::new(ErrorCode::ValidationError, "missing action");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert!(json.get("details").is_none());
        assert_eq!(json["retry"], false);
    }
}
