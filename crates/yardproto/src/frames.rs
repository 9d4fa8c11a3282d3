//! Wire frames for the client ↔ fabric socket.
//!
//! All frames are self-describing JSON text. Client-to-server is a single
//! shape (`ClientRequest`); server-to-client is a tagged union discriminated
//! by `type`. JSON stays at the socket edge; internal layers pass typed
//! frames around.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorBody, ErrorCode};

/// A request as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Client-supplied request id. Generated server-side when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Named operation to invoke.
    pub action: String,
    /// Opaque handler input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl ClientRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: None,
            action: action.into(),
            payload: None,
            metadata: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parse a raw socket body. Malformed JSON and missing/empty `action`
    /// both surface as validation failures.
    pub fn from_bytes(body: &[u8]) -> Result<Self, FrameError> {
        let request: ClientRequest =
            serde_json::from_slice(body).map_err(|e| FrameError::Malformed(e.to_string()))?;
        if request.action.trim().is_empty() {
            return Err(FrameError::MissingAction);
        }
        Ok(request)
    }

    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let body = serde_json::to_vec(self).map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(Bytes::from(body))
    }
}

/// Server-to-client frames, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Async submission accepted; work is queued.
    Acknowledgment {
        request_id: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Synchronous result.
    Response {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// In-flight progress update.
    Progress {
        request_id: String,
        percentage: f64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<HashMap<String, String>>,
        /// Per-request emission order; strictly increasing.
        #[serde(default)]
        sequence: u64,
    },
    /// Async terminal success.
    Complete {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
    /// Any failure.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: ErrorBody,
    },
}

impl ServerFrame {
    /// Acknowledgment for a freshly queued async request.
    pub fn queued(request_id: impl Into<String>) -> Self {
        ServerFrame::Acknowledgment {
            request_id: request_id.into(),
            status: "queued".to_string(),
            message: None,
        }
    }

    pub fn response(request_id: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        ServerFrame::Response {
            request_id: request_id.into(),
            success: true,
            data,
        }
    }

    pub fn complete(request_id: impl Into<String>, result: Option<serde_json::Value>) -> Self {
        ServerFrame::Complete {
            request_id: request_id.into(),
            success: true,
            result,
        }
    }

    pub fn error(request_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            request_id,
            error: ErrorBody::new(code, message),
        }
    }

    pub fn error_body(request_id: Option<String>, error: ErrorBody) -> Self {
        ServerFrame::Error { request_id, error }
    }

    /// Encode for the socket.
    pub fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let body = serde_json::to_vec(self).map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(Bytes::from(body))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, FrameError> {
        serde_json::from_slice(body).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    /// Discriminator string, for logs and metrics labels.
    pub fn frame_type(&self) -> &'static str {
        match self {
            ServerFrame::Acknowledgment { .. } => "acknowledgment",
            ServerFrame::Response { .. } => "response",
            ServerFrame::Progress { .. } => "progress",
            ServerFrame::Complete { .. } => "complete",
            ServerFrame::Error { .. } => "error",
        }
    }

    /// The request this frame concerns, when it names one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerFrame::Acknowledgment { request_id, .. }
            | ServerFrame::Response { request_id, .. }
            | ServerFrame::Progress { request_id, .. }
            | ServerFrame::Complete { request_id, .. } => Some(request_id),
            ServerFrame::Error { request_id, .. } => request_id.as_deref(),
        }
    }
}

/// Errors during frame encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("missing or empty action")]
    MissingAction,
    #[error("frame encode failed: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_request_roundtrip() {
        let req = ClientRequest::new("generate_report")
            .with_id("req-7")
            .with_payload(serde_json::json!({"rows": 500}));

        let bytes = req.to_bytes().unwrap();
        let parsed = ClientRequest::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn client_request_minimal() {
        let parsed = ClientRequest::from_bytes(br#"{"action":"echo"}"#).unwrap();
        assert_eq!(parsed.action, "echo");
        assert!(parsed.id.is_none());
        assert!(parsed.payload.is_none());
    }

    #[test]
    fn client_request_missing_action() {
        assert!(matches!(
            ClientRequest::from_bytes(br#"{"payload":{}}"#),
            Err(FrameError::Malformed(_))
        ));
        assert!(matches!(
            ClientRequest::from_bytes(br#"{"action":"  "}"#),
            Err(FrameError::MissingAction)
        ));
    }

    #[test]
    fn client_request_malformed_json() {
        assert!(matches!(
            ClientRequest::from_bytes(b"not json"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn ack_frame_shape() {
        let frame = ServerFrame::queued("req-1");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "acknowledgment");
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["status"], "queued");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn progress_frame_roundtrip() {
        let frame = ServerFrame::Progress {
            request_id: "req-1".into(),
            percentage: 42.5,
            message: "crunching".into(),
            metadata: None,
            sequence: 3,
        };
        let bytes = frame.to_bytes().unwrap();
        let parsed = ServerFrame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.frame_type(), "progress");
    }

    #[test]
    fn error_frame_with_and_without_request() {
        let frame = ServerFrame::error(None, ErrorCode::ValidationError, "bad frame");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert!(json.get("request_id").is_none());
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");

        let frame = ServerFrame::error(
            Some("req-9".into()),
            ErrorCode::ProcessingFailed,
            "handler blew up",
        );
        assert_eq!(frame.request_id(), Some("req-9"));
    }

    #[test]
    fn complete_frame_shape() {
        let frame = ServerFrame::complete("req-1", Some(serde_json::json!({"url": "s3://x"})));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["success"], true);
        assert_eq!(json["result"]["url"], "s3://x");
    }
}
