//! Dispatcher-facing error taxonomy.
//!
//! Internal components surface these upward; the Router and Executor
//! translate them into client-visible [`ErrorCode`]s at the boundary.

use yardproto::ErrorCode;
use yardstore::StoreError;

use crate::transport::TransportError;

/// Failures observable from dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Frame could not be encoded. Never retried.
    #[error("marshal failed: {0}")]
    Marshal(String),

    /// No registry row for the target connection. Never retried.
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    /// The gateway reported the socket gone; the registry row is being
    /// cleaned up in the background.
    #[error("connection stale: {0}")]
    ConnectionStale(String),

    /// Per-connection breaker is open; transport was not attempted.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// Dispatcher is draining; new work is refused.
    #[error("dispatcher shutting down")]
    ShuttingDown,

    /// The caller's cancellation handle fired mid-send.
    #[error("send cancelled")]
    Cancelled,

    /// Transport failed after the retry budget (or on a non-retryable
    /// error). Carries the final transport error and attempts made.
    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        connection_id: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Stable label for metrics counters.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Marshal(_) => "marshal",
            DispatchError::ConnectionNotFound(_) => "connection_not_found",
            DispatchError::ConnectionStale(_) => "connection_stale",
            DispatchError::CircuitOpen(_) => "circuit_open",
            DispatchError::ShuttingDown => "shutting_down",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Transport { .. } => "transport",
            DispatchError::Store(_) => "store",
        }
    }

    /// The reporter demotes itself to store-only mode on these.
    pub fn is_connection_dead(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectionStale(_) | DispatchError::ConnectionNotFound(_)
        )
    }

    /// Client-visible translation for errors that reach a socket.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DispatchError::Marshal(_) => ErrorCode::InternalError,
            DispatchError::ConnectionNotFound(_) => ErrorCode::NotFound,
            DispatchError::ConnectionStale(_) => ErrorCode::NotFound,
            DispatchError::CircuitOpen(_) => ErrorCode::ServiceUnavailable,
            DispatchError::ShuttingDown => ErrorCode::ServiceUnavailable,
            DispatchError::Cancelled => ErrorCode::ServiceUnavailable,
            DispatchError::Transport { source, .. } => match source {
                TransportError::RateLimited => ErrorCode::RateLimited,
                TransportError::Timeout => ErrorCode::Timeout,
                _ => ErrorCode::ServiceUnavailable,
            },
            DispatchError::Store(_) => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(DispatchError::ShuttingDown.kind(), "shutting_down");
        assert_eq!(
            DispatchError::CircuitOpen("C1".into()).kind(),
            "circuit_open"
        );
    }

    #[test]
    fn dead_connection_detection() {
        assert!(DispatchError::ConnectionStale("C1".into()).is_connection_dead());
        assert!(DispatchError::ConnectionNotFound("C1".into()).is_connection_dead());
        assert!(!DispatchError::ShuttingDown.is_connection_dead());
    }

    #[test]
    fn client_codes() {
        assert_eq!(
            DispatchError::Marshal("x".into()).error_code(),
            ErrorCode::InternalError
        );
        let err = DispatchError::Transport {
            connection_id: "C1".into(),
            attempts: 3,
            source: TransportError::RateLimited,
        };
        assert_eq!(err.error_code(), ErrorCode::RateLimited);
    }
}
