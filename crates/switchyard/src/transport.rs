//! Delivery transport abstraction.
//!
//! The socket gateway itself is an external collaborator; this module
//! defines the seam the Dispatcher drives: post a frame to a connection,
//! probe a connection, close one. Gateway-specific failures are converted
//! into the fixed [`TransportError`] taxonomy at this boundary so that
//! retry policy upstream never inspects raw status codes.
//!
//! [`LoopbackGateway`] is the in-tree implementation: an in-memory gateway
//! with scriptable per-connection fault plans and a delivered-frame log.
//! Integration tests and local wiring run against it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use yardproto::ServerFrame;

/// Transport failures, by kind. Retry policy keys off [`Self::is_retryable`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The gateway no longer knows the connection (408/410-equivalent).
    #[error("connection gone: {connection_id}")]
    Gone { connection_id: String },

    /// Rate-limit response (429-equivalent). Retryable.
    #[error("rate limited by gateway")]
    RateLimited,

    /// Gateway-side failure (5xx-equivalent). Retryable.
    #[error("gateway error: {status}")]
    Server { status: u16 },

    /// Caller-side failure other than rate limiting (4xx-equivalent).
    #[error("gateway rejected request: {status}")]
    Client { status: u16 },

    /// The transport call itself timed out. Retryable.
    #[error("transport timeout")]
    Timeout,

    /// Socket-level failure. Retryable.
    #[error("transport io: {0}")]
    Io(String),
}

impl TransportError {
    /// Transient errors worth another attempt: 5xx and rate-limit
    /// equivalents, timeouts, and raw io failures. Gone and other 4xx are
    /// permanent for this send.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::RateLimited
            | TransportError::Server { .. }
            | TransportError::Timeout
            | TransportError::Io(_) => true,
            TransportError::Gone { .. } | TransportError::Client { .. } => false,
        }
    }

    /// Stable label for metrics counters.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Gone { .. } => "gone",
            TransportError::RateLimited => "rate_limited",
            TransportError::Server { .. } => "server",
            TransportError::Client { .. } => "client",
            TransportError::Timeout => "timeout",
            TransportError::Io(_) => "io",
        }
    }
}

/// Probe result for a live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub connected_at: Option<DateTime<Utc>>,
    /// Last activity the gateway observed, when it reports one.
    pub last_active: Option<DateTime<Utc>>,
}

/// The gateway's send/get/close primitives.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Deliver one encoded frame to a connection.
    async fn post_to_connection(
        &self,
        connection_id: &str,
        body: Bytes,
    ) -> Result<(), TransportError>;

    /// Probe a connection. `Gone` means the socket is no longer live.
    async fn connection_status(&self, connection_id: &str) -> Result<PeerInfo, TransportError>;

    /// Ask the gateway to close a connection.
    async fn close_connection(&self, connection_id: &str) -> Result<(), TransportError>;
}

/// One scripted failure for the loopback gateway.
#[derive(Debug, Clone)]
pub enum Fault {
    Gone,
    RateLimited,
    Server(u16),
    Client(u16),
    Timeout,
}

impl Fault {
    fn to_error(&self, connection_id: &str) -> TransportError {
        match self {
            Fault::Gone => TransportError::Gone {
                connection_id: connection_id.to_string(),
            },
            Fault::RateLimited => TransportError::RateLimited,
            Fault::Server(status) => TransportError::Server { status: *status },
            Fault::Client(status) => TransportError::Client { status: *status },
            Fault::Timeout => TransportError::Timeout,
        }
    }
}

#[derive(Debug, Default)]
struct PeerState {
    delivered: Vec<Bytes>,
    /// Faults consumed one per delivery attempt, front first.
    fault_plan: VecDeque<Fault>,
    /// Permanently gone: every call fails with `Gone`.
    gone: bool,
    connected_at: Option<DateTime<Utc>>,
}

/// In-memory gateway for tests and local wiring.
#[derive(Debug, Default)]
pub struct LoopbackGateway {
    peers: DashMap<String, PeerState>,
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a live socket.
    pub fn open(&self, connection_id: impl Into<String>) {
        self.peers.insert(
            connection_id.into(),
            PeerState {
                connected_at: Some(Utc::now()),
                ..PeerState::default()
            },
        );
    }

    /// Queue faults to be returned for the next delivery attempts, in order.
    pub fn script_faults(&self, connection_id: &str, faults: impl IntoIterator<Item = Fault>) {
        if let Some(mut peer) = self.peers.get_mut(connection_id) {
            peer.fault_plan.extend(faults);
        }
    }

    /// Drop the socket: every subsequent call observes `Gone`.
    pub fn mark_gone(&self, connection_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(connection_id) {
            peer.gone = true;
        }
    }

    /// Raw bodies delivered to a connection, in delivery order.
    pub fn delivered(&self, connection_id: &str) -> Vec<Bytes> {
        self.peers
            .get(connection_id)
            .map(|p| p.delivered.clone())
            .unwrap_or_default()
    }

    /// Delivered bodies decoded as server frames. Panics on undecodable
    /// bodies; only tests call this.
    pub fn delivered_frames(&self, connection_id: &str) -> Vec<ServerFrame> {
        self.delivered(connection_id)
            .iter()
            .map(|body| ServerFrame::from_bytes(body).expect("delivered body is a server frame"))
            .collect()
    }
}

#[async_trait]
impl GatewayTransport for LoopbackGateway {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        body: Bytes,
    ) -> Result<(), TransportError> {
        let mut peer =
            self.peers
                .get_mut(connection_id)
                .ok_or_else(|| TransportError::Gone {
                    connection_id: connection_id.to_string(),
                })?;
        if peer.gone {
            return Err(TransportError::Gone {
                connection_id: connection_id.to_string(),
            });
        }
        if let Some(fault) = peer.fault_plan.pop_front() {
            if matches!(fault, Fault::Gone) {
                peer.gone = true;
            }
            return Err(fault.to_error(connection_id));
        }
        peer.delivered.push(body);
        Ok(())
    }

    async fn connection_status(&self, connection_id: &str) -> Result<PeerInfo, TransportError> {
        let peer = self
            .peers
            .get(connection_id)
            .ok_or_else(|| TransportError::Gone {
                connection_id: connection_id.to_string(),
            })?;
        if peer.gone {
            return Err(TransportError::Gone {
                connection_id: connection_id.to_string(),
            });
        }
        Ok(PeerInfo {
            connected_at: peer.connected_at,
            last_active: None,
        })
    }

    async fn close_connection(&self, connection_id: &str) -> Result<(), TransportError> {
        self.peers.remove(connection_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(TransportError::RateLimited.is_retryable());
        assert!(TransportError::Server { status: 502 }.is_retryable());
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Io("reset".into()).is_retryable());

        assert!(!TransportError::Gone {
            connection_id: "C1".into()
        }
        .is_retryable());
        assert!(!TransportError::Client { status: 403 }.is_retryable());
    }

    #[tokio::test]
    async fn loopback_delivers_in_order() {
        let gateway = LoopbackGateway::new();
        gateway.open("C1");

        gateway
            .post_to_connection("C1", Bytes::from_static(b"one"))
            .await
            .unwrap();
        gateway
            .post_to_connection("C1", Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(
            gateway.delivered("C1"),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
    }

    #[tokio::test]
    async fn unknown_connection_is_gone() {
        let gateway = LoopbackGateway::new();
        let err = gateway
            .post_to_connection("nope", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Gone { .. }));
    }

    #[tokio::test]
    async fn fault_plan_consumed_in_order() {
        let gateway = LoopbackGateway::new();
        gateway.open("C1");
        gateway.script_faults("C1", [Fault::Server(503), Fault::RateLimited]);

        let err = gateway
            .post_to_connection("C1", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Server { status: 503 }));

        let err = gateway
            .post_to_connection("C1", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RateLimited));

        // Plan exhausted; delivery succeeds
        gateway
            .post_to_connection("C1", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(gateway.delivered("C1").len(), 1);
    }

    #[tokio::test]
    async fn gone_fault_is_permanent() {
        let gateway = LoopbackGateway::new();
        gateway.open("C1");
        gateway.script_faults("C1", [Fault::Gone]);

        assert!(gateway
            .post_to_connection("C1", Bytes::from_static(b"x"))
            .await
            .is_err());
        // Still gone after the plan drained
        assert!(gateway
            .post_to_connection("C1", Bytes::from_static(b"x"))
            .await
            .is_err());
        assert!(gateway.connection_status("C1").await.is_err());
    }

    #[tokio::test]
    async fn status_probe() {
        let gateway = LoopbackGateway::new();
        gateway.open("C1");

        let info = gateway.connection_status("C1").await.unwrap();
        assert!(info.connected_at.is_some());

        gateway.close_connection("C1").await.unwrap();
        assert!(gateway.connection_status("C1").await.is_err());
    }
}
