//! switchyard - Real-time async request-processing fabric.
//!
//! Clients submit work over a long-lived bidirectional socket, get an
//! immediate acknowledgment, and watch live progress while the work runs in
//! the background. Short requests execute inline; long requests are durably
//! queued, driven by the change-feed executor, and their progress streams
//! back over the same socket. This exists to sidestep the ~29 second
//! timeout of cloud HTTP gateways.
//!
//! The moving parts:
//!
//! - [`router::Router`] — parse, validate, and decide sync vs. async per
//!   inbound frame
//! - [`executor::Executor`] — drive queued requests through their state
//!   machine with retries and timeouts
//! - [`dispatch::Dispatcher`] — the delivery layer: retry/backoff,
//!   per-connection circuit breakers, bounded broadcast fan-out, metrics
//! - [`progress::ProgressReporter`] — coalesced progress frames at a
//!   bounded rate
//! - [`transport::GatewayTransport`] — the seam to the socket gateway
//!
//! [`Switchyard`] assembles all of it over a transport and a pair of
//! stores.

pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fabric;
pub mod handler;
pub mod progress;
pub mod router;
pub mod transport;

pub use dispatch::{BroadcastFailure, BroadcastOutcome, Dispatcher, MetricsSnapshot};
pub use error::DispatchError;
pub use executor::{CancelRegistry, Executor};
pub use fabric::Switchyard;
pub use handler::{Handler, HandlerError, HandlerRegistry, RequestContext};
pub use progress::ProgressReporter;
pub use router::Router;
pub use transport::{Fault, GatewayTransport, LoopbackGateway, PeerInfo, TransportError};
