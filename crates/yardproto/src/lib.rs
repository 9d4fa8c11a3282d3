//! yardproto - Protocol types for the Switchyard request fabric
//!
//! This crate defines the frames exchanged between clients and the fabric,
//! the client-visible error taxonomy, and the durable domain records
//! (connections and async requests) shared by the registry, the store, and
//! the core service crate. Everything here is plain data; behavior lives in
//! `yardstore` and `switchyard`.

pub mod domain;
pub mod error;
pub mod frames;

pub use domain::{AsyncRequest, Connection, RequestStatus};
pub use error::{ErrorBody, ErrorCode};
pub use frames::{ClientRequest, FrameError, ServerFrame};
