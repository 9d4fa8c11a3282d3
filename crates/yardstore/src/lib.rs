//! yardstore - Connection registry and async request store.
//!
//! Two stores with exclusive row ownership: the registry owns `Connection`
//! rows, the request store owns `AsyncRequest` rows. All writes are
//! conditional updates keyed on current status or existence, so concurrent
//! workers cannot lose updates. The request store emits a change feed of
//! insert/modify/remove events with before/after images; the feed is the
//! only queue between the Router and the Executor.
//!
//! Traits are the seam for durable backends; the in-tree implementations
//! are in-memory.

pub mod connections;
pub mod feed;
pub mod reaper;
pub mod requests;
pub mod sqlite;

pub use connections::{ConnectionRegistry, MemoryRegistry, RegistryStats};
pub use feed::{ChangeEvent, ChangeKind};
pub use reaper::{spawn_registry_reaper, spawn_request_reaper};
pub use requests::{MemoryRequestStore, RequestStore, RequestStoreStats};
pub use sqlite::SqliteRequestStore;

use yardproto::RequestStatus;

/// Store operation failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("row not found: {id}")]
    NotFound { id: String },

    #[error("duplicate row: {id}")]
    Duplicate { id: String },

    /// A conditional update observed a different status than expected.
    /// The caller lost the race; another worker owns the row now.
    #[error("conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: RequestStatus,
        actual: RequestStatus,
    },

    #[error("illegal transition on {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("store backend failure: {0}")]
    Backend(String),
}
