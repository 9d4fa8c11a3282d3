//! Change feed for the request store.
//!
//! Every committed row mutation is published as a [`ChangeEvent`] carrying
//! before/after images. Events for one row are emitted in mutation order;
//! there is no ordering guarantee across rows. Consumers that fall behind
//! the broadcast buffer observe a lag error and are expected to resync via
//! the store's periodic sweeps.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use yardproto::AsyncRequest;

/// Default broadcast buffer depth for feed subscribers.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

/// A single table mutation with before/after images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub before: Option<AsyncRequest>,
    pub after: Option<AsyncRequest>,
}

impl ChangeEvent {
    pub fn insert(after: AsyncRequest) -> Self {
        Self {
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
        }
    }

    pub fn modify(before: AsyncRequest, after: AsyncRequest) -> Self {
        Self {
            kind: ChangeKind::Modify,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn remove(before: AsyncRequest) -> Self {
        Self {
            kind: ChangeKind::Remove,
            before: Some(before),
            after: None,
        }
    }

    /// The row id this event concerns.
    pub fn request_id(&self) -> &str {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|r| r.request_id.as_str())
            .unwrap_or("")
    }
}

/// Feed publisher held by the store. Send failures mean no subscribers,
/// which is fine; events are droppable until someone listens.
#[derive(Debug)]
pub struct FeedPublisher {
    tx: broadcast::Sender<ChangeEvent>,
}

impl FeedPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for FeedPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(id: &str) -> AsyncRequest {
        AsyncRequest::new(id, "C1", "echo", None, "user-1", None, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn publishes_to_subscribers() {
        let publisher = FeedPublisher::default();
        let mut rx = publisher.subscribe();

        publisher.publish(ChangeEvent::insert(request("req-1")));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.request_id(), "req-1");
        assert!(event.before.is_none());
        assert!(event.after.is_some());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let publisher = FeedPublisher::default();
        publisher.publish(ChangeEvent::insert(request("req-1")));
    }

    #[tokio::test]
    async fn modify_carries_both_images() {
        let publisher = FeedPublisher::default();
        let mut rx = publisher.subscribe();

        let before = request("req-1");
        let mut after = before.clone();
        after.progress = 50.0;
        publisher.publish(ChangeEvent::modify(before, after));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Modify);
        assert_eq!(event.before.unwrap().progress, 0.0);
        assert_eq!(event.after.unwrap().progress, 50.0);
    }
}
