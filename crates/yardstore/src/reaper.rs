//! TTL reapers.
//!
//! Periodic purge tasks for both stores. Reapers never block callers; a
//! failed purge is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::{ConnectionRegistry, RequestStore};

/// Spawn a background task that periodically reaps expired connections.
pub fn spawn_registry_reaper(
    registry: Arc<dyn ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Registry reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match registry.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed = removed, "Registry reap completed");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Registry reap failed");
                        }
                    }
                }
            }
        }
    })
}

/// Spawn a background task that periodically reaps expired requests.
pub fn spawn_request_reaper(
    store: Arc<dyn RequestStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Request reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match store.purge_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            tracing::info!(removed = removed, "Request reap completed");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Request reap failed");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRegistry, MemoryRequestStore};
    use yardproto::Connection;

    #[tokio::test]
    async fn registry_reaper_purges_and_stops() {
        let registry = MemoryRegistry::new_shared();
        registry
            .put(Connection::new(
                "C1",
                "user-1",
                "wss://gw/test",
                Duration::from_secs(0),
            ))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_registry_reaper(
            registry.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get("C1").await.unwrap().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn request_reaper_stops_on_cancel() {
        let store = MemoryRequestStore::new_shared();
        let cancel = CancellationToken::new();
        let handle =
            spawn_request_reaper(store, Duration::from_millis(10), cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
    }
}
