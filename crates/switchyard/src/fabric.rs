//! Fabric assembly.
//!
//! Wires the stores, dispatcher, router, and executor into one running
//! service over a given gateway transport. Registration order matters only
//! in that handlers must be in place before [`Switchyard::start`]; the
//! registry is treated as read-only after that.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use yardconf::{ConfigError, SwitchyardConfig};
use yardproto::Connection;
use yardstore::{
    spawn_registry_reaper, spawn_request_reaper, ConnectionRegistry, MemoryRegistry,
    MemoryRequestStore, RequestStore, StoreError,
};

use crate::dispatch::{Dispatcher, MetricsSnapshot};
use crate::executor::{CancelRegistry, Executor};
use crate::handler::HandlerRegistry;
use crate::router::Router;
use crate::transport::GatewayTransport;

/// One assembled fabric instance.
pub struct Switchyard {
    config: SwitchyardConfig,
    registry: Arc<dyn ConnectionRegistry>,
    store: Arc<dyn RequestStore>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    router: Arc<Router>,
    executor: Arc<Executor>,
    reaper_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Switchyard {
    /// Assemble with in-memory stores.
    pub fn new(
        config: SwitchyardConfig,
        transport: Arc<dyn GatewayTransport>,
    ) -> Result<Self, ConfigError> {
        let registry: Arc<dyn ConnectionRegistry> = MemoryRegistry::new_shared();
        let store: Arc<dyn RequestStore> = MemoryRequestStore::new_shared();
        Self::with_stores(config, transport, registry, store)
    }

    /// Assemble over caller-provided store backends.
    pub fn with_stores(
        config: SwitchyardConfig,
        transport: Arc<dyn GatewayTransport>,
        registry: Arc<dyn ConnectionRegistry>,
        store: Arc<dyn RequestStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let handlers = HandlerRegistry::new_shared();
        let cancels = CancelRegistry::new_shared();
        let dispatcher = Dispatcher::new(transport, Arc::clone(&registry), &config.dispatcher);
        let router = Router::new(
            Arc::clone(&handlers),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            Arc::clone(&cancels),
            &config,
        );
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::clone(&handlers),
            Arc::clone(&dispatcher),
            Arc::clone(&cancels),
            &config.executor,
            &config.progress,
        );

        Ok(Self {
            config,
            registry,
            store,
            handlers,
            dispatcher,
            router,
            executor,
            reaper_cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Handler registry; populate before [`Self::start`].
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Start the executor and the TTL reapers.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.executor.spawn());
        tasks.push(spawn_registry_reaper(
            Arc::clone(&self.registry),
            self.config.ttl.reap_interval(),
            self.reaper_cancel.clone(),
        ));
        tasks.push(spawn_request_reaper(
            Arc::clone(&self.store),
            self.config.ttl.reap_interval(),
            self.reaper_cancel.clone(),
        ));
        tracing::info!(
            actions = self.handlers.len(),
            "Switchyard started"
        );
    }

    /// Register a freshly authenticated socket.
    pub async fn connect(&self, connection: Connection) -> Result<(), StoreError> {
        self.registry.put(connection).await
    }

    /// Remove a closed socket's row.
    pub async fn disconnect(&self, connection_id: &str) -> Result<bool, StoreError> {
        self.registry.remove(connection_id).await
    }

    /// Route one inbound frame from a connection.
    pub async fn handle_frame(&self, connection_id: &str, body: &[u8]) {
        self.router.handle_frame(connection_id, body).await
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics()
    }

    /// Drain the executor, then the dispatcher, then stop background
    /// tasks. Each phase gets the full deadline; a slow phase eats into
    /// fidelity, not correctness.
    pub async fn shutdown(&self, deadline: Duration) {
        self.reaper_cancel.cancel();
        self.executor.shutdown(deadline).await;
        self.dispatcher.shutdown(deadline).await;

        let tasks = {
            let mut tasks = self.tasks.lock().unwrap();
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Switchyard stopped");
    }
}
