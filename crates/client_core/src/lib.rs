//! Real-time client for a VelvetPour machine controller.
//!
//! A [`MachineSession`] owns the event channel connection, the listener
//! registry, the machine status model and the order coordinator for one
//! machine. Nothing here is global: construct one session per machine and
//! pass it by handle.

use std::sync::Arc;

use anyhow::{Context, Result};
use shared::protocol::{EventKind, ServerEvent};
use tokio::sync::broadcast;
use tracing::info;

pub mod api;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod orders;
pub mod registry;
pub mod status;
pub mod transport;
pub mod view;

pub use api::{HttpMachineApi, MachineApi};
pub use catalog::{load_catalog, CatalogSnapshot};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use error::{ApiRequestError, ConnectionError, OrderError, TransportError};
pub use orders::{Order, OrderAccepted, OrderCoordinator};
pub use registry::{ListenerRegistry, Subscription};
pub use status::{MachineNotice, MachineState, MachineStatus, StatusTracker};
pub use transport::{Transport, WebSocketTransport};
pub use view::{Notice, OrderAvailability, ViewAdapter, ViewState};

pub struct MachineSession {
    settings: ClientSettings,
    registry: ListenerRegistry,
    connection: ConnectionManager,
    tracker: StatusTracker,
    orders: Arc<OrderCoordinator>,
    api: Arc<dyn MachineApi>,
}

impl MachineSession {
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let server_url = settings.server_url()?;
        let api = HttpMachineApi::new(&server_url, settings.request_timeout())
            .context("failed to build request layer")?;
        let transport = WebSocketTransport::new(settings.event_buffer);
        Self::new_with_dependencies(settings, Arc::new(transport), Arc::new(api))
    }

    pub fn new_with_dependencies(
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        api: Arc<dyn MachineApi>,
    ) -> Result<Self> {
        let url = settings
            .event_channel_url()
            .context("invalid event channel url")?;
        let registry = ListenerRegistry::new();
        let connection = ConnectionManager::new(
            url,
            transport,
            settings.reconnect_policy(),
            registry.clone(),
        );
        let tracker = StatusTracker::new();
        let orders = Arc::new(OrderCoordinator::new(Arc::clone(&api), tracker.watch()));
        Ok(Self {
            settings,
            registry,
            connection,
            tracker,
            orders,
            api,
        })
    }

    /// Attaches the status model and opens the event channel.
    ///
    /// A failed first handshake is returned, but retries keep running in the
    /// background within the reconnect policy.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        self.tracker.attach(&self.registry);
        info!(
            server_url = %self.settings.server_url,
            event_channel = %self.connection.url(),
            "starting machine session"
        );
        self.connection.connect().await
    }

    /// Closes the event channel and drops the session's own subscriptions.
    /// Consumer subscriptions stay registered until their handles are used.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.tracker.detach();
        info!("machine session shut down");
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn on<F>(&self, event: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.registry.on(event, callback)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn status(&self) -> MachineStatus {
        self.tracker.status()
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn notices(&self) -> broadcast::Receiver<MachineNotice> {
        self.tracker.notices()
    }

    pub fn api(&self) -> Arc<dyn MachineApi> {
        Arc::clone(&self.api)
    }

    pub fn ping_server(&self) -> Result<(), ConnectionError> {
        self.connection.ping_server()
    }

    pub async fn submit_order(&self, order: Order) -> Result<OrderAccepted, OrderError> {
        self.orders.submit_order(order).await
    }

    pub async fn load_catalog(&self) -> Result<CatalogSnapshot, ApiRequestError> {
        load_catalog(self.api.as_ref()).await
    }

    pub fn view(&self) -> ViewAdapter {
        ViewAdapter::new(
            self.connection.watch_state(),
            self.connection.watch_errors(),
            self.tracker.watch(),
            Arc::clone(&self.orders),
        )
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
