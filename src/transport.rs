//! Remote invocation transport.
//!
//! The aggregator reaches endpoints only through these traits; connections
//! are made by an injected [`EndpointProvider`] rather than a process-wide
//! proxy cache. [`LocalRegistry`] and [`LocalEndpoint`] implement them for
//! hosts living in the same process, which is also what the tests use.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::error::{AppResult, LrcError};
use crate::host::{CommandHost, SubmitResponse};
use crate::notify::AttributeEvent;

/// Receives attribute change notifications from subscribed endpoints.
///
/// May be called concurrently from several delivery tasks.
pub trait NotificationSink: Send + Sync {
    /// Handle one notification.
    fn on_notification(&self, event: AttributeEvent);
}

/// A connected, command-hosting endpoint.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Endpoint name, as used in notifications.
    fn name(&self) -> &str;

    /// Invoke `command`; returns as soon as the endpoint has queued or
    /// rejected it.
    async fn invoke(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
    ) -> AppResult<SubmitResponse>;

    /// Deliver every change of `attribute` to `sink`, starting with its
    /// current value.
    async fn subscribe(&self, attribute: &str, sink: Arc<dyn NotificationSink>) -> AppResult<()>;
}

/// Opens connections to endpoints by address.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// Connect to the endpoint at `address`.
    async fn connect(&self, address: &str) -> AppResult<Arc<dyn Endpoint>>;
}

/// In-process connection to a [`CommandHost`].
pub struct LocalEndpoint {
    host: Arc<CommandHost>,
    deliveries: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("host", &self.host.name())
            .field("subscriptions", &self.deliveries.lock().len())
            .finish()
    }
}

impl LocalEndpoint {
    /// Connect to `host`.
    pub fn new(host: Arc<CommandHost>) -> Self {
        Self {
            host,
            deliveries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn name(&self) -> &str {
        self.host.name()
    }

    async fn invoke(
        &self,
        command: &str,
        arg: Option<serde_json::Value>,
    ) -> AppResult<SubmitResponse> {
        self.host.invoke(command, arg)
    }

    async fn subscribe(&self, attribute: &str, sink: Arc<dyn NotificationSink>) -> AppResult<()> {
        let mut events = self.host.bus().subscribe(self.host.name(), attribute);
        let endpoint = self.host.name().to_string();
        let attribute = attribute.to_string();
        debug!(%endpoint, %attribute, "Subscribed");

        let delivery = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                sink.on_notification(event);
            }
            debug!(%endpoint, %attribute, "Subscription closed");
        });
        self.deliveries.lock().push(delivery);
        Ok(())
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        for delivery in self.deliveries.get_mut().drain(..) {
            delivery.abort();
        }
    }
}

/// Hosts reachable in this process, addressed by name.
#[derive(Default)]
pub struct LocalRegistry {
    hosts: RwLock<HashMap<String, Arc<CommandHost>>>,
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.hosts.read().keys().cloned().collect();
        names.sort_unstable();
        f.debug_struct("LocalRegistry").field("hosts", &names).finish()
    }
}

impl LocalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `host` reachable under its name.
    pub fn register(&self, host: Arc<CommandHost>) {
        info!(endpoint = host.name(), "Endpoint registered");
        self.hosts.write().insert(host.name().to_string(), host);
    }

    /// Look up a host by name.
    pub fn get(&self, name: &str) -> Option<Arc<CommandHost>> {
        self.hosts.read().get(name).cloned()
    }
}

#[async_trait]
impl EndpointProvider for LocalRegistry {
    async fn connect(&self, address: &str) -> AppResult<Arc<dyn Endpoint>> {
        let host = self
            .get(address)
            .ok_or_else(|| LrcError::EndpointNotFound(address.to_string()))?;
        Ok(Arc::new(LocalEndpoint::new(host)))
    }
}
