//! Message bus access.
//!
//! `BusService` wraps one connection to the bus. Each session opens its own
//! `SessionSubscriptions`: a private queue whose bindings follow the
//! session's `subscribe` requests and whose events arrive, in broker order,
//! on a channel the session drains.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  open_subscriptions  ┌────────────────────────┐
//! │  BusService  │─────────────────────▶│  SessionSubscriptions  │
//! │ (1 / worker) │                      │  (1 / session)         │
//! └──────┬───────┘                      └───────────┬────────────┘
//!        │ dyn BusTransport                         │ mpsc<BusEvent>
//!        ▼                                          ▼
//! ┌──────────────┐                      ┌────────────────────────┐
//! │ AMQP / memory│─────── deliveries ──▶│        Session         │
//! └──────────────┘                      └────────────────────────┘
//! ```
//!
//! Connection loss is broadcast through a `CancellationToken`; bindings are
//! not re-established on a new connection, sessions close instead.

pub mod amqp;
pub mod memory;

pub use amqp::AmqpTransport;
pub use memory::MemoryBus;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use websocketd_core::TenantUuid;

use crate::config::{BusBackend, BusConfig};

/// Capacity of a session's event channel.
pub const EVENT_BUFFER: usize = 256;

/// Event name that subscribes to every event.
pub const ALL_EVENTS: &str = "*";

/// Header carrying the event name.
pub const NAME_HEADER: &str = "name";

/// Header carrying the tenant the event belongs to.
pub const TENANT_HEADER: &str = "tenant_uuid";

/// Header carrying the ACL needed to receive the event.
pub const REQUIRED_ACL_HEADER: &str = "required_acl";

/// Errors raised by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached
    #[error("Bus connection failed: {0}")]
    Connection(String),

    /// The connection went away
    #[error("Bus connection lost")]
    ConnectionLost,

    /// A declaration, binding or deletion was refused
    #[error("Bus operation failed: {0}")]
    Operation(String),
}

// ============================================================================
// Events and bindings
// ============================================================================

/// One message delivered by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    /// String headers of the message
    pub headers: BTreeMap<String, String>,

    /// Raw message body, JSON for well-formed events
    pub body: Vec<u8>,
}

impl BusEvent {
    pub fn new(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Builds an event the way the platform publishes one.
    pub fn from_json(name: &str, tenant: Option<TenantUuid>, body: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(NAME_HEADER.to_string(), name.to_string());
        if let Some(tenant) = tenant {
            headers.insert(TENANT_HEADER.to_string(), tenant.to_string());
        }
        Self::new(headers, body.to_string().into_bytes())
    }

    /// Sets the ACL needed to receive the event.
    #[must_use]
    pub fn with_required_acl(mut self, acl: impl Into<String>) -> Self {
        self.headers.insert(REQUIRED_ACL_HEADER.to_string(), acl.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.headers.get(NAME_HEADER).map(String::as_str)
    }

    pub fn tenant_uuid(&self) -> Option<&str> {
        self.headers.get(TENANT_HEADER).map(String::as_str)
    }

    /// ACL needed to receive this event, `events.<name>` unless set.
    pub fn required_access(&self) -> Option<String> {
        match self.headers.get(REQUIRED_ACL_HEADER) {
            Some(acl) => Some(acl.clone()),
            None => self.name().map(|name| format!("events.{name}")),
        }
    }
}

/// Header filter routing events to a session queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    /// Event name, or [`ALL_EVENTS`]
    pub event_name: String,

    /// Tenant filter, `None` for every tenant
    pub tenant: Option<TenantUuid>,
}

impl Binding {
    pub fn new(event_name: impl Into<String>, tenant: Option<TenantUuid>) -> Self {
        Self {
            event_name: event_name.into(),
            tenant,
        }
    }

    /// Headers that must all match (`x-match=all`).
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(2);
        if self.event_name != ALL_EVENTS {
            headers.push((NAME_HEADER, self.event_name.clone()));
        }
        if let Some(tenant) = self.tenant {
            headers.push((TENANT_HEADER, tenant.to_string()));
        }
        headers
    }

    /// Returns true if `event` passes this filter.
    pub fn matches(&self, event: &BusEvent) -> bool {
        self.headers()
            .iter()
            .all(|(key, value)| event.headers.get(*key) == Some(value))
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// One connection to a bus.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Declares the exchanges the gateway relies on. Idempotent.
    async fn initialize_exchanges(&self) -> Result<(), BusError>;

    /// Opens a private queue delivering matching events to `events`.
    async fn open_consumer(&self, events: mpsc::Sender<BusEvent>) -> Result<Box<dyn BusConsumer>, BusError>;

    /// Token cancelled when this connection is lost.
    fn connection_lost(&self) -> CancellationToken;

    /// Closes the connection.
    async fn close(&self) -> Result<(), BusError>;
}

/// Private queue of one session.
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Adds a binding to the queue.
    async fn bind(&mut self, binding: &Binding) -> Result<(), BusError>;

    /// Stops deliveries and deletes the queue.
    async fn close(self: Box<Self>) -> Result<(), BusError>;
}

// ============================================================================
// Service
// ============================================================================

/// Handle on one bus connection. Cheap to clone.
#[derive(Clone)]
pub struct BusService {
    transport: Arc<dyn BusTransport>,
}

impl BusService {
    pub fn new(transport: Arc<dyn BusTransport>) -> Self {
        Self { transport }
    }

    /// Declares the gateway exchanges.
    pub async fn initialize_exchanges(&self) -> Result<(), BusError> {
        self.transport.initialize_exchanges().await
    }

    /// Opens the subscription set of a new session.
    pub async fn open_subscriptions(&self) -> Result<SessionSubscriptions, BusError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let consumer = self.transport.open_consumer(tx).await?;
        Ok(SessionSubscriptions {
            consumer,
            events: rx,
            bindings: HashSet::new(),
        })
    }

    /// Token cancelled when the connection is lost.
    pub fn connection_lost(&self) -> CancellationToken {
        self.transport.connection_lost()
    }

    pub async fn close(&self) -> Result<(), BusError> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for BusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusService").finish_non_exhaustive()
    }
}

/// Bindings and event stream of one session.
pub struct SessionSubscriptions {
    consumer: Box<dyn BusConsumer>,
    events: mpsc::Receiver<BusEvent>,
    bindings: HashSet<Binding>,
}

impl SessionSubscriptions {
    /// Binds the session queue. Binding twice is a no-op.
    pub async fn subscribe(&mut self, binding: Binding) -> Result<(), BusError> {
        if self.bindings.contains(&binding) {
            debug!(event = %binding.event_name, "Already subscribed");
            return Ok(());
        }
        self.consumer.bind(&binding).await?;
        self.bindings.insert(binding);
        Ok(())
    }

    /// Receives the next event. `None` once deliveries stopped.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.events.recv().await
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    /// Removes every binding and the queue.
    pub async fn close(mut self) {
        self.events.close();
        let count = self.bindings.len();
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Failed to delete session queue");
        } else {
            debug!(bindings = count, "Session subscriptions removed");
        }
    }
}

/// Where a worker gets its bus connection from.
#[derive(Clone)]
pub enum BusConnector {
    /// Connect to an AMQP broker
    Amqp(BusConfig),
    /// Share an in-process bus
    Memory(MemoryBus),
}

impl BusConnector {
    pub fn from_config(config: &BusConfig) -> Self {
        match config.backend {
            BusBackend::Amqp => Self::Amqp(config.clone()),
            BusBackend::Memory => Self::Memory(MemoryBus::new()),
        }
    }

    /// Opens a new connection.
    pub async fn connect(&self) -> Result<BusService, BusError> {
        match self {
            Self::Amqp(config) => {
                let transport = AmqpTransport::connect(config).await?;
                Ok(BusService::new(Arc::new(transport)))
            }
            Self::Memory(bus) => Ok(BusService::new(Arc::new(bus.transport()))),
        }
    }
}

impl std::fmt::Debug for BusConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amqp(config) => write!(f, "BusConnector::Amqp({}:{})", config.host, config.port),
            Self::Memory(_) => write!(f, "BusConnector::Memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant() -> TenantUuid {
        "6b1c5e55-2f4e-4bb9-9a39-8f7e0c1d2a3b".parse().unwrap()
    }

    #[test]
    fn test_binding_headers() {
        let binding = Binding::new("user_created", Some(tenant()));
        assert_eq!(
            binding.headers(),
            vec![
                ("name", "user_created".to_string()),
                ("tenant_uuid", tenant().to_string())
            ]
        );
        assert!(Binding::new(ALL_EVENTS, None).headers().is_empty());
    }

    #[test]
    fn test_binding_matches_tenant() {
        let other: TenantUuid = "00000000-0000-4000-8000-000000000001".parse().unwrap();
        let binding = Binding::new("user_created", Some(tenant()));

        assert!(binding.matches(&BusEvent::from_json("user_created", Some(tenant()), &json!({}))));
        assert!(!binding.matches(&BusEvent::from_json("user_created", Some(other), &json!({}))));
        assert!(!binding.matches(&BusEvent::from_json("user_deleted", Some(tenant()), &json!({}))));
        assert!(Binding::new(ALL_EVENTS, None).matches(&BusEvent::from_json("x", None, &json!({}))));
    }

    #[test]
    fn test_required_access_defaults_to_event_name() {
        let event = BusEvent::from_json("user_created", None, &json!({}));
        assert_eq!(event.required_access().as_deref(), Some("events.user_created"));

        let event = event.with_required_acl("events.users.u1.user_created");
        assert_eq!(event.required_access().as_deref(), Some("events.users.u1.user_created"));
    }

    #[tokio::test]
    async fn test_subscriptions_dedupe_bindings() {
        let bus = MemoryBus::new();
        let service = BusService::new(Arc::new(bus.transport()));
        let mut subscriptions = service.open_subscriptions().await.unwrap();

        subscriptions.subscribe(Binding::new("a", None)).await.unwrap();
        subscriptions.subscribe(Binding::new("a", None)).await.unwrap();
        assert_eq!(bus.binding_count(), 1);
        assert_eq!(subscriptions.bindings().count(), 1);

        subscriptions.close().await;
        assert_eq!(bus.binding_count(), 0);
        assert_eq!(bus.consumer_count(), 0);
    }
}
