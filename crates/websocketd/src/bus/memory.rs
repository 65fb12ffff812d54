//! In-process bus.
//!
//! Routes published events to session queues with the same header
//! matching an AMQP headers exchange applies. Used when the gateway is
//! embedded and by the test suites.
//!
//! Publishing never blocks: an event reaching a session queue that already
//! holds [`EVENT_BUFFER`](super::EVENT_BUFFER) undelivered events is dropped
//! for that session and logged. The AMQP transport instead stops taking
//! deliveries until the session catches up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Binding, BusConsumer, BusError, BusEvent, BusTransport};

#[derive(Debug)]
struct Queue {
    sender: mpsc::Sender<BusEvent>,
    bindings: Vec<Binding>,
}

#[derive(Debug)]
struct State {
    next_queue: u64,
    queues: HashMap<u64, Queue>,
    /// Cancelled on connection loss, replaced for the next connection
    lost: CancellationToken,
}

/// Shared in-process bus. Clones publish to the same queues.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
    initialized: Arc<AtomicBool>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_queue: 0,
                queues: HashMap::new(),
                lost: CancellationToken::new(),
            })),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a connection to this bus.
    pub fn transport(&self) -> MemoryTransport {
        let lost = self.state().lost.clone();
        MemoryTransport {
            bus: self.clone(),
            lost,
        }
    }

    /// Publishes `event`, returning the number of queues it reached.
    ///
    /// Each queue receives the event once, whatever the number of its
    /// bindings that match. Full queues are skipped and not counted.
    pub fn publish(&self, event: BusEvent) -> usize {
        let state = self.state();
        let mut delivered = 0;

        for (id, queue) in &state.queues {
            if !queue.bindings.iter().any(|binding| binding.matches(&event)) {
                continue;
            }
            match queue.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(queue = id, "Session queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(queue = id, "Session queue closed");
                }
            }
        }

        delivered
    }

    /// Number of bindings across all queues.
    pub fn binding_count(&self) -> usize {
        self.state().queues.values().map(|queue| queue.bindings.len()).sum()
    }

    /// Number of open session queues.
    pub fn consumer_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Returns true once `initialize_exchanges` ran.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Drops every queue and signals loss to current connections.
    ///
    /// Connections opened afterwards work normally.
    pub fn simulate_connection_loss(&self) {
        let mut state = self.state();
        state.queues.clear();
        let lost = std::mem::replace(&mut state.lost, CancellationToken::new());
        lost.cancel();
    }
}

/// One connection to a [`MemoryBus`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    bus: MemoryBus,
    lost: CancellationToken,
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn initialize_exchanges(&self) -> Result<(), BusError> {
        if self.lost.is_cancelled() {
            return Err(BusError::ConnectionLost);
        }
        self.bus.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_consumer(&self, events: mpsc::Sender<BusEvent>) -> Result<Box<dyn BusConsumer>, BusError> {
        if self.lost.is_cancelled() {
            return Err(BusError::ConnectionLost);
        }

        let mut state = self.bus.state();
        let id = state.next_queue;
        state.next_queue += 1;
        state.queues.insert(
            id,
            Queue {
                sender: events,
                bindings: Vec::new(),
            },
        );

        Ok(Box::new(MemoryConsumer {
            bus: self.bus.clone(),
            id,
        }))
    }

    fn connection_lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

struct MemoryConsumer {
    bus: MemoryBus,
    id: u64,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn bind(&mut self, binding: &Binding) -> Result<(), BusError> {
        let mut state = self.bus.state();
        let queue = state.queues.get_mut(&self.id).ok_or(BusError::ConnectionLost)?;
        queue.bindings.push(binding.clone());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        self.bus.state().queues.remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusService, EVENT_BUFFER};
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_matching_queue_once() {
        let bus = MemoryBus::new();
        let service = BusService::new(Arc::new(bus.transport()));
        let mut subscriptions = service.open_subscriptions().await.unwrap();
        subscriptions.subscribe(Binding::new("user_created", None)).await.unwrap();
        subscriptions.subscribe(Binding::new("*", None)).await.unwrap();

        let event = BusEvent::from_json("user_created", None, &json!({"name": "user_created"}));
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(subscriptions.recv().await, Some(event));

        assert_eq!(bus.publish(BusEvent::from_json("other", None, &json!({}))), 1);
        assert_eq!(bus.publish(BusEvent::new(Default::default(), Vec::new())), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let bus = MemoryBus::new();
        let service = BusService::new(Arc::new(bus.transport()));
        let mut subscriptions = service.open_subscriptions().await.unwrap();
        subscriptions.subscribe(Binding::new("*", None)).await.unwrap();

        let delivered: usize = (0..EVENT_BUFFER + 10)
            .map(|seq| bus.publish(BusEvent::from_json("tick", None, &json!({ "seq": seq }))))
            .sum();
        assert_eq!(delivered, EVENT_BUFFER);

        // Oldest events are kept, the overflow is gone
        let first = subscriptions.recv().await.unwrap();
        assert_eq!(first.body, json!({ "seq": 0 }).to_string().into_bytes());

        // Room again once the session drains
        assert_eq!(bus.publish(BusEvent::from_json("tick", None, &json!({}))), 1);
    }

    #[tokio::test]
    async fn test_connection_loss() {
        let bus = MemoryBus::new();
        let transport = bus.transport();
        let lost = transport.connection_lost();
        let service = BusService::new(Arc::new(transport));
        let mut subscriptions = service.open_subscriptions().await.unwrap();

        bus.simulate_connection_loss();

        assert!(lost.is_cancelled());
        assert_eq!(subscriptions.recv().await, None);
        assert!(matches!(
            service.open_subscriptions().await,
            Err(BusError::ConnectionLost)
        ));

        // A new connection works again
        let fresh = BusService::new(Arc::new(bus.transport()));
        assert!(!fresh.connection_lost().is_cancelled());
        assert!(fresh.open_subscriptions().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_exchanges() {
        let bus = MemoryBus::new();
        assert!(!bus.is_initialized());
        bus.transport().initialize_exchanges().await.unwrap();
        assert!(bus.is_initialized());
    }
}
