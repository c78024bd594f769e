// Event Bus Implementation - Pub/Sub for Unit Events
//
// Provides in-memory event streaming using tokio broadcast channels.
// Lets observers follow unit transitions without registering callbacks.
//
// In-memory only: events published while nobody listens are dropped.

use crate::domain::events::UnitEvent;
use crate::domain::unit::UnitId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Event bus for publishing and subscribing to unit events
#[derive(Clone)]
pub struct UnitEventBus {
    sender: Arc<broadcast::Sender<UnitEvent>>,
}

impl UnitEventBus {
    /// Create a new event bus with specified channel capacity
    /// Capacity determines how many events can be buffered before dropping old ones
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create event bus with default capacity (1000)
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish a unit event to all subscribers
    pub fn publish(&self, event: UnitEvent) {
        debug!("Publishing event: {:?}", event);

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
    }

    /// Subscribe to all unit events
    pub fn subscribe(&self) -> UnitEventReceiver {
        UnitEventReceiver {
            receiver: self.sender.subscribe(),
            unit_id: None,
        }
    }

    /// Subscribe to events of a single unit
    pub fn subscribe_unit(&self, unit_id: UnitId) -> UnitEventReceiver {
        UnitEventReceiver {
            receiver: self.sender.subscribe(),
            unit_id: Some(unit_id),
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for UnitEventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Receiver for unit events, optionally filtered to one unit
pub struct UnitEventReceiver {
    receiver: broadcast::Receiver<UnitEvent>,
    unit_id: Option<UnitId>,
}

impl UnitEventReceiver {
    /// Receive the next matching event (waits until one is available)
    pub async fn recv(&mut self) -> Result<UnitEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive a matching event without waiting
    pub fn try_recv(&mut self) -> Result<UnitEvent, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &UnitEvent) -> bool {
        self.unit_id.as_ref().is_none_or(|id| event.unit_id() == id)
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
