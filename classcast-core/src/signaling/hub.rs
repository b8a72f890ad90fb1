//! Per-class event broadcast hub
//!
//! Each class has one broadcast channel carrying server-pushed events to
//! every connection in the class. Envelopes name the originating
//! connection so the transport layer can skip echoing an event back to
//! the connection that caused it.

use crate::signaling::messages::ServerEvent;
use classcast_media::ClassId;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Monotonic id for one signaling connection.
pub type ConnectionId = u64;

/// One event together with the connection that triggered it.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Originating connection; `None` for system-originated events.
    pub origin: Option<ConnectionId>,
    pub event: ServerEvent,
}

/// Broadcast channels, one per class with listeners.
#[derive(Default)]
pub struct ClassHub {
    channels: DashMap<ClassId, broadcast::Sender<EventEnvelope>>,
}

impl ClassHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the class's event stream, creating the channel on first use.
    pub fn subscribe(&self, class_id: &ClassId) -> broadcast::Receiver<EventEnvelope> {
        self.channels
            .entry(class_id.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Push an event to every subscriber of the class. Events for classes
    /// without listeners are dropped.
    pub fn publish(&self, class_id: &ClassId, origin: Option<ConnectionId>, event: ServerEvent) {
        if let Some(sender) = self.channels.get(class_id) {
            let receivers = sender.send(EventEnvelope { origin, event }).unwrap_or(0);
            trace!(class_id = %class_id, receivers, "event published");
        }
    }

    /// Drop the class's channel once the class ended. Subscribers still
    /// drain anything already buffered.
    pub fn remove(&self, class_id: &ClassId) {
        self.channels.remove(class_id);
    }
}
