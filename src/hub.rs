//! Per-connection outbound channels.
//!
//! Each transport connection registers here and gets a bounded channel of
//! outbound events, drained by that connection's writer thread. Senders never
//! block: a connection whose outbox is full loses the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::gateway::OutboundEvent;

/// Outbound events buffered per connection before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 64;

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique identity of one transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(u64);

impl TransportId {
    pub fn next() -> Self {
        TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Fire-and-forget delivery of an event to one transport.
pub trait EventSink: Send + Sync {
    /// Returns false when the event could not be handed off.
    fn send(&self, transport: TransportId, event: OutboundEvent) -> bool;
}

#[derive(Default)]
pub struct ConnectionHub {
    connections: Mutex<HashMap<TransportId, Sender<OutboundEvent>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransportId, Sender<OutboundEvent>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection and return its id and outbox.
    pub fn register(&self) -> (TransportId, Receiver<OutboundEvent>) {
        let id = TransportId::next();
        let (tx, rx) = bounded(OUTBOX_CAPACITY);
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Drop a connection's sender; its writer sees the channel close.
    pub fn unregister(&self, transport: TransportId) -> bool {
        self.lock().remove(&transport).is_some()
    }

    /// Drop every sender. Used at shutdown.
    pub fn close_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl EventSink for ConnectionHub {
    fn send(&self, transport: TransportId, event: OutboundEvent) -> bool {
        let sender = match self.lock().get(&transport) {
            Some(sender) => sender.clone(),
            None => return false,
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("outbox full for {}; event dropped", transport);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
