//! Change bus: fan-out of "resource changed" notifications.
//!
//! Publishers enqueue a resource key on one bounded queue. A single
//! fan-out task copies every key into each subscriber's own bounded
//! queue with `try_send`: a full subscriber queue drops the notification
//! for that subscriber only, so one slow WebSocket never stalls the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Capacity of the shared publish queue
pub const QUEUE_CAPACITY: usize = 256;
/// Capacity of each subscriber's queue
pub const SUBSCRIBER_CAPACITY: usize = 32;

type Registry = Mutex<HashMap<u64, mpsc::Sender<String>>>;

/// Bus handle for publishing and subscribing
pub struct ChangeBus {
    queue: mpsc::Sender<String>,
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
    subscriber_capacity: usize,
}

impl ChangeBus {
    /// Create a bus and spawn its fan-out task. The task ends once the
    /// bus is dropped.
    pub fn new(queue_capacity: usize, subscriber_capacity: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity);
        let subscribers: Arc<Registry> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(fan_out(rx, subscribers.clone()));
        Self {
            queue,
            subscribers,
            next_id: AtomicU64::new(0),
            subscriber_capacity,
        }
    }

    /// Announce that `key` changed.
    pub async fn publish(&self, key: &str) {
        // Only fails when the fan-out task is gone, i.e. during teardown.
        let _ = self.queue.send(key.to_string()).await;
    }

    /// Register a new subscriber. Dropping the handle unregisters it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, tx);
        }
        debug!("Change subscriber {} registered", id);
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY, SUBSCRIBER_CAPACITY)
    }
}

async fn fan_out(mut rx: mpsc::Receiver<String>, subscribers: Arc<Registry>) {
    while let Some(key) = rx.recv().await {
        let Ok(mut subscribers) = subscribers.lock() else {
            break;
        };
        subscribers.retain(|id, tx| match tx.try_send(key.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Change subscriber {} is full, dropped {}", id, key);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }
    debug!("Change bus fan-out stopped");
}

/// One subscriber's receive side.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<String>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next changed key. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut subscribers) = registry.lock() {
                subscribers.remove(&self.id);
            }
        }
        debug!("Change subscriber {} removed", self.id);
    }
}

/// Shared change bus wrapped in Arc for thread-safe sharing
pub type SharedBus = Arc<ChangeBus>;

/// Create a new shared change bus
pub fn create_bus() -> SharedBus {
    Arc::new(ChangeBus::default())
}
