//! Observer registry for lifecycle notifications.
//!
//! Two ways to listen:
//! - `subscribe(callback)`: called synchronously on the task that produced the
//!   event. Dropping the returned `Subscription` unregisters the callback.
//! - `events()`: a `broadcast` stream for async consumers. Slow receivers lag
//!   and skip, they never block the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::server::error::ErrorKind;
use crate::server::listen::ListenConfig;
use crate::server::state_machine::ServerState;
use crate::updater::DownloadSnapshot;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    StateChanged {
        state: ServerState,
        error: Option<ErrorKind>,
    },
    Progress(DownloadSnapshot),
    ListenChanged(ListenConfig),
}

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Registry {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }
}

pub struct Notifier {
    registry: Arc<Registry>,
    broadcast: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
            broadcast,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        match self.registry.callbacks.lock() {
            Ok(mut callbacks) => callbacks.push((id, Arc::new(callback))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(callback))),
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<Notification> {
        self.broadcast.subscribe()
    }

    pub fn emit(&self, notification: Notification) {
        // Snapshot the list so callbacks run without the lock held and may
        // themselves subscribe or unsubscribe.
        let callbacks: Vec<Callback> = match self.registry.callbacks.lock() {
            Ok(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, cb)| cb.clone()).collect(),
        };
        for callback in callbacks {
            callback(&notification);
        }
        // No receivers is fine
        let _ = self.broadcast.send(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// Registration handle. Unsubscribes on drop unless `detach`ed.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn cancel(self) {
        drop(self);
    }

    /// Keep the callback registered for the notifier's whole lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
