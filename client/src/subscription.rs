//! Subscription handles for inbound event streams.
//!
//! DESIGN
//! ======
//! A `Subscribers<T>` registry fans values out to every registered
//! subscription whose predicate accepts them. Each `subscribe` returns a
//! `Subscription<T>` handle that owns the receiving end; cancelling or
//! dropping the handle removes the registration, so a closed chat view stops
//! receiving events without any callback bookkeeping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Entry<T> {
    predicate: Predicate<T>,
    tx: mpsc::UnboundedSender<T>,
}

struct Registry<T> {
    next_id: u64,
    entries: HashMap<u64, Entry<T>>,
}

/// Fan-out registry. Clones share the same set of subscribers.
pub struct Subscribers<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry) }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self { registry: Arc::new(Mutex::new(Registry { next_id: 0, entries: HashMap::new() })) }
    }
}

impl<T: Clone + Send + 'static> Subscribers<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in values accepted by `predicate`.
    pub fn subscribe(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.insert(id, Entry { predicate: Box::new(predicate), tx });
        Subscription { rx, registration: Some(Registration { registry: Arc::downgrade(&self.registry), id }) }
    }

    /// Register interest in every value.
    pub fn subscribe_all(&self) -> Subscription<T> {
        self.subscribe(|_| true)
    }

    /// Deliver `value` to every matching subscriber. Returns how many
    /// received it. Subscribers whose receiver is gone are pruned.
    pub fn publish(&self, value: &T) -> usize {
        let mut registry = lock(&self.registry);
        let mut delivered = 0;
        registry.entries.retain(|_, entry| {
            if !(entry.predicate)(value) {
                return !entry.tx.is_closed();
            }
            let sent = entry.tx.send(value.clone()).is_ok();
            if sent {
                delivered += 1;
            }
            sent
        });
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> std::sync::MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct Registration<T> {
    registry: Weak<Mutex<Registry<T>>>,
    id: u64,
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    registration: Option<Registration<T>>,
}

impl<T> Subscription<T> {
    /// Wrap a bare channel, for producers that own their sender directly.
    #[must_use]
    pub fn from_channel(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, registration: None }
    }

    /// Next value, or `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.rx.close();
        let Some(registration) = self.registration.take() else {
            return;
        };
        if let Some(registry) = registration.registry.upgrade() {
            lock(&registry).entries.remove(&registration.id);
        }
    }
}

#[cfg(test)]
#[path = "subscription_test.rs"]
mod tests;
