//! Listener registration with explicit, revocable handles.
//!
//! A [`Registry`] holds strong references to its listeners. Registration
//! returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::revoke`]) removes the listener. Notification snapshots
//! the listener list first, so listeners may register or revoke from inside
//! a callback without deadlocking.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::item::ItemState;
use crate::status::Status;

/// Receives every status change of the item states it is registered on.
pub trait StatusListener: Send + Sync {
    fn status_changed(&self, state: &ItemState, previous: Status);
}

/// Receives lifecycle events from a state manager or state factory.
///
/// All methods default to no-ops.
pub trait ItemStateObserver: Send + Sync {
    /// A state was created, either locally or from persisted data.
    fn created(&self, _state: &ItemState) {}
    /// An existing state was refreshed or its modification was persisted.
    fn updated(&self, _state: &ItemState) {}
    /// A state was destroyed and the destruction persisted.
    fn destroyed(&self, _state: &ItemState) {}
    /// Pending changes to a state were discarded.
    fn discarded(&self, _state: &ItemState) {}
}

struct Inner<L: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<L>)>,
}

/// An ordered set of listeners.
pub struct Registry<L: ?Sized> {
    inner: Arc<Mutex<Inner<L>>>,
}

impl<L: ?Sized> Registry<L> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered while the returned
    /// subscription is alive.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: Arc<L>) -> Subscription<L> {
        let mut inner = self.inner.lock().expect("listener registry lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, listener));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("listener registry lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The listeners in registration order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner
            .lock()
            .expect("listener registry lock poisoned")
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

impl<L: ?Sized> Clone for Registry<L> {
    /// Clones share the same listener set.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: ?Sized> Default for Registry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> fmt::Debug for Registry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Handle for a registered listener.
pub struct Subscription<L: ?Sized> {
    id: u64,
    registry: Weak<Mutex<Inner<L>>>,
}

impl<L: ?Sized> Subscription<L> {
    /// Unregister now.
    pub fn revoke(self) {}

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|inner| {
            inner
                .lock()
                .expect("listener registry lock poisoned")
                .entries
                .iter()
                .any(|(id, _)| *id == self.id)
        })
    }
}

impl<L: ?Sized> Drop for Subscription<L> {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Ok(mut inner) = inner.lock() {
                inner.entries.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl<L: ?Sized> fmt::Debug for Subscription<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Listener set attached to an item state.
pub type StatusListeners = Registry<dyn StatusListener>;

/// Handle returned when registering a [`StatusListener`].
pub type ListenerHandle = Subscription<dyn StatusListener>;

/// Observer set of a state manager or factory.
pub type StateObservers = Registry<dyn ItemStateObserver>;

/// Handle returned when registering an [`ItemStateObserver`].
pub type ObserverHandle = Subscription<dyn ItemStateObserver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ItemStateObserver for Counter {
        fn created(&self, _state: &ItemState) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn subscription_drop_unregisters() {
        let registry = StateObservers::new();
        let handle = registry.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        assert_eq!(registry.len(), 1);
        assert!(handle.is_active());
        drop(handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn revoke_unregisters() {
        let registry = StateObservers::new();
        let a = registry.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        let _b = registry.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        a.revoke();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clones_share_listeners() {
        let registry = StateObservers::new();
        let clone = registry.clone();
        let _h = clone.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry = StateObservers::new();
        let handle = registry.subscribe(Arc::new(Counter(AtomicUsize::new(0))));
        drop(registry);
        assert!(!handle.is_active());
        drop(handle);
    }
}
