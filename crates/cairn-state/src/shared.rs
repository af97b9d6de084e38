//! Read-only view of the persisted items, shared by every local manager.

use std::sync::Arc;

use tracing::debug;

use cairn_types::{ItemId, NodeId};

use crate::changelog::{ChangeLog, PersistedChanges};
use crate::error::{StateError, StateResult};
use crate::item::ItemState;
use crate::listener::{ItemStateObserver, ObserverHandle, StateObservers};
use crate::references::NodeReferences;
use crate::traits::{ItemStateManager, PersistenceManager};

/// The committed view of a repository's items.
///
/// Every state it hands out is a fresh `Existing` snapshot. Writes only
/// happen through [`commit`](Self::commit), which local managers call from
/// their `update`. Clones share the persistence manager and observer set.
#[derive(Clone)]
pub struct SharedItemStateManager {
    persistence: Arc<dyn PersistenceManager>,
    observers: StateObservers,
}

impl SharedItemStateManager {
    pub fn new(persistence: Arc<dyn PersistenceManager>) -> Self {
        Self {
            persistence,
            observers: StateObservers::new(),
        }
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceManager> {
        &self.persistence
    }

    /// Register an observer for committed and discarded changes.
    pub fn observe(&self, observer: Arc<dyn ItemStateObserver>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    /// Persist a change log, transition its states and notify observers.
    ///
    /// Nothing is transitioned when the store fails.
    pub fn commit(&self, changes: &mut ChangeLog) -> StateResult<PersistedChanges> {
        self.persistence.store(changes)?;
        let persisted = changes.persisted();
        let observers = self.observers.snapshot();
        for observer in &observers {
            for state in &persisted.added {
                observer.created(state);
            }
            for state in &persisted.modified {
                observer.updated(state);
            }
            for state in &persisted.deleted {
                observer.destroyed(state);
            }
        }
        debug!(
            added = persisted.added.len(),
            modified = persisted.modified.len(),
            deleted = persisted.deleted.len(),
            "change log committed"
        );
        Ok(persisted)
    }

    /// Tell observers that pending changes to these states were dropped.
    pub fn discarded(&self, states: &[ItemState]) {
        for observer in self.observers.snapshot() {
            for state in states {
                observer.discarded(state);
            }
        }
    }
}

impl ItemStateManager for SharedItemStateManager {
    fn get_item_state(&self, id: &ItemId) -> StateResult<ItemState> {
        let record = self
            .persistence
            .load(id)?
            .ok_or_else(|| StateError::NotFound(id.clone()))?;
        ItemState::from_persisted(id.clone(), record)
    }

    fn has_item_state(&self, id: &ItemId) -> StateResult<bool> {
        self.persistence.exists(id)
    }

    fn get_node_references(&self, id: &NodeId) -> StateResult<NodeReferences> {
        self.persistence.load_references(id)
    }

    fn has_node_references(&self, id: &NodeId) -> StateResult<bool> {
        self.persistence.has_references(id)
    }
}

impl std::fmt::Debug for SharedItemStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedItemStateManager")
            .field("observers", &self.observers.len())
            .finish()
    }
}
