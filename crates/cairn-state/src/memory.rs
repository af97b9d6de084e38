use std::sync::{Mutex, RwLock};

use tracing::{debug, warn};

use cairn_types::{ItemId, NodeId};

use crate::changelog::ChangeLog;
use crate::error::{StateError, StateResult};
use crate::item::PersistedItem;
use crate::record::ItemTable;
use crate::references::NodeReferences;
use crate::traits::PersistenceManager;

/// In-memory persistence manager.
///
/// Intended for tests and embedding. All records live behind a `RwLock`, so
/// readers see a store either entirely before or entirely after it happens.
pub struct InMemoryPersistenceManager {
    table: RwLock<ItemTable>,
    injected_failure: Mutex<Option<String>>,
}

impl InMemoryPersistenceManager {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(ItemTable::default()),
            injected_failure: Mutex::new(None),
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical serialization of every record, sorted by id. Two managers
    /// holding the same records produce identical bytes.
    pub fn snapshot(&self) -> StateResult<Vec<u8>> {
        let table = self.table.read().expect("lock poisoned");
        serde_json::to_vec(&table.sorted()).map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Make the next `store` fail with a storage error, without applying
    /// anything.
    pub fn fail_next_store(&self, reason: impl Into<String>) {
        *self.injected_failure.lock().expect("lock poisoned") = Some(reason.into());
    }
}

impl Default for InMemoryPersistenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceManager for InMemoryPersistenceManager {
    fn load(&self, id: &ItemId) -> StateResult<Option<PersistedItem>> {
        Ok(self.table.read().expect("lock poisoned").get(id).cloned())
    }

    fn exists(&self, id: &ItemId) -> StateResult<bool> {
        Ok(self.table.read().expect("lock poisoned").contains(id))
    }

    fn load_references(&self, target: &NodeId) -> StateResult<NodeReferences> {
        Ok(self.table.read().expect("lock poisoned").references(target))
    }

    fn store(&self, changes: &ChangeLog) -> StateResult<()> {
        if let Some(reason) = self.injected_failure.lock().expect("lock poisoned").take() {
            warn!(%reason, "injected store failure");
            return Err(StateError::Storage(reason));
        }
        let mut table = self.table.write().expect("lock poisoned");
        let record = table.validate(changes)?;
        table.apply(&record);
        debug!(
            added = record.added.len(),
            modified = record.modified.len(),
            deleted = record.deleted.len(),
            "stored change log"
        );
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryPersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPersistenceManager")
            .field("record_count", &self.len())
            .finish()
    }
}
