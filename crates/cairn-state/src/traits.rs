//! Seams between the state layer and its collaborators.

use cairn_types::{ItemId, NodeId, PropertyId};

use crate::changelog::ChangeLog;
use crate::error::StateResult;
use crate::item::{ItemState, NodeData, PersistedItem, PropertyData};
use crate::references::NodeReferences;

/// Raw record storage for nodes and properties.
///
/// Implementations must satisfy these invariants:
/// - `store` is atomic: every record of the change log is validated first and
///   nothing is applied if any check fails.
/// - A record whose modcount differs from the stored one is a conflict
///   ([`StateError::Stale`](crate::StateError::Stale)).
/// - Strong references never dangle: removing a node that is still strongly
///   referenced, or referencing a missing node, fails with
///   [`StateError::ReferentialIntegrity`](crate::StateError::ReferentialIntegrity).
/// - Readers observe either the state before or after a `store`, never a mix.
pub trait PersistenceManager: Send + Sync {
    /// Load an item record. Returns `Ok(None)` if it does not exist.
    fn load(&self, id: &ItemId) -> StateResult<Option<PersistedItem>>;

    fn exists(&self, id: &ItemId) -> StateResult<bool>;

    /// Strong references pointing at `target`.
    fn load_references(&self, target: &NodeId) -> StateResult<NodeReferences>;

    fn has_references(&self, target: &NodeId) -> StateResult<bool> {
        Ok(self.load_references(target)?.has_references())
    }

    /// Persist a change log as one atomic unit.
    fn store(&self, changes: &ChangeLog) -> StateResult<()>;
}

/// Read access to item states.
pub trait ItemStateManager {
    fn get_item_state(&self, id: &ItemId) -> StateResult<ItemState>;

    fn has_item_state(&self, id: &ItemId) -> StateResult<bool>;

    fn get_node_references(&self, id: &NodeId) -> StateResult<NodeReferences>;

    fn has_node_references(&self, id: &NodeId) -> StateResult<bool> {
        Ok(self.get_node_references(id)?.has_references())
    }

    fn get_node_state(&self, id: &NodeId) -> StateResult<ItemState> {
        self.get_item_state(&ItemId::Node(*id))
    }

    fn get_property_state(&self, id: &PropertyId) -> StateResult<ItemState> {
        self.get_item_state(&ItemId::Property(id.clone()))
    }
}

/// Summary of a successful [`UpdatableItemStateManager::update`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: Vec<ItemId>,
    pub modified: Vec<ItemId>,
    pub removed: Vec<ItemId>,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Every item the update touched.
    pub fn touched(&self) -> impl Iterator<Item = &ItemId> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
    }
}

/// Write access with edit/update/cancel transaction semantics.
pub trait UpdatableItemStateManager: ItemStateManager {
    /// Start an edit epoch. Fails if one is already open.
    fn edit(&mut self) -> StateResult<()>;

    fn in_edit_mode(&self) -> bool;

    /// Create a new node state with status `New`.
    fn create_new_node(&mut self, id: NodeId, data: NodeData) -> StateResult<ItemState>;

    /// Create a new property state with status `New`.
    fn create_new_property(&mut self, id: PropertyId, data: PropertyData)
        -> StateResult<ItemState>;

    /// Record a modified state in the current epoch.
    fn store(&mut self, state: ItemState) -> StateResult<()>;

    /// Record the removal of a state in the current epoch.
    fn destroy(&mut self, state: ItemState) -> StateResult<()>;

    /// Persist every buffered change atomically and end the epoch.
    fn update(&mut self) -> StateResult<UpdateSummary>;

    /// Discard every buffered change. Idempotent.
    fn cancel(&mut self);
}

/// Source of new node identifiers.
pub trait IdFactory: Send + Sync {
    /// A node id that has never been handed out before.
    fn new_node_id(&self) -> NodeId;
}

/// Time-ordered UUID v7 identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdFactory;

impl IdFactory for UuidIdFactory {
    fn new_node_id(&self) -> NodeId {
        NodeId::new()
    }
}
