//! The local state manager: one write transaction's buffered changes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use cairn_types::{well_known, ItemId, Name, NodeId, PropertyId, Value, ValueType};

use crate::changelog::ChangeLog;
use crate::error::{StateError, StateResult};
use crate::item::{ChildNodeEntry, ItemData, ItemState, NodeData, PropertyData};
use crate::nodetype::{EffectiveNodeType, NodeTypeRegistry};
use crate::references::NodeReferences;
use crate::shared::SharedItemStateManager;
use crate::status::Status;
use crate::traits::{IdFactory, ItemStateManager, UpdatableItemStateManager, UpdateSummary};

/// Buffers the changes of one edit epoch on top of the shared view.
///
/// Reads see pending changes first and fall through to the persisted
/// items. A manager is owned by one write transaction at a time; callers
/// that share one across threads must serialize access themselves.
pub struct LocalStateManager {
    shared: SharedItemStateManager,
    id_factory: Arc<dyn IdFactory>,
    node_types: Arc<dyn NodeTypeRegistry>,
    changes: ChangeLog,
    editing: bool,
}

impl LocalStateManager {
    pub fn new(
        shared: SharedItemStateManager,
        id_factory: Arc<dyn IdFactory>,
        node_types: Arc<dyn NodeTypeRegistry>,
    ) -> Self {
        Self {
            shared,
            id_factory,
            node_types,
            changes: ChangeLog::new(),
            editing: false,
        }
    }

    pub fn shared(&self) -> &SharedItemStateManager {
        &self.shared
    }

    pub fn node_types(&self) -> &Arc<dyn NodeTypeRegistry> {
        &self.node_types
    }

    /// Pending changes of the current epoch.
    pub fn changes(&self) -> &ChangeLog {
        &self.changes
    }

    fn ensure_editing(&self) -> StateResult<()> {
        if self.editing {
            Ok(())
        } else {
            Err(StateError::NotEditing)
        }
    }

    /// Parent/child consistency of the pending change set.
    fn validate(&self) -> StateResult<()> {
        for state in self.changes.added_states() {
            match state.data() {
                ItemData::Node(node) => {
                    let (Some(parent_id), ItemId::Node(id)) = (node.parent_id, state.id()) else {
                        continue;
                    };
                    let parent = self.live_node(&parent_id).map_err(|_| {
                        StateError::Inconsistent(format!("parent {parent_id} of new node {id} is gone"))
                    })?;
                    if parent.children.by_id(id).is_none() {
                        return Err(StateError::Inconsistent(format!(
                            "new node {id} is not listed by its parent {parent_id}"
                        )));
                    }
                }
                ItemData::Property(_) => {
                    let ItemId::Property(pid) = state.id() else {
                        continue;
                    };
                    let owner = self.live_node(pid.parent()).map_err(|_| {
                        StateError::Inconsistent(format!("owner of new property {pid} is gone"))
                    })?;
                    if !owner.has_property(pid.name()) {
                        return Err(StateError::Inconsistent(format!(
                            "new property {pid} is not listed by its node"
                        )));
                    }
                }
            }
        }
        for state in self.changes.deleted_states() {
            let ItemId::Node(id) = state.id() else {
                continue;
            };
            let Some(parent_id) = state.parent_id() else {
                return Err(StateError::Inconsistent("the root node cannot be removed".into()));
            };
            if let Ok(parent) = self.live_node(&parent_id) {
                if parent.children.by_id(id).is_some() {
                    return Err(StateError::Inconsistent(format!(
                        "removed node {id} is still listed by its parent {parent_id}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Node data as it will look after this epoch.
    fn live_node(&self, id: &NodeId) -> StateResult<NodeData> {
        Ok(self.get_node_state(id)?.node()?.clone())
    }

    // -- node-level helpers -------------------------------------------------

    /// The effective node type of a node.
    pub fn effective_node_type(&self, id: &NodeId) -> StateResult<EffectiveNodeType> {
        let state = self.get_node_state(id)?;
        let node = state.node()?;
        self.node_types
            .effective_node_type(&node.primary_type, &node.mixins)
    }

    pub fn node_data(&self, id: &NodeId) -> StateResult<NodeData> {
        self.live_node(id)
    }

    /// Add a child node. Referenceable nodes get their `jcr:uuid` set.
    pub fn add_node(
        &mut self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        id: Option<NodeId>,
    ) -> StateResult<NodeId> {
        self.ensure_editing()?;
        let ent = self
            .node_types
            .effective_node_type(&primary_type, &BTreeSet::new())?;
        let id = id.unwrap_or_else(|| self.id_factory.new_node_id());

        let mut parent_state = self.get_node_state(parent)?;
        parent_state.node_mut()?.children.add(name.clone(), id);
        self.store(parent_state)?;

        self.create_new_node(id, NodeData::new(Some(*parent), name, primary_type))?;
        if ent.includes(&well_known::MIX_REFERENCEABLE) {
            self.set_property(&id, well_known::JCR_UUID, Value::String(id.to_string()))?;
        }
        Ok(id)
    }

    /// Add a mixin type. Returns `false` if the node already had it.
    pub fn add_mixin(&mut self, id: &NodeId, mixin: Name) -> StateResult<bool> {
        self.ensure_editing()?;
        let mut state = self.get_node_state(id)?;
        let node = state.node_mut()?;
        if !node.mixins.insert(mixin) {
            return Ok(false);
        }
        let ent = self
            .node_types
            .effective_node_type(&node.primary_type, &node.mixins)?;
        let mixins: Vec<Value> = node.mixins.iter().cloned().map(Value::Name).collect();
        let has_uuid = node.has_property(&well_known::JCR_UUID);
        self.store(state)?;
        self.set_property_values(id, well_known::JCR_MIXIN_TYPES, ValueType::Name, mixins)?;
        if ent.includes(&well_known::MIX_REFERENCEABLE) && !has_uuid {
            self.set_property(id, well_known::JCR_UUID, Value::String(id.to_string()))?;
        }
        Ok(true)
    }

    /// Remove a node with all of its properties and descendants.
    pub fn remove_node(&mut self, id: &NodeId) -> StateResult<()> {
        self.ensure_editing()?;
        let state = self.get_node_state(id)?;
        let parent_id = state.parent_id().ok_or_else(|| {
            StateError::Inconsistent("the root node cannot be removed".into())
        })?;
        if let Ok(mut parent) = self.get_node_state(&parent_id) {
            if parent.node_mut()?.children.remove_by_id(id).is_some() {
                self.store(parent)?;
            }
        }
        self.remove_subtree(state)
    }

    fn remove_subtree(&mut self, state: ItemState) -> StateResult<()> {
        let id = state.node_id()?;
        let node = state.node()?.clone();
        for child in node.children.ids() {
            let child = self.get_node_state(&child)?;
            self.remove_subtree(child)?;
        }
        for name in &node.property_names {
            let prop = self.get_property_state(&PropertyId::new(id, name.clone()))?;
            self.destroy(prop)?;
        }
        self.destroy(state)
    }

    /// Set a single-valued property, creating it if needed.
    pub fn set_property(&mut self, node: &NodeId, name: Name, value: Value) -> StateResult<()> {
        self.put_property(node, name, PropertyData::single(value))
    }

    /// Set a multi-valued property, creating it if needed.
    pub fn set_property_values(
        &mut self,
        node: &NodeId,
        name: Name,
        value_type: ValueType,
        values: Vec<Value>,
    ) -> StateResult<()> {
        if let Some(bad) = values.iter().find(|v| v.value_type() != value_type) {
            bad.expect_type(value_type)?;
        }
        self.put_property(node, name, PropertyData::multi(value_type, values))
    }

    fn put_property(&mut self, node: &NodeId, name: Name, data: PropertyData) -> StateResult<()> {
        self.ensure_editing()?;
        let pid = PropertyId::new(*node, name.clone());
        let mut owner = self.get_node_state(node)?;
        if owner.node()?.has_property(&name) {
            let mut prop = self.get_property_state(&pid)?;
            *prop.property_mut()? = data;
            self.store(prop)
        } else {
            owner.node_mut()?.property_names.insert(name);
            self.store(owner)?;
            self.create_new_property(pid, data).map(|_| ())
        }
    }

    /// Remove a property. Returns `false` if it did not exist.
    pub fn remove_property(&mut self, node: &NodeId, name: &Name) -> StateResult<bool> {
        self.ensure_editing()?;
        let mut owner = self.get_node_state(node)?;
        if !owner.node_mut()?.property_names.remove(name) {
            return Ok(false);
        }
        self.store(owner)?;
        let prop = self.get_property_state(&PropertyId::new(*node, name.clone()))?;
        self.destroy(prop)?;
        Ok(true)
    }

    /// Property data, or `None` if the node has no such property.
    pub fn property(&self, node: &NodeId, name: &Name) -> StateResult<Option<PropertyData>> {
        if !self.get_node_state(node)?.node()?.has_property(name) {
            return Ok(None);
        }
        let state = self.get_property_state(&PropertyId::new(*node, name.clone()))?;
        Ok(Some(state.property()?.clone()))
    }

    /// All values of a property; empty if it does not exist.
    pub fn property_values(&self, node: &NodeId, name: &Name) -> StateResult<Vec<Value>> {
        Ok(self
            .property(node, name)?
            .map(|p| p.values)
            .unwrap_or_default())
    }

    /// The first value of a property.
    pub fn property_value(&self, node: &NodeId, name: &Name) -> StateResult<Option<Value>> {
        Ok(self.property_values(node, name)?.into_iter().next())
    }

    pub fn child_node_id(&self, node: &NodeId, name: &Name, index: u32) -> StateResult<Option<NodeId>> {
        Ok(self
            .get_node_state(node)?
            .node()?
            .children
            .get(name, index)
            .map(|e| e.id))
    }

    pub fn child_entries(&self, node: &NodeId) -> StateResult<Vec<ChildNodeEntry>> {
        Ok(self.get_node_state(node)?.node()?.children.iter().collect())
    }
}

impl ItemStateManager for LocalStateManager {
    fn get_item_state(&self, id: &ItemId) -> StateResult<ItemState> {
        if let Some(state) = self.changes.get(id) {
            return Ok(state.clone());
        }
        if self.changes.is_deleted(id) {
            return Err(StateError::NotFound(id.clone()));
        }
        self.shared.get_item_state(id)
    }

    fn has_item_state(&self, id: &ItemId) -> StateResult<bool> {
        if self.changes.get(id).is_some() {
            return Ok(true);
        }
        if self.changes.is_deleted(id) {
            return Ok(false);
        }
        self.shared.has_item_state(id)
    }

    fn get_node_references(&self, id: &NodeId) -> StateResult<NodeReferences> {
        self.shared.get_node_references(id)
    }
}

impl UpdatableItemStateManager for LocalStateManager {
    fn edit(&mut self) -> StateResult<()> {
        if self.editing {
            return Err(StateError::AlreadyEditing);
        }
        self.editing = true;
        debug!("edit epoch started");
        Ok(())
    }

    fn in_edit_mode(&self) -> bool {
        self.editing
    }

    fn create_new_node(&mut self, id: NodeId, data: NodeData) -> StateResult<ItemState> {
        self.ensure_editing()?;
        let item_id = ItemId::Node(id);
        if self.has_item_state(&item_id)? {
            return Err(StateError::ItemExists(item_id));
        }
        let state = ItemState::new_node(id, data, Status::New);
        self.changes.added(state.clone());
        Ok(state)
    }

    fn create_new_property(
        &mut self,
        id: PropertyId,
        data: PropertyData,
    ) -> StateResult<ItemState> {
        self.ensure_editing()?;
        let item_id = ItemId::Property(id.clone());
        if self.has_item_state(&item_id)? {
            return Err(StateError::ItemExists(item_id));
        }
        let state = ItemState::new_property(id, data, Status::New);
        self.changes.added(state.clone());
        Ok(state)
    }

    fn store(&mut self, mut state: ItemState) -> StateResult<()> {
        self.ensure_editing()?;
        state.mark_modified()?;
        self.changes.modified(state);
        Ok(())
    }

    fn destroy(&mut self, mut state: ItemState) -> StateResult<()> {
        self.ensure_editing()?;
        match state.status() {
            Status::New => {
                state.set_status(Status::Removed);
                self.changes.deleted(state);
            }
            Status::Existing | Status::ExistingModified => {
                state.set_status(Status::ExistingRemoved);
                self.changes.deleted(state);
            }
            Status::ExistingRemoved => {}
            Status::StaleModified | Status::StaleDestroyed => {
                return Err(StateError::Stale {
                    id: state.id().clone(),
                    reason: "refresh before removing".into(),
                })
            }
            Status::Removed => return Err(StateError::Removed(state.id().clone())),
            status => {
                return Err(StateError::IllegalModification {
                    id: state.id().clone(),
                    status,
                })
            }
        }
        Ok(())
    }

    fn update(&mut self) -> StateResult<UpdateSummary> {
        self.ensure_editing()?;
        if self.changes.is_empty() {
            self.editing = false;
            debug!("edit epoch ended without changes");
            return Ok(UpdateSummary::default());
        }
        if let Err(e) = self.validate() {
            warn!(error = %e, "change set rejected");
            return Err(e);
        }
        match self.shared.commit(&mut self.changes) {
            Ok(persisted) => {
                self.editing = false;
                let summary = UpdateSummary {
                    added: persisted.added.iter().map(|s| s.id().clone()).collect(),
                    modified: persisted.modified.iter().map(|s| s.id().clone()).collect(),
                    removed: persisted.deleted.iter().map(|s| s.id().clone()).collect(),
                };
                debug!(
                    added = summary.added.len(),
                    modified = summary.modified.len(),
                    removed = summary.removed.len(),
                    "edit epoch updated"
                );
                Ok(summary)
            }
            Err(e) => {
                if let StateError::Stale { id, .. } = &e {
                    let destroyed = !self.shared.has_item_state(id).unwrap_or(false);
                    self.changes.mark_stale(id, destroyed);
                }
                warn!(error = %e, "update failed; epoch left open for cancel");
                Err(e)
            }
        }
    }

    fn cancel(&mut self) {
        if !self.editing && self.changes.is_empty() {
            return;
        }
        let discarded = self.changes.undo();
        self.shared.discarded(&discarded);
        self.editing = false;
        debug!(discarded = discarded.len(), "edit epoch cancelled");
    }
}

impl std::fmt::Debug for LocalStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStateManager")
            .field("editing", &self.editing)
            .field("pending", &self.changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPersistenceManager;
    use crate::nodetype::InMemoryNodeTypeRegistry;
    use crate::traits::{PersistenceManager, UuidIdFactory};

    struct Fixture {
        pm: Arc<InMemoryPersistenceManager>,
        root: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            let pm = Arc::new(InMemoryPersistenceManager::new());
            let root = NodeId::new();
            let mut log = ChangeLog::new();
            log.added(ItemState::new_node(
                root,
                NodeData::new(None, well_known::ROOT, well_known::REP_ROOT),
                Status::New,
            ));
            pm.store(&log).unwrap();
            Self { pm, root }
        }

        fn manager(&self) -> LocalStateManager {
            LocalStateManager::new(
                SharedItemStateManager::new(self.pm.clone()),
                Arc::new(UuidIdFactory),
                Arc::new(InMemoryNodeTypeRegistry::new()),
            )
        }
    }

    fn name(s: &str) -> Name {
        Name::local(s).unwrap()
    }

    #[test]
    fn edit_twice_fails() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        assert!(matches!(lsm.edit(), Err(StateError::AlreadyEditing)));
    }

    #[test]
    fn mutations_require_edit_mode() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        assert!(matches!(
            lsm.add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None),
            Err(StateError::NotEditing)
        ));
        assert!(matches!(lsm.update(), Err(StateError::NotEditing)));
    }

    #[test]
    fn update_persists_and_transitions() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let a = lsm
            .add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        lsm.set_property(&a, name("title"), Value::from("hello")).unwrap();
        assert_eq!(lsm.get_node_state(&a).unwrap().status(), Status::New);
        assert!(!fx.pm.exists(&ItemId::Node(a)).unwrap());

        let summary = lsm.update().unwrap();
        assert!(!lsm.in_edit_mode());
        assert_eq!(summary.added.len(), 2);
        assert_eq!(summary.modified, vec![ItemId::Node(fx.root)]);
        assert!(fx.pm.exists(&ItemId::Node(a)).unwrap());
        assert_eq!(
            lsm.property_value(&a, &name("title")).unwrap(),
            Some(Value::from("hello"))
        );
        assert_eq!(lsm.child_node_id(&fx.root, &name("a"), 1).unwrap(), Some(a));
    }

    #[test]
    fn failed_update_then_cancel_leaves_storage_untouched() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let a = lsm
            .add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        lsm.update().unwrap();

        let before = fx.pm.snapshot().unwrap();
        lsm.edit().unwrap();
        lsm.set_property(&a, name("x"), Value::Long(1)).unwrap();
        lsm.add_node(&a, name("b"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        lsm.remove_node(&a).unwrap();
        fx.pm.fail_next_store("injected");
        assert!(matches!(lsm.update(), Err(StateError::Storage(_))));
        assert!(lsm.in_edit_mode());
        lsm.cancel();
        assert!(!lsm.in_edit_mode());
        assert_eq!(fx.pm.snapshot().unwrap(), before);
        assert!(lsm.has_item_state(&ItemId::Node(a)).unwrap());

        lsm.cancel();
    }

    #[test]
    fn concurrent_modification_marks_stale() {
        let fx = Fixture::new();
        let mut first = fx.manager();
        let mut second = fx.manager();

        first.edit().unwrap();
        second.edit().unwrap();
        first
            .add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        second
            .add_node(&fx.root, name("b"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        first.update().unwrap();

        let err = second.update().unwrap_err();
        assert!(matches!(err, StateError::Stale { .. }));
        assert_eq!(
            second.changes().get(&ItemId::Node(fx.root)).unwrap().status(),
            Status::StaleModified
        );
        second.cancel();
        assert!(!second.in_edit_mode());
        assert!(second.changes().is_empty());
    }

    #[test]
    fn remove_node_is_recursive() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let a = lsm
            .add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        let b = lsm
            .add_node(&a, name("b"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        lsm.set_property(&b, name("p"), Value::Boolean(true)).unwrap();
        lsm.update().unwrap();

        lsm.edit().unwrap();
        lsm.remove_node(&a).unwrap();
        let summary = lsm.update().unwrap();
        assert_eq!(summary.removed.len(), 3);
        assert!(!fx.pm.exists(&ItemId::Node(b)).unwrap());
        assert!(lsm.child_entries(&fx.root).unwrap().is_empty());
    }

    #[test]
    fn referenceable_nodes_get_uuid() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let a = lsm
            .add_node(&fx.root, name("a"), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        assert!(lsm.get_node_state(&a).unwrap().unique_id().is_none());
        assert!(lsm.add_mixin(&a, well_known::MIX_VERSIONABLE).unwrap());
        assert!(!lsm.add_mixin(&a, well_known::MIX_VERSIONABLE).unwrap());
        assert_eq!(lsm.get_node_state(&a).unwrap().unique_id(), Some(a));
        assert!(lsm
            .effective_node_type(&a)
            .unwrap()
            .includes(&well_known::MIX_REFERENCEABLE));
        lsm.update().unwrap();
    }

    #[test]
    fn remove_property_and_multi_values() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let tags = name("tags");
        lsm.set_property_values(
            &fx.root,
            tags.clone(),
            ValueType::String,
            vec![Value::from("a"), Value::from("b")],
        )
        .unwrap();
        assert!(lsm
            .set_property_values(&fx.root, name("bad"), ValueType::Long, vec![Value::from("x")])
            .is_err());
        assert_eq!(lsm.property_values(&fx.root, &tags).unwrap().len(), 2);
        lsm.update().unwrap();

        lsm.edit().unwrap();
        assert!(lsm.remove_property(&fx.root, &tags).unwrap());
        assert!(!lsm.remove_property(&fx.root, &tags).unwrap());
        lsm.update().unwrap();
        assert!(lsm.property(&fx.root, &tags).unwrap().is_none());
    }

    #[test]
    fn dangling_child_entry_is_inconsistent() {
        let fx = Fixture::new();
        let mut lsm = fx.manager();
        lsm.edit().unwrap();
        let orphan = NodeId::new();
        lsm.create_new_node(
            orphan,
            NodeData::new(Some(fx.root), name("orphan"), well_known::NT_UNSTRUCTURED),
        )
        .unwrap();
        assert!(matches!(lsm.update(), Err(StateError::Inconsistent(_))));
        lsm.cancel();
    }
}
