//! In-memory item states.
//!
//! An [`ItemState`] is the working copy of one node or property: its data,
//! its lifecycle [`Status`], the persisted modification count it was read
//! at, and the listeners interested in its status changes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_types::{well_known, ItemId, Name, NodeId, PropertyId, Value, ValueType};

use crate::error::{StateError, StateResult};
use crate::listener::{ListenerHandle, StatusListener, StatusListeners};
use crate::status::Status;

/// One child node entry as seen from its parent, with its computed
/// same-name-sibling index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChildNodeEntry {
    pub name: Name,
    pub index: u32,
    pub id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct RawChild {
    name: Name,
    id: NodeId,
}

/// Ordered list of child node entries. Same-name siblings get 1-based
/// indices in document order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildNodeEntries {
    entries: Vec<RawChild>,
}

impl ChildNodeEntries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; returns it with its computed index.
    pub fn add(&mut self, name: Name, id: NodeId) -> ChildNodeEntry {
        let index = self.entries.iter().filter(|e| e.name == name).count() as u32 + 1;
        self.entries.push(RawChild {
            name: name.clone(),
            id,
        });
        ChildNodeEntry { name, index, id }
    }

    /// All entries in order, with indices.
    pub fn iter(&self) -> impl Iterator<Item = ChildNodeEntry> + '_ {
        let mut seen: HashMap<&Name, u32> = HashMap::new();
        self.entries.iter().map(move |raw| {
            let index = seen.entry(&raw.name).or_insert(0);
            *index += 1;
            ChildNodeEntry {
                name: raw.name.clone(),
                index: *index,
                id: raw.id,
            }
        })
    }

    pub fn get(&self, name: &Name, index: u32) -> Option<ChildNodeEntry> {
        let raw = self
            .entries
            .iter()
            .filter(|e| &e.name == name)
            .nth(index.checked_sub(1)? as usize)?;
        Some(ChildNodeEntry {
            name: raw.name.clone(),
            index,
            id: raw.id,
        })
    }

    pub fn by_id(&self, id: &NodeId) -> Option<ChildNodeEntry> {
        let pos = self.entries.iter().position(|e| &e.id == id)?;
        let raw = &self.entries[pos];
        let index = self.entries[..pos].iter().filter(|e| e.name == raw.name).count() as u32 + 1;
        Some(ChildNodeEntry {
            name: raw.name.clone(),
            index,
            id: raw.id,
        })
    }

    pub fn named(&self, name: &Name) -> Vec<ChildNodeEntry> {
        self.iter().filter(|e| &e.name == name).collect()
    }

    pub fn contains_name(&self, name: &Name) -> bool {
        self.entries.iter().any(|e| &e.name == name)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn remove(&mut self, name: &Name, index: u32) -> Option<ChildNodeEntry> {
        let entry = self.get(name, index)?;
        self.remove_by_id(&entry.id)
    }

    pub fn remove_by_id(&mut self, id: &NodeId) -> Option<ChildNodeEntry> {
        let entry = self.by_id(id)?;
        self.entries.retain(|e| &e.id != id);
        Some(entry)
    }

    /// Move `id` directly before `before`, or to the end when `before` is
    /// `None`. Returns `false` if either entry is unknown.
    pub fn reorder(&mut self, id: &NodeId, before: Option<&NodeId>) -> bool {
        let Some(from) = self.entries.iter().position(|e| &e.id == id) else {
            return false;
        };
        if before.is_some_and(|b| !self.entries.iter().any(|e| &e.id == b)) {
            return false;
        }
        let moved = self.entries.remove(from);
        match before {
            Some(b) => {
                let to = self
                    .entries
                    .iter()
                    .position(|e| &e.id == b)
                    .unwrap_or(self.entries.len());
                self.entries.insert(to, moved);
            }
            None => self.entries.push(moved),
        }
        true
    }
}

/// Node data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// `None` only for the repository root.
    pub parent_id: Option<NodeId>,
    pub name: Name,
    pub primary_type: Name,
    pub mixins: BTreeSet<Name>,
    pub property_names: BTreeSet<Name>,
    pub children: ChildNodeEntries,
}

impl NodeData {
    pub fn new(parent_id: Option<NodeId>, name: Name, primary_type: Name) -> Self {
        Self {
            parent_id,
            name,
            primary_type,
            mixins: BTreeSet::new(),
            property_names: BTreeSet::new(),
            children: ChildNodeEntries::new(),
        }
    }

    pub fn has_property(&self, name: &Name) -> bool {
        self.property_names.contains(name)
    }
}

/// Property data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyData {
    pub value_type: ValueType,
    pub multi_valued: bool,
    pub values: Vec<Value>,
}

impl PropertyData {
    pub fn single(value: Value) -> Self {
        Self {
            value_type: value.value_type(),
            multi_valued: false,
            values: vec![value],
        }
    }

    pub fn multi(value_type: ValueType, values: Vec<Value>) -> Self {
        Self {
            value_type,
            multi_valued: true,
            values,
        }
    }

    /// The first value, if any.
    pub fn value(&self) -> Option<&Value> {
        self.values.first()
    }

    /// Targets of strong references held by this property.
    pub fn strong_references(&self) -> impl Iterator<Item = &NodeId> {
        self.values.iter().filter_map(Value::strong_reference)
    }
}

/// Data of either item kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ItemData {
    Node(NodeData),
    Property(PropertyData),
}

/// The record a persistence backend stores for one item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedItem {
    pub data: ItemData,
    /// Incremented on every persisted modification.
    pub modcount: u64,
}

/// In-memory state of one repository item.
///
/// Clones are snapshots of the same logical item and share its listener set.
#[derive(Clone, Debug)]
pub struct ItemState {
    id: ItemId,
    status: Status,
    data: ItemData,
    modcount: u64,
    listeners: StatusListeners,
}

impl ItemState {
    pub fn new_node(id: NodeId, data: NodeData, status: Status) -> Self {
        Self {
            id: ItemId::Node(id),
            status,
            data: ItemData::Node(data),
            modcount: 0,
            listeners: StatusListeners::new(),
        }
    }

    pub fn new_property(id: PropertyId, data: PropertyData, status: Status) -> Self {
        Self {
            id: ItemId::Property(id),
            status,
            data: ItemData::Property(data),
            modcount: 0,
            listeners: StatusListeners::new(),
        }
    }

    /// Build an `Existing` state from a persisted record.
    pub fn from_persisted(id: ItemId, record: PersistedItem) -> StateResult<Self> {
        let expected = match (&id, &record.data) {
            (ItemId::Node(_), ItemData::Property(_)) => Some("node"),
            (ItemId::Property(_), ItemData::Node(_)) => Some("property"),
            _ => None,
        };
        if let Some(expected) = expected {
            return Err(StateError::WrongItemKind { id, expected });
        }
        Ok(Self {
            id,
            status: Status::Existing,
            data: record.data,
            modcount: record.modcount,
            listeners: StatusListeners::new(),
        })
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn is_node(&self) -> bool {
        self.id.is_node()
    }

    /// The node id of a node state.
    pub fn node_id(&self) -> StateResult<NodeId> {
        self.id
            .as_node()
            .copied()
            .ok_or_else(|| StateError::WrongItemKind {
                id: self.id.clone(),
                expected: "node",
            })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn modcount(&self) -> u64 {
        self.modcount
    }

    pub fn data(&self) -> &ItemData {
        &self.data
    }

    pub fn node(&self) -> StateResult<&NodeData> {
        match &self.data {
            ItemData::Node(node) => Ok(node),
            ItemData::Property(_) => Err(StateError::WrongItemKind {
                id: self.id.clone(),
                expected: "node",
            }),
        }
    }

    pub fn node_mut(&mut self) -> StateResult<&mut NodeData> {
        match &mut self.data {
            ItemData::Node(node) => Ok(node),
            ItemData::Property(_) => Err(StateError::WrongItemKind {
                id: self.id.clone(),
                expected: "node",
            }),
        }
    }

    pub fn property(&self) -> StateResult<&PropertyData> {
        match &self.data {
            ItemData::Property(prop) => Ok(prop),
            ItemData::Node(_) => Err(StateError::WrongItemKind {
                id: self.id.clone(),
                expected: "property",
            }),
        }
    }

    pub fn property_mut(&mut self) -> StateResult<&mut PropertyData> {
        match &mut self.data {
            ItemData::Property(prop) => Ok(prop),
            ItemData::Node(_) => Err(StateError::WrongItemKind {
                id: self.id.clone(),
                expected: "property",
            }),
        }
    }

    /// Parent node: the node's parent, or the property's owner.
    pub fn parent_id(&self) -> Option<NodeId> {
        match (&self.id, &self.data) {
            (ItemId::Property(id), _) => Some(*id.parent()),
            (_, ItemData::Node(node)) => node.parent_id,
            _ => None,
        }
    }

    /// The referenceable identifier of a node carrying `jcr:uuid`.
    pub fn unique_id(&self) -> Option<NodeId> {
        match (&self.id, &self.data) {
            (ItemId::Node(id), ItemData::Node(node))
                if node.has_property(&well_known::JCR_UUID) =>
            {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Register a status listener.
    pub fn add_listener(&self, listener: Arc<dyn StatusListener>) -> ListenerHandle {
        self.listeners.subscribe(listener)
    }

    pub fn listeners(&self) -> &StatusListeners {
        &self.listeners
    }

    /// Change the status and notify listeners synchronously, in order.
    ///
    /// # Panics
    ///
    /// On any transition the status table forbids, including every
    /// transition out of [`Status::Removed`].
    pub fn set_status(&mut self, next: Status) {
        let previous = self.status;
        assert!(
            previous.can_transition_to(next),
            "illegal status transition {previous} -> {next} for item {}",
            self.id
        );
        self.status = next;
        for listener in self.listeners.snapshot() {
            listener.status_changed(self, previous);
        }
    }

    /// `Existing` becomes `Invalidated`; any other status is left alone.
    pub fn invalidate(&mut self) {
        if self.status == Status::Existing {
            self.set_status(Status::Invalidated);
        }
    }

    /// Flag pending local modification.
    pub fn mark_modified(&mut self) -> StateResult<()> {
        match self.status {
            Status::Existing => {
                self.set_status(Status::ExistingModified);
                Ok(())
            }
            Status::ExistingModified | Status::New => Ok(()),
            Status::StaleModified | Status::StaleDestroyed => Err(StateError::Stale {
                id: self.id.clone(),
                reason: "refresh before modifying".into(),
            }),
            Status::Removed | Status::ExistingRemoved => Err(StateError::Removed(self.id.clone())),
            status => Err(StateError::IllegalModification {
                id: self.id.clone(),
                status,
            }),
        }
    }

    /// Fan out an externally caused change: `Existing -> Modified -> Existing`.
    pub fn notify_external_change(&mut self) {
        if self.status == Status::Existing {
            self.set_status(Status::Modified);
            self.set_status(Status::Existing);
        }
    }

    /// Replace data and modcount with freshly loaded values.
    pub fn refresh_from(&mut self, record: PersistedItem) {
        self.data = record.data;
        self.modcount = record.modcount;
    }

    pub(crate) fn set_modcount(&mut self, modcount: u64) {
        self.modcount = modcount;
    }

    pub fn to_persisted(&self) -> PersistedItem {
        PersistedItem {
            data: self.data.clone(),
            modcount: self.modcount,
        }
    }
}
