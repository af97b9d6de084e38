//! Read-only snapshots of version storage nodes.
//!
//! Each entity is loaded from item states in one go and does not track later
//! changes. Entities can be loaded through any [`ItemStateManager`], so the
//! same code serves committed reads and reads inside a write epoch.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use cairn_state::{
    ChildNodeEntry, ItemStateManager, NodeData, NodeTypeRegistry, PropertyData, StateError,
};
use cairn_types::{well_known, Name, NodeId, PropertyId, Value};

use crate::error::{VersionError, VersionResult};

pub(crate) fn load_node<S>(states: &S, id: &NodeId) -> VersionResult<NodeData>
where
    S: ItemStateManager + ?Sized,
{
    match states.get_node_state(id) {
        Ok(state) => Ok(state.node()?.clone()),
        Err(StateError::NotFound(_)) => Err(VersionError::NotFound(*id)),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn load_property<S>(
    states: &S,
    id: &NodeId,
    data: &NodeData,
    name: &Name,
) -> VersionResult<Option<PropertyData>>
where
    S: ItemStateManager + ?Sized,
{
    if !data.has_property(name) {
        return Ok(None);
    }
    let state = states.get_property_state(&PropertyId::new(*id, name.clone()))?;
    Ok(Some(state.property()?.clone()))
}

pub(crate) fn load_values<S>(
    states: &S,
    id: &NodeId,
    data: &NodeData,
    name: &Name,
) -> VersionResult<Vec<Value>>
where
    S: ItemStateManager + ?Sized,
{
    Ok(load_property(states, id, data, name)?
        .map(|p| p.values)
        .unwrap_or_default())
}

pub(crate) fn node_ids(values: &[Value]) -> Vec<NodeId> {
    values.iter().filter_map(Value::as_node_id).copied().collect()
}

fn expect_type(id: &NodeId, data: &NodeData, node_type: &Name, expected: &'static str) -> VersionResult<()> {
    if &data.primary_type == node_type {
        Ok(())
    } else {
        Err(VersionError::WrongItemType { id: *id, expected })
    }
}

fn required_child(id: &NodeId, data: &NodeData, name: &Name) -> VersionResult<NodeId> {
    data.children
        .get(name, 1)
        .map(|e| e.id)
        .ok_or_else(|| VersionError::inconsistent(format!("{id} has no {name} child")))
}

/// A version history: the versions of one versionable node and their labels.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalVersionHistory {
    id: NodeId,
    versionable_id: NodeId,
    root_version: NodeId,
    labels_node: NodeId,
    /// In creation order, root version first.
    versions: Vec<(Name, NodeId)>,
    labels: BTreeMap<Name, NodeId>,
}

impl InternalVersionHistory {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        let data = load_node(states, id)?;
        expect_type(id, &data, &well_known::NT_VERSION_HISTORY, "version history")?;

        let versionable_id = load_values(states, id, &data, &well_known::JCR_VERSIONABLE_UUID)?
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| VersionError::inconsistent(format!("history {id} has no versionable id")))?
            .parse::<NodeId>()?;
        let root_version = required_child(id, &data, &well_known::JCR_ROOT_VERSION)?;
        let labels_node = required_child(id, &data, &well_known::JCR_VERSION_LABELS)?;

        let versions = data
            .children
            .iter()
            .filter(|e| e.name != well_known::JCR_VERSION_LABELS)
            .map(|e| (e.name, e.id))
            .collect();

        let labels_data = load_node(states, &labels_node)?;
        let mut labels = BTreeMap::new();
        for label in &labels_data.property_names {
            let target = load_values(states, &labels_node, &labels_data, label)?;
            if let Some(version) = node_ids(&target).first() {
                labels.insert(label.clone(), *version);
            }
        }

        Ok(Self {
            id: *id,
            versionable_id,
            root_version,
            labels_node,
            versions,
            labels,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The node this history records.
    pub fn versionable_id(&self) -> NodeId {
        self.versionable_id
    }

    pub fn root_version(&self) -> NodeId {
        self.root_version
    }

    pub(crate) fn labels_node(&self) -> NodeId {
        self.labels_node
    }

    pub fn versions(&self) -> &[(Name, NodeId)] {
        &self.versions
    }

    pub fn num_versions(&self) -> usize {
        self.versions.len()
    }

    pub fn version(&self, name: &Name) -> Option<NodeId> {
        self.versions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    pub fn has_version_named(&self, local_name: &str) -> bool {
        self.versions
            .iter()
            .any(|(n, _)| n.namespace().is_empty() && n.local_name() == local_name)
    }

    pub fn contains(&self, version: &NodeId) -> bool {
        self.versions.iter().any(|(_, id)| id == version)
    }

    pub fn name_of(&self, version: &NodeId) -> Option<&Name> {
        self.versions
            .iter()
            .find(|(_, id)| id == version)
            .map(|(n, _)| n)
    }

    pub fn labels(&self) -> &BTreeMap<Name, NodeId> {
        &self.labels
    }

    /// The version holding `label`.
    pub fn version_by_label(&self, label: &Name) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    pub fn labels_of(&self, version: &NodeId) -> Vec<Name> {
        self.labels
            .iter()
            .filter(|(_, v)| *v == version)
            .map(|(l, _)| l.clone())
            .collect()
    }
}

/// One version: its place in the graph and its frozen node.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalVersion {
    id: NodeId,
    history: NodeId,
    name: Name,
    created: DateTime<Utc>,
    predecessors: Vec<NodeId>,
    successors: Vec<NodeId>,
    frozen_node: NodeId,
    activity: Option<NodeId>,
    labels: Vec<Name>,
}

impl InternalVersion {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        let data = load_node(states, id)?;
        expect_type(id, &data, &well_known::NT_VERSION, "version")?;
        let history = data
            .parent_id
            .ok_or_else(|| VersionError::inconsistent(format!("version {id} has no history")))?;

        let created = load_values(states, id, &data, &well_known::JCR_CREATED)?
            .first()
            .and_then(Value::as_date)
            .copied()
            .ok_or_else(|| VersionError::inconsistent(format!("version {id} has no creation date")))?;
        let predecessors = node_ids(&load_values(states, id, &data, &well_known::JCR_PREDECESSORS)?);
        let successors = node_ids(&load_values(states, id, &data, &well_known::JCR_SUCCESSORS)?);
        let activity = node_ids(&load_values(states, id, &data, &well_known::JCR_ACTIVITY)?)
            .first()
            .copied();
        let frozen_node = required_child(id, &data, &well_known::JCR_FROZEN_NODE)?;

        let history_data = load_node(states, &history)?;
        let labels_node = required_child(&history, &history_data, &well_known::JCR_VERSION_LABELS)?;
        let labels_data = load_node(states, &labels_node)?;
        let mut labels = Vec::new();
        for label in &labels_data.property_names {
            let target = load_values(states, &labels_node, &labels_data, label)?;
            if node_ids(&target).first() == Some(id) {
                labels.push(label.clone());
            }
        }

        Ok(Self {
            id: *id,
            history,
            name: data.name,
            created,
            predecessors,
            successors,
            frozen_node,
            activity,
            labels,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The history this version belongs to.
    pub fn history(&self) -> NodeId {
        self.history
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn predecessors(&self) -> &[NodeId] {
        &self.predecessors
    }

    pub fn successors(&self) -> &[NodeId] {
        &self.successors
    }

    pub fn frozen_node(&self) -> NodeId {
        self.frozen_node
    }

    /// The activity the version was created in.
    pub fn activity(&self) -> Option<NodeId> {
        self.activity
    }

    pub fn labels(&self) -> &[Name] {
        &self.labels
    }

    pub fn has_label(&self, label: &Name) -> bool {
        self.labels.contains(label)
    }

    pub fn is_root_version(&self) -> bool {
        self.name == well_known::JCR_ROOT_VERSION
    }

    pub fn is_more_recent_than(&self, other: &InternalVersion) -> bool {
        self.created > other.created
    }
}

/// An activity and the versions created in it.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalActivity {
    id: NodeId,
    title: String,
    /// `(version, history)` in the order the versions were created.
    versions: Vec<(NodeId, NodeId)>,
}

impl InternalActivity {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        let data = load_node(states, id)?;
        expect_type(id, &data, &well_known::NT_ACTIVITY, "activity")?;
        let title = load_values(states, id, &data, &well_known::JCR_ACTIVITY_TITLE)?
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut versions = Vec::new();
        for version in node_ids(&load_values(states, id, &data, &well_known::REP_VERSIONS)?) {
            let history = load_node(states, &version)?.parent_id.ok_or_else(|| {
                VersionError::inconsistent(format!("version {version} of activity {id} has no history"))
            })?;
            versions.push((version, history));
        }
        Ok(Self {
            id: *id,
            title,
            versions,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn versions(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.versions.iter().map(|(v, _)| *v)
    }

    pub fn contains(&self, version: &NodeId) -> bool {
        self.versions.iter().any(|(v, _)| v == version)
    }

    /// The newest version of `history` created in this activity.
    pub fn latest_version_of(&self, history: &NodeId) -> Option<NodeId> {
        self.versions
            .iter()
            .rev()
            .find(|(_, h)| h == history)
            .map(|(v, _)| *v)
    }

    /// The newest version per history.
    pub fn change_set(&self) -> BTreeMap<NodeId, NodeId> {
        self.versions.iter().map(|(v, h)| (*h, *v)).collect()
    }
}

/// The copy of a node's state kept inside a version.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalFrozenNode {
    id: NodeId,
    frozen_primary_type: Name,
    frozen_mixins: BTreeSet<Name>,
    frozen_id: Option<NodeId>,
    properties: BTreeMap<Name, PropertyData>,
    children: Vec<ChildNodeEntry>,
}

impl InternalFrozenNode {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        use well_known::*;

        let data = load_node(states, id)?;
        expect_type(id, &data, &NT_FROZEN_NODE, "frozen node")?;

        let frozen_primary_type = load_values(states, id, &data, &JCR_FROZEN_PRIMARY_TYPE)?
            .first()
            .and_then(Value::as_name)
            .cloned()
            .ok_or_else(|| VersionError::inconsistent(format!("frozen node {id} has no primary type")))?;
        let frozen_mixins = load_values(states, id, &data, &JCR_FROZEN_MIXIN_TYPES)?
            .iter()
            .filter_map(Value::as_name)
            .cloned()
            .collect();
        let frozen_id = match load_values(states, id, &data, &JCR_FROZEN_UUID)?
            .first()
            .and_then(Value::as_str)
        {
            Some(s) => Some(s.parse::<NodeId>()?),
            None => None,
        };

        let mut properties = BTreeMap::new();
        for name in &data.property_names {
            if [JCR_FROZEN_PRIMARY_TYPE, JCR_FROZEN_MIXIN_TYPES, JCR_FROZEN_UUID, JCR_UUID].contains(name) {
                continue;
            }
            if let Some(prop) = load_property(states, id, &data, name)? {
                properties.insert(name.clone(), prop);
            }
        }

        Ok(Self {
            id: *id,
            frozen_primary_type,
            frozen_mixins,
            frozen_id,
            properties,
            children: data.children.iter().collect(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn frozen_primary_type(&self) -> &Name {
        &self.frozen_primary_type
    }

    pub fn frozen_mixins(&self) -> &BTreeSet<Name> {
        &self.frozen_mixins
    }

    /// The id of the node this is a copy of, if it was referenceable.
    pub fn frozen_id(&self) -> Option<NodeId> {
        self.frozen_id
    }

    pub fn properties(&self) -> &BTreeMap<Name, PropertyData> {
        &self.properties
    }

    pub fn property(&self, name: &Name) -> Option<&PropertyData> {
        self.properties.get(name)
    }

    /// Frozen child nodes and versioned-child records.
    pub fn children(&self) -> &[ChildNodeEntry] {
        &self.children
    }
}

/// Stands in for a versionable child inside a frozen node.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalVersionedChild {
    id: NodeId,
    name: Name,
    history: NodeId,
}

impl InternalVersionedChild {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        let data = load_node(states, id)?;
        expect_type(id, &data, &well_known::NT_VERSIONED_CHILD, "versioned child")?;
        let history = node_ids(&load_values(states, id, &data, &well_known::JCR_CHILD_VERSION_HISTORY)?)
            .first()
            .copied()
            .ok_or_else(|| VersionError::inconsistent(format!("versioned child {id} has no history")))?;
        Ok(Self {
            id: *id,
            name: data.name,
            history,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    /// The version history of the child that was versioned.
    pub fn child_version_history(&self) -> NodeId {
        self.history
    }
}

/// A version of an `nt:configuration` node: the base versions of every
/// versionable node below the configuration root at checkin time.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalBaseline {
    version: InternalVersion,
    configuration: Option<NodeId>,
    configuration_root: Option<NodeId>,
    base_versions: Vec<NodeId>,
}

impl InternalBaseline {
    pub fn load<S: ItemStateManager + ?Sized>(states: &S, id: &NodeId) -> VersionResult<Self> {
        let version = InternalVersion::load(states, id)?;
        let frozen = InternalFrozenNode::load(states, &version.frozen_node())?;
        if frozen.frozen_primary_type() != &well_known::NT_CONFIGURATION {
            return Err(VersionError::WrongItemType {
                id: *id,
                expected: "baseline",
            });
        }
        let configuration_root = frozen
            .property(&well_known::JCR_ROOT)
            .and_then(PropertyData::value)
            .and_then(Value::as_node_id)
            .copied();
        let base_versions = frozen
            .property(&well_known::REP_BASE_VERSIONS)
            .map(|p| node_ids(&p.values))
            .unwrap_or_default();
        Ok(Self {
            configuration: frozen.frozen_id(),
            version,
            configuration_root,
            base_versions,
        })
    }

    pub fn version(&self) -> &InternalVersion {
        &self.version
    }

    /// The configuration node that was checked in.
    pub fn configuration(&self) -> Option<NodeId> {
        self.configuration
    }

    pub fn configuration_root(&self) -> Option<NodeId> {
        self.configuration_root
    }

    pub fn base_versions(&self) -> &[NodeId] {
        &self.base_versions
    }
}

/// Any node of the version storage, classified by its effective type.
#[derive(Clone, Debug, PartialEq)]
pub enum InternalVersionItem {
    FrozenNode(InternalFrozenNode),
    VersionedChild(InternalVersionedChild),
    Version(InternalVersion),
    VersionHistory(InternalVersionHistory),
    Activity(InternalActivity),
}

impl InternalVersionItem {
    /// Load and classify a node. Nodes of any other type give `Ok(None)`.
    pub fn load<S: ItemStateManager + ?Sized>(
        states: &S,
        node_types: &dyn NodeTypeRegistry,
        id: &NodeId,
    ) -> VersionResult<Option<Self>> {
        use well_known::*;

        let data = load_node(states, id)?;
        let ent = node_types.effective_node_type(&data.primary_type, &data.mixins)?;
        let item = if ent.includes(&NT_FROZEN_NODE) {
            Self::FrozenNode(InternalFrozenNode::load(states, id)?)
        } else if ent.includes(&NT_VERSIONED_CHILD) {
            Self::VersionedChild(InternalVersionedChild::load(states, id)?)
        } else if ent.includes(&NT_VERSION) {
            Self::Version(InternalVersion::load(states, id)?)
        } else if ent.includes(&NT_VERSION_HISTORY) {
            Self::VersionHistory(InternalVersionHistory::load(states, id)?)
        } else if ent.includes(&NT_ACTIVITY) {
            Self::Activity(InternalActivity::load(states, id)?)
        } else {
            return Ok(None);
        };
        Ok(Some(item))
    }

    pub fn id(&self) -> NodeId {
        match self {
            Self::FrozenNode(n) => n.id(),
            Self::VersionedChild(c) => c.id(),
            Self::Version(v) => v.id(),
            Self::VersionHistory(h) => h.id(),
            Self::Activity(a) => a.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FrozenNode(_) => "frozen node",
            Self::VersionedChild(_) => "versioned child",
            Self::Version(_) => "version",
            Self::VersionHistory(_) => "version history",
            Self::Activity(_) => "activity",
        }
    }
}
