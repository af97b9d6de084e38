//! Item infos: the raw records an [`ItemInfoSource`] hands to the state
//! factory, tagged with the path they were found at.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use cairn_state::{ItemData, NodeData, PersistedItem, PersistenceManager, PropertyData};
use cairn_types::{ItemId, NodeId, Path, PropertyId};

use crate::error::{HierarchyError, HierarchyResult};

/// Who is asking. Passed through to the info source.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub workspace: String,
    pub user_id: String,
}

impl SessionContext {
    pub fn new(workspace: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            user_id: user_id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub path: Path,
    pub data: NodeData,
    pub modcount: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub path: Path,
    pub data: PropertyData,
    pub modcount: u64,
}

/// A node or property record with its path.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemInfo {
    Node(NodeInfo),
    Property(PropertyInfo),
}

impl ItemInfo {
    pub fn id(&self) -> ItemId {
        match self {
            ItemInfo::Node(n) => ItemId::Node(n.id),
            ItemInfo::Property(p) => ItemId::Property(p.id.clone()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ItemInfo::Node(n) => &n.path,
            ItemInfo::Property(p) => &p.path,
        }
    }

    /// The record form, for building item states.
    pub fn to_persisted(&self) -> PersistedItem {
        match self {
            ItemInfo::Node(n) => PersistedItem {
                data: ItemData::Node(n.data.clone()),
                modcount: n.modcount,
            },
            ItemInfo::Property(p) => PersistedItem {
                data: ItemData::Property(p.data.clone()),
                modcount: p.modcount,
            },
        }
    }
}

/// Where item infos come from.
pub trait ItemInfoSource: Send + Sync {
    /// The node itself first, then its properties, then its child nodes.
    fn item_infos(&self, session: &SessionContext, id: &NodeId) -> HierarchyResult<Vec<ItemInfo>>;

    fn property_info(&self, session: &SessionContext, id: &PropertyId) -> HierarchyResult<PropertyInfo>;
}

/// Serves item infos straight from a persistence manager, with paths
/// relative to a workspace root node.
pub struct PersistenceInfoSource {
    persistence: Arc<dyn PersistenceManager>,
    root: NodeId,
    fetches: AtomicUsize,
}

impl PersistenceInfoSource {
    pub fn new(persistence: Arc<dyn PersistenceManager>, root: NodeId) -> Self {
        Self {
            persistence,
            root,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &NodeId {
        &self.root
    }

    /// Number of `item_infos` and `property_info` calls served.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn load_node(&self, id: &NodeId) -> HierarchyResult<(NodeData, u64)> {
        let item_id = ItemId::Node(*id);
        let record = self
            .persistence
            .load(&item_id)?
            .ok_or_else(|| HierarchyError::ItemNotFound(item_id.clone()))?;
        match record.data {
            ItemData::Node(node) => Ok((node, record.modcount)),
            ItemData::Property(_) => Err(HierarchyError::InvalidInfo(format!(
                "{item_id} is stored as a property"
            ))),
        }
    }

    /// Walk parent links up to the workspace root.
    fn path_of(&self, id: &NodeId, node: &NodeData) -> HierarchyResult<Path> {
        let mut segments = Vec::new();
        let mut current = *id;
        let mut data = node.clone();
        while current != self.root {
            let parent_id = data.parent_id.ok_or(HierarchyError::ItemNotFound(ItemId::Node(*id)))?;
            let (parent, _) = self.load_node(&parent_id)?;
            let entry = parent.children.by_id(&current).ok_or_else(|| {
                HierarchyError::InvalidInfo(format!("{current} is not listed by its parent"))
            })?;
            segments.push((entry.name, entry.index));
            current = parent_id;
            data = parent;
        }
        Ok(segments
            .into_iter()
            .rev()
            .fold(Path::root(), |path, (name, index)| path.child_indexed(name, index)))
    }

    fn property_infos(&self, id: &NodeId, node: &NodeData, path: &Path) -> HierarchyResult<Vec<PropertyInfo>> {
        let mut infos = Vec::with_capacity(node.property_names.len());
        for name in &node.property_names {
            let pid = PropertyId::new(*id, name.clone());
            infos.push(self.load_property(pid, path.child(name.clone()))?);
        }
        Ok(infos)
    }

    fn load_property(&self, id: PropertyId, path: Path) -> HierarchyResult<PropertyInfo> {
        let item_id = ItemId::Property(id.clone());
        let record = self
            .persistence
            .load(&item_id)?
            .ok_or_else(|| HierarchyError::ItemNotFound(item_id.clone()))?;
        match record.data {
            ItemData::Property(data) => Ok(PropertyInfo {
                id,
                path,
                data,
                modcount: record.modcount,
            }),
            ItemData::Node(_) => Err(HierarchyError::InvalidInfo(format!(
                "{item_id} is stored as a node"
            ))),
        }
    }
}

impl ItemInfoSource for PersistenceInfoSource {
    fn item_infos(&self, session: &SessionContext, id: &NodeId) -> HierarchyResult<Vec<ItemInfo>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        trace!(workspace = %session.workspace, node = %id, "fetching item infos");

        let (data, modcount) = self.load_node(id)?;
        let path = self.path_of(id, &data)?;
        let mut infos = vec![];
        let properties = self.property_infos(id, &data, &path)?;
        let children = data.children.clone();
        infos.push(ItemInfo::Node(NodeInfo {
            id: *id,
            path: path.clone(),
            data,
            modcount,
        }));
        infos.extend(properties.into_iter().map(ItemInfo::Property));
        for child in children.iter() {
            let (child_data, child_modcount) = self.load_node(&child.id)?;
            infos.push(ItemInfo::Node(NodeInfo {
                id: child.id,
                path: path.child_indexed(child.name, child.index),
                data: child_data,
                modcount: child_modcount,
            }));
        }
        Ok(infos)
    }

    fn property_info(&self, session: &SessionContext, id: &PropertyId) -> HierarchyResult<PropertyInfo> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        trace!(workspace = %session.workspace, property = %id, "fetching property info");

        let (owner, _) = self.load_node(id.parent())?;
        let path = self.path_of(id.parent(), &owner)?.child(id.name().clone());
        self.load_property(id.clone(), path)
    }
}

impl std::fmt::Debug for PersistenceInfoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceInfoSource")
            .field("root", &self.root)
            .field("fetches", &self.fetches())
            .finish()
    }
}
