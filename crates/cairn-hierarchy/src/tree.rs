//! The hierarchy entry graph.
//!
//! Entries mirror the persisted tree for the parts a session has touched.
//! Each entry guards its own state, children and properties; there is no
//! tree-wide lock. Parents own their children through `Arc`, children point
//! back through `Weak`.
//!
//! Generations: the tree holds one counter. An entry records the
//! generation it was created or last invalidated at; the info cache tags
//! its records with the generation they were fetched at. A cached record
//! older than its entry is stale.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use tracing::debug;

use cairn_state::{ItemState, ItemStateObserver, NodeData, Status};
use cairn_types::{well_known, ItemId, Name, NodeId, Path, PathElement, PropertyId, DEFAULT_INDEX};

pub(crate) struct Slot {
    pub(crate) state: Option<ItemState>,
    pub(crate) generation: u64,
    pub(crate) removed: bool,
}

impl Slot {
    fn new(generation: u64) -> Self {
        Self {
            state: None,
            generation,
            removed: false,
        }
    }

    fn keeps_local_changes(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.status().is_transient() || s.status().is_stale())
    }

    fn mark_removed(&mut self) {
        self.removed = true;
        if let Some(state) = &mut self.state {
            if state.status() != Status::Removed {
                state.set_status(Status::Removed);
            }
        }
    }
}

/// Tree of hierarchy entries for one workspace.
pub struct HierarchyTree {
    root: Arc<NodeEntry>,
    generation: Arc<AtomicU64>,
}

impl HierarchyTree {
    pub fn new(root_id: NodeId) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let root = Arc::new(NodeEntry::new(
            root_id,
            well_known::ROOT,
            DEFAULT_INDEX,
            Weak::new(),
            generation.clone(),
        ));
        Self { root, generation }
    }

    pub fn root(&self) -> &Arc<NodeEntry> {
        &self.root
    }

    /// The current tree-wide generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// An observer that invalidates entries of this tree whose items are
    /// committed by any session. Register it on the shared state manager.
    pub fn invalidator(&self) -> Arc<TreeInvalidator> {
        Arc::new(TreeInvalidator {
            root: Arc::downgrade(&self.root),
            generation: self.generation.clone(),
        })
    }

    /// Find an already loaded entry. Does not fetch anything.
    pub fn lookup(&self, path: &Path) -> Option<Arc<NodeEntry>> {
        let path = path.normalize().ok()?;
        if !path.is_absolute() {
            return None;
        }
        let mut current = self.root.clone();
        for element in path.elements() {
            current = match element {
                PathElement::Named { name, index } => current.child(name, *index)?,
                PathElement::Parent => current.parent()?,
                PathElement::Root | PathElement::Current => current,
            };
        }
        Some(current)
    }
}

impl std::fmt::Debug for HierarchyTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyTree")
            .field("root", &self.root.id())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A node in the hierarchy.
pub struct NodeEntry {
    id: NodeId,
    parent: Weak<NodeEntry>,
    counter: Arc<AtomicU64>,
    position: Mutex<(Name, u32)>,
    slot: Mutex<Slot>,
    children: RwLock<Vec<Arc<NodeEntry>>>,
    properties: RwLock<BTreeMap<Name, Arc<PropertyEntry>>>,
}

impl NodeEntry {
    fn new(id: NodeId, name: Name, index: u32, parent: Weak<NodeEntry>, counter: Arc<AtomicU64>) -> Self {
        let generation = counter.load(Ordering::SeqCst);
        Self {
            id,
            parent,
            counter,
            position: Mutex::new((name, index)),
            slot: Mutex::new(Slot::new(generation)),
            children: RwLock::new(Vec::new()),
            properties: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Name {
        self.position.lock().expect("entry lock poisoned").0.clone()
    }

    pub fn index(&self) -> u32 {
        self.position.lock().expect("entry lock poisoned").1
    }

    pub fn parent(&self) -> Option<Arc<NodeEntry>> {
        self.parent.upgrade()
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none()
    }

    /// The generation this entry was created or last invalidated at.
    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    pub(crate) fn tree_generation(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.slot().removed
    }

    /// A snapshot of the resolved state, if any.
    pub fn state(&self) -> Option<ItemState> {
        self.slot().state.clone()
    }

    pub fn status(&self) -> Option<Status> {
        self.slot().state.as_ref().map(ItemState::status)
    }

    /// Mutate the resolved state in place. Returns `None` if unresolved.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ItemState) -> R) -> Option<R> {
        self.slot().state.as_mut().map(f)
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().expect("entry lock poisoned")
    }

    /// The path of this entry from the workspace root.
    pub fn workspace_path(&self) -> Path {
        let Some(mut parent) = self.parent.upgrade() else {
            return Path::root();
        };
        let mut segments = vec![(self.name(), self.index())];
        while let Some(grandparent) = parent.parent.upgrade() {
            segments.push((parent.name(), parent.index()));
            parent = grandparent;
        }
        segments
            .into_iter()
            .rev()
            .fold(Path::root(), |path, (name, index)| path.child_indexed(name, index))
    }

    pub fn child(&self, name: &Name, index: u32) -> Option<Arc<NodeEntry>> {
        self.children
            .read()
            .expect("entry lock poisoned")
            .iter()
            .find(|c| {
                let (n, i) = &*c.position.lock().expect("entry lock poisoned");
                n == name && *i == index
            })
            .cloned()
    }

    pub fn child_by_id(&self, id: &NodeId) -> Option<Arc<NodeEntry>> {
        self.children
            .read()
            .expect("entry lock poisoned")
            .iter()
            .find(|c| &c.id == id)
            .cloned()
    }

    pub fn children(&self) -> Vec<Arc<NodeEntry>> {
        self.children.read().expect("entry lock poisoned").clone()
    }

    /// Add a child entry, or return the existing one with this id.
    pub fn add_child(self: &Arc<Self>, name: Name, index: u32, id: NodeId) -> Arc<NodeEntry> {
        let mut children = self.children.write().expect("entry lock poisoned");
        if let Some(existing) = children.iter().find(|c| c.id == id) {
            return existing.clone();
        }
        let child = Arc::new(NodeEntry::new(id, name, index, Arc::downgrade(self), self.counter.clone()));
        children.push(child.clone());
        child
    }

    pub fn property(&self, name: &Name) -> Option<Arc<PropertyEntry>> {
        self.properties
            .read()
            .expect("entry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn properties(&self) -> Vec<Arc<PropertyEntry>> {
        self.properties
            .read()
            .expect("entry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn add_property(self: &Arc<Self>, name: Name) -> Arc<PropertyEntry> {
        let mut properties = self.properties.write().expect("entry lock poisoned");
        properties
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(PropertyEntry::new(
                    PropertyId::new(self.id, name),
                    Arc::downgrade(self),
                    self.counter.clone(),
                ))
            })
            .clone()
    }

    /// Mark this entry's cached data stale and invalidate its state.
    pub fn invalidate(&self, recursive: bool) {
        let generation = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.invalidate_at(generation, recursive);
        debug!(node = %self.id, generation, recursive, "hierarchy entry invalidated");
    }

    fn invalidate_at(&self, generation: u64, recursive: bool) {
        {
            let mut slot = self.slot();
            slot.generation = generation;
            if let Some(state) = &mut slot.state {
                state.invalidate();
            }
        }
        for property in self.properties() {
            property.invalidate_at(generation);
        }
        if recursive {
            for child in self.children() {
                child.invalidate_at(generation, true);
            }
        }
    }

    /// Find a loaded entry by id in this subtree. Does not fetch anything.
    pub fn find(self: &Arc<Self>, id: &NodeId) -> Option<Arc<NodeEntry>> {
        if &self.id == id {
            return Some(self.clone());
        }
        self.children().iter().find_map(|child| child.find(id))
    }

    /// Mark this entry and everything below it removed.
    pub fn mark_removed(&self) {
        self.slot().mark_removed();
        for property in self.properties() {
            property.slot().mark_removed();
        }
        for child in self.children() {
            child.mark_removed();
        }
    }

    /// Bring child and property entries in line with freshly loaded data.
    /// Entries holding local changes are kept.
    pub(crate) fn reconcile(self: &Arc<Self>, data: &NodeData) {
        {
            let mut children = self.children.write().expect("entry lock poisoned");
            let mut next = Vec::with_capacity(data.children.len());
            for child in data.children.iter() {
                match children.iter().find(|c| c.id == child.id) {
                    Some(existing) => {
                        *existing.position.lock().expect("entry lock poisoned") =
                            (child.name, child.index);
                        next.push(existing.clone());
                    }
                    None => next.push(Arc::new(NodeEntry::new(
                        child.id,
                        child.name,
                        child.index,
                        Arc::downgrade(self),
                        self.counter.clone(),
                    ))),
                }
            }
            for old in children.iter() {
                if next.iter().any(|n| Arc::ptr_eq(n, old)) {
                    continue;
                }
                if old.slot().keeps_local_changes() {
                    next.push(old.clone());
                } else {
                    old.mark_removed();
                }
            }
            *children = next;
        }

        let mut properties = self.properties.write().expect("entry lock poisoned");
        let stale: Vec<Name> = properties
            .iter()
            .filter(|(name, p)| !data.property_names.contains(*name) && !p.slot().keeps_local_changes())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(p) = properties.remove(&name) {
                p.slot().mark_removed();
            }
        }
        let missing: BTreeSet<&Name> = data
            .property_names
            .iter()
            .filter(|n| !properties.contains_key(*n))
            .collect();
        for name in missing {
            properties.insert(
                name.clone(),
                Arc::new(PropertyEntry::new(
                    PropertyId::new(self.id, name.clone()),
                    Arc::downgrade(self),
                    self.counter.clone(),
                )),
            );
        }
    }
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("index", &self.index())
            .field("status", &self.status())
            .finish()
    }
}

/// A property in the hierarchy.
pub struct PropertyEntry {
    id: PropertyId,
    parent: Weak<NodeEntry>,
    slot: Mutex<Slot>,
}

impl PropertyEntry {
    fn new(id: PropertyId, parent: Weak<NodeEntry>, counter: Arc<AtomicU64>) -> Self {
        Self {
            id,
            parent,
            slot: Mutex::new(Slot::new(counter.load(Ordering::SeqCst))),
        }
    }

    pub fn id(&self) -> &PropertyId {
        &self.id
    }

    pub fn name(&self) -> &Name {
        self.id.name()
    }

    pub fn parent(&self) -> Option<Arc<NodeEntry>> {
        self.parent.upgrade()
    }

    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    pub fn is_removed(&self) -> bool {
        self.slot().removed
    }

    pub fn state(&self) -> Option<ItemState> {
        self.slot().state.clone()
    }

    pub fn status(&self) -> Option<Status> {
        self.slot().state.as_ref().map(ItemState::status)
    }

    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut ItemState) -> R) -> Option<R> {
        self.slot().state.as_mut().map(f)
    }

    /// Path of the property; `None` once its node entry is gone.
    pub fn workspace_path(&self) -> Option<Path> {
        Some(self.parent()?.workspace_path().child(self.name().clone()))
    }

    pub(crate) fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().expect("entry lock poisoned")
    }

    pub(crate) fn mark_removed(&self) {
        self.slot().mark_removed();
    }

    fn invalidate_at(&self, generation: u64) {
        let mut slot = self.slot();
        slot.generation = generation;
        if let Some(state) = &mut slot.state {
            state.invalidate();
        }
    }
}

impl std::fmt::Debug for PropertyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyEntry")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Invalidates hierarchy entries when their items are committed.
///
/// Holds the tree weakly, so a dropped tree only leaves a no-op observer.
pub struct TreeInvalidator {
    root: Weak<NodeEntry>,
    generation: Arc<AtomicU64>,
}

impl TreeInvalidator {
    fn committed(&self, id: &ItemId) {
        let Some(root) = self.root.upgrade() else {
            return;
        };
        let node = match id {
            ItemId::Node(node) => *node,
            ItemId::Property(property) => *property.parent(),
        };
        match root.find(&node) {
            Some(entry) => entry.invalidate(false),
            // Infos cached for entries not loaded yet must not outlive this
            // commit either.
            None => {
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl ItemStateObserver for TreeInvalidator {
    fn created(&self, state: &ItemState) {
        self.committed(state.id());
    }

    fn updated(&self, state: &ItemState) {
        self.committed(state.id());
    }

    fn destroyed(&self, state: &ItemState) {
        self.committed(state.id());
    }
}

impl std::fmt::Debug for TreeInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeInvalidator")
            .field("root", &self.root.upgrade().map(|r| r.id()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::local(s).unwrap()
    }

    #[test]
    fn paths_follow_positions() {
        let tree = HierarchyTree::new(NodeId::new());
        let a = tree.root().add_child(name("a"), 1, NodeId::new());
        let b = a.add_child(name("b"), 2, NodeId::new());
        assert_eq!(tree.root().workspace_path(), Path::root());
        assert_eq!(b.workspace_path().to_string(), "/a/b[2]");
        assert!(Arc::ptr_eq(&tree.lookup(&"/a/b[2]".parse().unwrap()).unwrap(), &b));
        assert!(tree.lookup(&"/a/b".parse().unwrap()).is_none());
        assert!(Arc::ptr_eq(
            &tree.lookup(&"/a/b[2]/..".parse().unwrap()).unwrap(),
            &a
        ));
    }

    #[test]
    fn invalidate_bumps_generation() {
        let tree = HierarchyTree::new(NodeId::new());
        let a = tree.root().add_child(name("a"), 1, NodeId::new());
        let b = a.add_child(name("b"), 1, NodeId::new());
        let before = a.generation();

        a.invalidate(false);
        assert_eq!(a.generation(), before + 1);
        assert_eq!(b.generation(), before);
        assert_eq!(tree.generation(), before + 1);

        tree.root().invalidate(true);
        assert_eq!(b.generation(), tree.generation());
    }

    #[test]
    fn reconcile_tracks_children_and_properties() {
        let tree = HierarchyTree::new(NodeId::new());
        let root = tree.root().clone();
        let keep = NodeId::new();
        let gone = root.add_child(name("gone"), 1, NodeId::new());
        let title = root.add_property(name("title"));

        let mut data = NodeData::new(None, well_known::ROOT, well_known::REP_ROOT);
        data.children.add(name("keep"), keep);
        data.property_names.insert(name("size"));
        root.reconcile(&data);

        assert!(gone.is_removed());
        assert!(title.is_removed());
        assert!(root.child_by_id(&keep).is_some());
        assert!(root.property(&name("size")).is_some());
        assert!(root.property(&name("title")).is_none());
        assert_eq!(root.children().len(), 1);
    }
}
