//! Builds item states for hierarchy entries from an info source.

use std::sync::Arc;

use tracing::{debug, trace};

use cairn_state::{
    ItemData, ItemState, ItemStateObserver, ObserverHandle, PersistedItem, StateObservers, Status,
};
use cairn_types::{ItemId, Name, NodeId, Path, PathElement, PropertyId};

use crate::cache::{CacheConfig, ItemInfoCache};
use crate::error::{HierarchyError, HierarchyResult};
use crate::info::{ItemInfo, ItemInfoSource, NodeInfo, PropertyInfo, SessionContext};
use crate::tree::{HierarchyTree, NodeEntry, PropertyEntry, Slot};

enum Outcome {
    Created(ItemState),
    Updated(ItemState),
    Preserved(ItemState),
}

/// Creates and refreshes item states for hierarchy entries.
///
/// Infos are served from a generation-tagged cache when the cached record
/// is at least as new as the entry asking for it and was found at the
/// entry's path. Otherwise one batch is fetched from the source and cached
/// whole. States holding local changes are never overwritten. Each state
/// built fires exactly one of `created` or `updated`.
pub struct ItemStateFactory {
    source: Arc<dyn ItemInfoSource>,
    session: SessionContext,
    cache: ItemInfoCache,
    observers: StateObservers,
}

impl ItemStateFactory {
    pub fn new(source: Arc<dyn ItemInfoSource>, session: SessionContext, config: &CacheConfig) -> Self {
        Self {
            source,
            session,
            cache: ItemInfoCache::new(config),
            observers: StateObservers::new(),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn cache(&self) -> &ItemInfoCache {
        &self.cache
    }

    pub fn observe(&self, observer: Arc<dyn ItemStateObserver>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    /// Build (or refresh) the state of the node behind `entry`.
    pub fn create_node_state(&self, id: &NodeId, entry: &Arc<NodeEntry>) -> HierarchyResult<ItemState> {
        if entry.id() != *id {
            return Err(HierarchyError::InvalidInfo(format!(
                "entry {} cannot hold node {id}",
                entry.id()
            )));
        }
        let info = self.node_info(id, entry.generation(), Some(&entry.workspace_path()), entry.tree_generation())?;
        let outcome = apply(&mut entry.slot(), ItemId::Node(*id), info_record(&info))?;
        if !matches!(outcome, Outcome::Preserved(_)) {
            entry.reconcile(&info.data);
        }
        Ok(self.announce(outcome))
    }

    /// Build (or refresh) the state of the property behind `entry`.
    pub fn create_property_state(
        &self,
        id: &PropertyId,
        entry: &Arc<PropertyEntry>,
    ) -> HierarchyResult<ItemState> {
        if entry.id() != id {
            return Err(HierarchyError::InvalidInfo(format!(
                "entry {} cannot hold property {id}",
                entry.id()
            )));
        }
        let parent = entry
            .parent()
            .ok_or_else(|| HierarchyError::EntryRemoved(id.to_string()))?;
        let expected = parent.workspace_path().child(id.name().clone());
        let info = self.property_info(id, entry.generation(), &expected, parent.tree_generation())?;
        let record = PersistedItem {
            data: ItemData::Property(info.data),
            modcount: info.modcount,
        };
        let outcome = apply(&mut entry.slot(), ItemId::Property(id.clone()), record)?;
        Ok(self.announce(outcome))
    }

    /// Build the state of a node somewhere below `any_parent`, creating the
    /// hierarchy entries on the way down.
    pub fn create_deep_node_state(
        &self,
        id: &NodeId,
        any_parent: &Arc<NodeEntry>,
    ) -> HierarchyResult<(Arc<NodeEntry>, ItemState)> {
        if let Some(entry) = any_parent.child_by_id(id) {
            let state = self.create_node_state(id, &entry)?;
            return Ok((entry, state));
        }
        let info = self.node_info(id, any_parent.generation(), None, any_parent.tree_generation())?;
        let relative = info
            .path
            .relative_to(&any_parent.workspace_path())
            .map_err(|_| HierarchyError::ItemNotFound(ItemId::Node(*id)))?;

        let mut entry = any_parent.clone();
        for element in relative.elements() {
            let PathElement::Named { name, index } = element else {
                continue;
            };
            entry = self.child_entry(&entry, name, *index)?;
        }
        if entry.id() != *id {
            return Err(HierarchyError::ItemNotFound(ItemId::Node(*id)));
        }
        let state = self.create_node_state(id, &entry)?;
        Ok((entry, state))
    }

    /// Walk from the tree root to `path`, loading entries as needed.
    pub fn resolve_path(&self, tree: &HierarchyTree, path: &Path) -> HierarchyResult<Arc<NodeEntry>> {
        let normalized = path.normalize()?;
        if !normalized.is_absolute() {
            return Err(HierarchyError::PathNotFound(path.clone()));
        }
        let mut entry = tree.root().clone();
        for element in normalized.elements() {
            let PathElement::Named { name, index } = element else {
                continue;
            };
            entry = self
                .child_entry(&entry, name, *index)
                .map_err(|_| HierarchyError::PathNotFound(path.clone()))?;
        }
        Ok(entry)
    }

    /// The state of a node entry, re-validating it if it was invalidated.
    ///
    /// An item that vanished from the source marks the entry removed.
    pub fn resolve_node(&self, entry: &Arc<NodeEntry>) -> HierarchyResult<ItemState> {
        if entry.is_removed() {
            return Err(HierarchyError::EntryRemoved(entry.workspace_path().to_string()));
        }
        if let Some(state) = entry.state().filter(|s| s.status() != Status::Invalidated) {
            return Ok(state);
        }
        match self.create_node_state(&entry.id(), entry) {
            Err(HierarchyError::ItemNotFound(id)) => {
                debug!(item = %id, "item vanished; removing hierarchy entry");
                entry.mark_removed();
                Err(HierarchyError::ItemNotFound(id))
            }
            other => other,
        }
    }

    /// The state of a property entry, re-validating it if it was invalidated.
    pub fn resolve_property(&self, entry: &Arc<PropertyEntry>) -> HierarchyResult<ItemState> {
        if entry.is_removed() {
            return Err(HierarchyError::EntryRemoved(entry.id().to_string()));
        }
        if let Some(state) = entry.state().filter(|s| s.status() != Status::Invalidated) {
            return Ok(state);
        }
        match self.create_property_state(&entry.id().clone(), entry) {
            Err(HierarchyError::ItemNotFound(id)) => {
                debug!(item = %id, "property vanished; removing hierarchy entry");
                entry.mark_removed();
                Err(HierarchyError::ItemNotFound(id))
            }
            other => other,
        }
    }

    fn child_entry(&self, parent: &Arc<NodeEntry>, name: &Name, index: u32) -> HierarchyResult<Arc<NodeEntry>> {
        if let Some(child) = parent.child(name, index) {
            return Ok(child);
        }
        self.create_node_state(&parent.id(), parent)?;
        if let Some(child) = parent.child(name, index) {
            return Ok(child);
        }
        // The cached parent may predate the child; force one refetch.
        parent.invalidate(false);
        self.create_node_state(&parent.id(), parent)?;
        parent
            .child(name, index)
            .ok_or_else(|| HierarchyError::PathNotFound(parent.workspace_path().child_indexed(name.clone(), index)))
    }

    fn node_info(
        &self,
        id: &NodeId,
        entry_generation: u64,
        expected_path: Option<&Path>,
        tree_generation: u64,
    ) -> HierarchyResult<NodeInfo> {
        let key = ItemId::Node(*id);
        if let Some(cached) = self.cache.get(&key) {
            if cached.generation >= entry_generation {
                if expected_path.is_some_and(|p| cached.info.path() != p) {
                    debug!(node = %id, cached = %cached.info.path(), "cached path no longer matches entry");
                    return Err(HierarchyError::ItemNotFound(key));
                }
                if let ItemInfo::Node(info) = cached.info {
                    trace!(node = %id, generation = cached.generation, "info cache hit");
                    return Ok(info);
                }
            }
        }
        trace!(node = %id, entry_generation, "info cache miss");
        let batch = self.source.item_infos(&self.session, id)?;
        let found = batch.iter().find_map(|info| match info {
            ItemInfo::Node(node) if node.id == *id => Some(node.clone()),
            _ => None,
        });
        self.cache.put_batch(batch, tree_generation);
        found.ok_or(HierarchyError::ItemNotFound(key))
    }

    fn property_info(
        &self,
        id: &PropertyId,
        entry_generation: u64,
        expected_path: &Path,
        tree_generation: u64,
    ) -> HierarchyResult<PropertyInfo> {
        let key = ItemId::Property(id.clone());
        if let Some(cached) = self.cache.get(&key) {
            if cached.generation >= entry_generation {
                if cached.info.path() != expected_path {
                    return Err(HierarchyError::ItemNotFound(key));
                }
                if let ItemInfo::Property(info) = cached.info {
                    return Ok(info);
                }
            }
        }
        let batch = self.source.item_infos(&self.session, id.parent())?;
        let found = batch.iter().find_map(|info| match info {
            ItemInfo::Property(prop) if &prop.id == id => Some(prop.clone()),
            _ => None,
        });
        self.cache.put_batch(batch, tree_generation);
        found.ok_or(HierarchyError::ItemNotFound(key))
    }

    fn announce(&self, outcome: Outcome) -> ItemState {
        match outcome {
            Outcome::Created(state) => {
                for observer in self.observers.snapshot() {
                    observer.created(&state);
                }
                state
            }
            Outcome::Updated(state) => {
                for observer in self.observers.snapshot() {
                    observer.updated(&state);
                }
                state
            }
            Outcome::Preserved(state) => state,
        }
    }
}

impl std::fmt::Debug for ItemStateFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStateFactory")
            .field("session", &self.session)
            .field("cache", &self.cache)
            .finish()
    }
}

fn info_record(info: &NodeInfo) -> PersistedItem {
    PersistedItem {
        data: ItemData::Node(info.data.clone()),
        modcount: info.modcount,
    }
}

/// Install a freshly loaded record into an entry slot.
fn apply(slot: &mut Slot, id: ItemId, record: PersistedItem) -> HierarchyResult<Outcome> {
    if slot.removed {
        return Err(HierarchyError::EntryRemoved(id.to_string()));
    }
    match &mut slot.state {
        Some(state) if state.status().is_transient() || state.status().is_stale() => {
            trace!(item = %id, status = %state.status(), "keeping state with local changes");
            Ok(Outcome::Preserved(state.clone()))
        }
        Some(state) => {
            let changed = state.modcount() != record.modcount;
            state.refresh_from(record);
            match state.status() {
                Status::Invalidated => state.set_status(Status::Existing),
                Status::Existing if changed => state.notify_external_change(),
                _ => {}
            }
            Ok(Outcome::Updated(state.clone()))
        }
        None => {
            let state = ItemState::from_persisted(id, record)?;
            slot.state = Some(state.clone());
            Ok(Outcome::Created(state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cairn_state::{
        InMemoryNodeTypeRegistry, InMemoryPersistenceManager, ItemStateManager, LocalStateManager,
        NodeData, SharedItemStateManager, UpdatableItemStateManager, UuidIdFactory,
    };
    use cairn_types::{well_known, Value};

    use crate::info::PersistenceInfoSource;

    struct Fixture {
        lsm: LocalStateManager,
        source: Arc<PersistenceInfoSource>,
        tree: HierarchyTree,
        factory: ItemStateFactory,
        a: NodeId,
        b: NodeId,
    }

    /// `/a/b` with a `title` property on `a`.
    fn fixture() -> Fixture {
        let pm = Arc::new(InMemoryPersistenceManager::new());
        let root = NodeId::new();
        let mut log = cairn_state::ChangeLog::new();
        log.added(ItemState::new_node(
            root,
            NodeData::new(None, well_known::ROOT, well_known::REP_WORKSPACE),
            Status::New,
        ));
        cairn_state::PersistenceManager::store(pm.as_ref(), &log).unwrap();

        let mut lsm = LocalStateManager::new(
            SharedItemStateManager::new(pm.clone()),
            Arc::new(UuidIdFactory),
            Arc::new(InMemoryNodeTypeRegistry::new()),
        );
        lsm.edit().unwrap();
        let a = lsm
            .add_node(&root, Name::local("a").unwrap(), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        let b = lsm
            .add_node(&a, Name::local("b").unwrap(), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        lsm.set_property(&a, Name::local("title").unwrap(), Value::from("t"))
            .unwrap();
        lsm.update().unwrap();

        let source = Arc::new(PersistenceInfoSource::new(pm, root));
        let factory = ItemStateFactory::new(
            source.clone(),
            SessionContext::new("default", "admin"),
            &CacheConfig::default(),
        );
        Fixture {
            lsm,
            source,
            tree: HierarchyTree::new(root),
            factory,
            a,
            b,
        }
    }

    #[derive(Default)]
    struct Counts {
        created: AtomicUsize,
        updated: AtomicUsize,
    }

    impl ItemStateObserver for Counts {
        fn created(&self, _state: &ItemState) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }
        fn updated(&self, _state: &ItemState) {
            self.updated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn batch_fetch_serves_children_from_cache() {
        let fx = fixture();
        let root = fx.tree.root().clone();
        fx.factory.create_node_state(&root.id(), &root).unwrap();
        assert_eq!(fx.source.fetches(), 1);

        let a = root.child_by_id(&fx.a).unwrap();
        let state = fx.factory.create_node_state(&fx.a, &a).unwrap();
        assert_eq!(state.status(), Status::Existing);
        assert_eq!(fx.source.fetches(), 1, "a came with the root batch");
        assert!(a.property(&Name::local("title").unwrap()).is_some());
    }

    #[test]
    fn newer_entry_generation_bypasses_cache() {
        let fx = fixture();
        let root = fx.tree.root().clone();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        fx.factory.create_node_state(&fx.a, &a).unwrap();
        let fetched = fx.source.fetches();

        let cached = fx.factory.cache().get(&ItemId::Node(fx.a)).unwrap();
        a.invalidate(false);
        assert_eq!(a.generation(), cached.generation + 1);

        fx.factory.create_node_state(&fx.a, &a).unwrap();
        assert_eq!(fx.source.fetches(), fetched + 1);
        assert!(root.generation() < a.generation());
    }

    #[test]
    fn path_mismatch_is_not_found() {
        let fx = fixture();
        let root = fx.tree.root().clone();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        let mut cached = fx.factory.cache().get(&ItemId::Node(fx.a)).unwrap();
        if let ItemInfo::Node(info) = &mut cached.info {
            info.path = Path::root().child(Name::local("moved").unwrap());
        }
        fx.factory.cache().put(cached.info, root.tree_generation());

        assert!(matches!(
            fx.factory.create_node_state(&fx.a, &a),
            Err(HierarchyError::ItemNotFound(_))
        ));
    }

    #[test]
    fn exactly_one_notification_per_build() {
        let fx = fixture();
        let counts = Arc::new(Counts::default());
        let _handle = fx.factory.observe(counts.clone());
        let root = fx.tree.root().clone();

        fx.factory.create_node_state(&root.id(), &root).unwrap();
        assert_eq!(counts.created.load(Ordering::SeqCst), 1);
        assert_eq!(counts.updated.load(Ordering::SeqCst), 0);

        root.invalidate(false);
        assert_eq!(root.status(), Some(Status::Invalidated));
        let state = fx.factory.resolve_node(&root).unwrap();
        assert_eq!(state.status(), Status::Existing);
        assert_eq!(counts.created.load(Ordering::SeqCst), 1);
        assert_eq!(counts.updated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn local_changes_survive_refresh() {
        let fx = fixture();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        fx.factory.create_node_state(&fx.a, &a).unwrap();
        a.with_state_mut(|s| s.mark_modified().unwrap());
        a.invalidate(false);

        let counts = Arc::new(Counts::default());
        let _handle = fx.factory.observe(counts.clone());
        let state = fx.factory.create_node_state(&fx.a, &a).unwrap();
        assert_eq!(state.status(), Status::ExistingModified);
        assert_eq!(counts.created.load(Ordering::SeqCst), 0);
        assert_eq!(counts.updated.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deep_state_creates_intermediate_entries() {
        let fx = fixture();
        let root = fx.tree.root().clone();
        let (entry, state) = fx.factory.create_deep_node_state(&fx.b, &root).unwrap();
        assert_eq!(state.node_id().unwrap(), fx.b);
        assert_eq!(entry.workspace_path().to_string(), "/a/b");
        assert!(root.child_by_id(&fx.a).is_some());
        assert!(Arc::ptr_eq(&fx.tree.lookup(&"/a/b".parse().unwrap()).unwrap(), &entry));
    }

    #[test]
    fn vanished_item_marks_entry_removed() {
        let mut fx = fixture();
        let b = fx.factory.resolve_path(&fx.tree, &"/a/b".parse().unwrap()).unwrap();
        fx.factory.create_node_state(&fx.b, &b).unwrap();

        fx.lsm.edit().unwrap();
        fx.lsm.remove_node(&fx.b).unwrap();
        fx.lsm.update().unwrap();
        assert!(!fx.lsm.has_item_state(&ItemId::Node(fx.b)).unwrap());

        b.invalidate(false);
        assert!(matches!(
            fx.factory.resolve_node(&b),
            Err(HierarchyError::ItemNotFound(_))
        ));
        assert!(b.is_removed());
        assert_eq!(b.status(), Some(Status::Removed));
    }

    #[test]
    fn property_state_from_parent_batch() {
        let fx = fixture();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        fx.factory.create_node_state(&fx.a, &a).unwrap();
        let title = a.property(&Name::local("title").unwrap()).unwrap();
        let state = fx.factory.resolve_property(&title).unwrap();
        assert_eq!(state.property().unwrap().value(), Some(&Value::from("t")));
    }

    #[test]
    fn vanished_property_stays_removed() {
        let mut fx = fixture();
        let title_name = Name::local("title").unwrap();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        fx.factory.resolve_node(&a).unwrap();
        let title = a.property(&title_name).unwrap();
        fx.factory.resolve_property(&title).unwrap();

        fx.lsm.edit().unwrap();
        assert!(fx.lsm.remove_property(&fx.a, &title_name).unwrap());
        fx.lsm.update().unwrap();

        a.invalidate(false);
        assert!(matches!(
            fx.factory.resolve_property(&title),
            Err(HierarchyError::ItemNotFound(_))
        ));
        assert!(title.is_removed());
        assert_eq!(title.status(), Some(Status::Removed));
        assert!(matches!(
            fx.factory.resolve_property(&title),
            Err(HierarchyError::EntryRemoved(_))
        ));
    }

    #[test]
    fn commits_from_other_sessions_invalidate_loaded_entries() {
        let mut fx = fixture();
        let _handle = fx.lsm.shared().observe(fx.tree.invalidator());
        let title_name = Name::local("title").unwrap();
        let a = fx.factory.resolve_path(&fx.tree, &"/a".parse().unwrap()).unwrap();
        fx.factory.resolve_node(&a).unwrap();
        let title = a.property(&title_name).unwrap();
        fx.factory.resolve_property(&title).unwrap();

        fx.lsm.edit().unwrap();
        fx.lsm.set_property(&fx.a, title_name.clone(), Value::from("t2")).unwrap();
        let c = fx
            .lsm
            .add_node(&fx.a, Name::local("c").unwrap(), well_known::NT_UNSTRUCTURED, None)
            .unwrap();
        fx.lsm.update().unwrap();

        assert_eq!(a.status(), Some(Status::Invalidated));
        let state = fx.factory.resolve_node(&a).unwrap();
        assert_eq!(state.node().unwrap().children.len(), 2);
        assert!(a.child_by_id(&c).is_some());
        let state = fx.factory.resolve_property(&title).unwrap();
        assert_eq!(state.property().unwrap().value(), Some(&Value::from("t2")));
    }
}
