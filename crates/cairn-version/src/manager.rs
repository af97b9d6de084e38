//! The internal version manager.
//!
//! Owns the version storage subtree. Reads take the versioning read lock and
//! go through an id-keyed cache of loaded entities. Every write takes the
//! write lock and runs as one [`WriteOperation`] on the manager's own local
//! state manager, so a write either lands completely or not at all; the
//! cache is dropped after each successful write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use cairn_state::{
    IdFactory, ItemStateManager, LocalStateManager, NodeTypeRegistry, SharedItemStateManager,
    UpdateSummary, WriteOperation,
};
use cairn_types::{well_known, Name, NodeId, Value, ValueType};

use crate::config::VersioningConfig;
use crate::entity::{
    load_node, load_values, node_ids, InternalActivity, InternalBaseline, InternalVersion,
    InternalVersionHistory, InternalVersionItem,
};
use crate::error::{VersionError, VersionResult};
use crate::frozen;
use crate::layout::{leaf_name, StorageLayout, VersionStorage};
use crate::lock::{VersioningLock, WriteGuard};
use crate::naming::{next_version_name, select_base, NamingBase};

/// Identifies a version history and the versionable node it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionHistoryInfo {
    pub history: NodeId,
    pub root_version: NodeId,
    pub versionable: NodeId,
}

impl From<&InternalVersionHistory> for VersionHistoryInfo {
    fn from(history: &InternalVersionHistory) -> Self {
        Self {
            history: history.id(),
            root_version: history.root_version(),
            versionable: history.versionable_id(),
        }
    }
}

fn append_weak(
    lsm: &mut LocalStateManager,
    node: &NodeId,
    name: Name,
    target: NodeId,
) -> VersionResult<()> {
    let mut values = lsm.property_values(node, &name)?;
    values.push(Value::WeakReference(target));
    lsm.set_property_values(node, name, ValueType::WeakReference, values)?;
    Ok(())
}

/// Replace `target` in a weak reference list with `replacements`, skipping
/// entries already present.
fn splice_weak(
    lsm: &mut LocalStateManager,
    node: &NodeId,
    name: Name,
    target: &NodeId,
    replacements: &[NodeId],
) -> VersionResult<()> {
    let mut ids: Vec<NodeId> = node_ids(&lsm.property_values(node, &name)?)
        .into_iter()
        .filter(|id| id != target)
        .collect();
    for id in replacements {
        if !ids.contains(id) {
            ids.push(*id);
        }
    }
    let values = ids.into_iter().map(Value::WeakReference).collect();
    lsm.set_property_values(node, name, ValueType::WeakReference, values)?;
    Ok(())
}

/// Version storage operations over one shared item store.
pub struct InternalVersionManager {
    shared: SharedItemStateManager,
    local: Mutex<LocalStateManager>,
    node_types: Arc<dyn NodeTypeRegistry>,
    id_factory: Arc<dyn IdFactory>,
    layout: StorageLayout,
    lock: VersioningLock,
    items: Mutex<HashMap<NodeId, InternalVersionItem>>,
}

impl InternalVersionManager {
    pub fn new(
        shared: SharedItemStateManager,
        id_factory: Arc<dyn IdFactory>,
        node_types: Arc<dyn NodeTypeRegistry>,
        storage: VersionStorage,
        config: VersioningConfig,
    ) -> Self {
        let local = LocalStateManager::new(shared.clone(), id_factory.clone(), node_types.clone());
        Self {
            shared,
            local: Mutex::new(local),
            node_types,
            id_factory,
            layout: StorageLayout::new(storage, config),
            lock: VersioningLock::new(),
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &VersionStorage {
        self.layout.roots()
    }

    pub fn config(&self) -> &VersioningConfig {
        self.layout.config()
    }

    /// The lock guarding the version storage. Callers that must see several
    /// reads consistently can hold the read lock around them.
    pub fn lock(&self) -> &VersioningLock {
        &self.lock
    }

    fn write_lock(&self) -> VersionResult<WriteGuard<'_>> {
        match self.config().lock_timeout() {
            Some(timeout) => self
                .lock
                .try_acquire_write_for(timeout)
                .ok_or(VersionError::LockTimeout(timeout)),
            None => Ok(self.lock.acquire_write()),
        }
    }

    /// Run `body` as one write operation under the write lock.
    ///
    /// Any error from `body` or from saving cancels every change it made
    /// before the lock is released.
    fn write<T>(
        &self,
        body: impl FnOnce(&mut LocalStateManager) -> VersionResult<T>,
    ) -> VersionResult<T> {
        let guard = self.write_lock()?;
        let local = self.local.lock().expect("version manager state poisoned");
        let mut op = WriteOperation::start_locked(local, guard)?;
        let value = match body(&mut op) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "version storage write failed; cancelling");
                return Err(e);
            }
        };
        let summary = op.save()?;
        self.evict(&summary);
        Ok(value)
    }

    fn evict(&self, summary: &UpdateSummary) {
        if summary.is_empty() {
            return;
        }
        let mut items = self.items.lock().expect("version item cache poisoned");
        debug!(cached = items.len(), "version item cache cleared after write");
        items.clear();
    }

    // -- reads --------------------------------------------------------------

    /// Load and classify a version storage node. `Ok(None)` for nodes that
    /// are none of the version storage types.
    pub fn get_item(&self, id: &NodeId) -> VersionResult<Option<InternalVersionItem>> {
        let _read = self.lock.acquire_read();
        if let Some(item) = self
            .items
            .lock()
            .expect("version item cache poisoned")
            .get(id)
        {
            return Ok(Some(item.clone()));
        }
        let item = InternalVersionItem::load(&self.shared, self.node_types.as_ref(), id)?;
        if let Some(item) = &item {
            self.items
                .lock()
                .expect("version item cache poisoned")
                .insert(*id, item.clone());
        }
        Ok(item)
    }

    fn expect_item(&self, id: &NodeId, expected: &'static str) -> VersionResult<InternalVersionItem> {
        self.get_item(id)?
            .ok_or(VersionError::WrongItemType { id: *id, expected })
    }

    pub fn get_version(&self, id: &NodeId) -> VersionResult<InternalVersion> {
        match self.expect_item(id, "version")? {
            InternalVersionItem::Version(version) => Ok(version),
            _ => Err(VersionError::WrongItemType {
                id: *id,
                expected: "version",
            }),
        }
    }

    pub fn get_version_history(&self, id: &NodeId) -> VersionResult<InternalVersionHistory> {
        match self.expect_item(id, "version history")? {
            InternalVersionItem::VersionHistory(history) => Ok(history),
            _ => Err(VersionError::WrongItemType {
                id: *id,
                expected: "version history",
            }),
        }
    }

    pub fn get_activity(&self, id: &NodeId) -> VersionResult<InternalActivity> {
        match self.expect_item(id, "activity")? {
            InternalVersionItem::Activity(activity) => Ok(activity),
            _ => Err(VersionError::WrongItemType {
                id: *id,
                expected: "activity",
            }),
        }
    }

    pub fn get_baseline(&self, id: &NodeId) -> VersionResult<InternalBaseline> {
        let _read = self.lock.acquire_read();
        InternalBaseline::load(&self.shared, id)
    }

    /// The history of a versionable node, if it has one.
    pub fn get_version_history_of_node(
        &self,
        node: &NodeId,
    ) -> VersionResult<Option<InternalVersionHistory>> {
        let history = {
            let _read = self.lock.acquire_read();
            self.layout.history_of(&self.shared, node)?
        };
        history.map(|id| self.get_version_history(&id)).transpose()
    }

    /// Whether an activity node exists at its storage location.
    pub fn has_activity(&self, id: &NodeId) -> VersionResult<bool> {
        let _read = self.lock.acquire_read();
        Ok(self.layout.activity(&self.shared, id)?.is_some())
    }

    // -- history creation ---------------------------------------------------

    fn create_history_in(
        &self,
        lsm: &mut LocalStateManager,
        node: &NodeId,
        created: DateTime<Utc>,
    ) -> VersionResult<NodeId> {
        use well_known::*;

        let storage_root = self.layout.roots().storage_root;
        let directory = self
            .layout
            .ensure_directory(lsm, storage_root, node, &REP_VERSION_STORAGE)?;
        let history = lsm.add_node(&directory, leaf_name(node)?, NT_VERSION_HISTORY, None)?;
        lsm.set_property(&history, JCR_VERSIONABLE_UUID, Value::String(node.to_string()))?;
        lsm.add_node(&history, JCR_VERSION_LABELS, NT_VERSION_LABELS, None)?;

        let root = lsm.add_node(&history, JCR_ROOT_VERSION, NT_VERSION, None)?;
        lsm.set_property(&root, JCR_CREATED, Value::Date(created))?;
        lsm.set_property_values(&root, JCR_PREDECESSORS, ValueType::WeakReference, vec![])?;
        lsm.set_property_values(&root, JCR_SUCCESSORS, ValueType::WeakReference, vec![])?;
        let frozen = lsm.add_node(&root, JCR_FROZEN_NODE, NT_FROZEN_NODE, None)?;
        frozen::record_identity(lsm, &frozen, node)?;

        info!(node = %node, history = %history, "created version history");
        Ok(history)
    }

    /// Create the version history of a node. Returns `Ok(None)`, and
    /// changes nothing, if the node already has one.
    pub fn create_version_history(
        &self,
        node: &NodeId,
    ) -> VersionResult<Option<InternalVersionHistory>> {
        self.write(|lsm| {
            load_node(lsm, node)?;
            if self.layout.history_of(lsm, node)?.is_some() {
                debug!(node = %node, "version history already exists");
                return Ok(None);
            }
            let history = self.create_history_in(lsm, node, Utc::now())?;
            Ok(Some(InternalVersionHistory::load(lsm, &history)?))
        })
    }

    /// The history of a node, created if it does not exist yet.
    pub fn version_history_info_for_node(&self, node: &NodeId) -> VersionResult<VersionHistoryInfo> {
        if let Some(history) = self.get_version_history_of_node(node)? {
            return Ok(VersionHistoryInfo::from(&history));
        }
        match self.create_version_history(node)? {
            Some(history) => Ok(VersionHistoryInfo::from(&history)),
            // Created by someone else in the meantime.
            None => self
                .get_version_history_of_node(node)?
                .map(|h| VersionHistoryInfo::from(&h))
                .ok_or_else(|| VersionError::inconsistent(format!("history of {node} vanished"))),
        }
    }

    /// Give a node its version history and versioning properties: base
    /// version and predecessor set to the root version, checked out.
    /// Nodes that already carry a history reference are left alone.
    pub fn initialize_versionable(&self, node: &NodeId) -> VersionResult<VersionHistoryInfo> {
        self.write(|lsm| {
            use well_known::*;

            let ent = lsm.effective_node_type(node)?;
            if !ent.includes(&MIX_SIMPLE_VERSIONABLE) {
                return Err(VersionError::NotVersionable(*node));
            }
            let history_id = match self.layout.history_of(lsm, node)? {
                Some(existing) => existing,
                None => self.create_history_in(lsm, node, Utc::now())?,
            };
            let history = InternalVersionHistory::load(lsm, &history_id)?;
            if lsm.property(node, &JCR_VERSION_HISTORY)?.is_none() {
                let root = history.root_version();
                lsm.set_property(node, JCR_VERSION_HISTORY, Value::Reference(history_id))?;
                lsm.set_property(node, JCR_BASE_VERSION, Value::Reference(root))?;
                lsm.set_property(node, JCR_IS_CHECKED_OUT, Value::Boolean(true))?;
                if ent.includes(&MIX_VERSIONABLE) {
                    lsm.set_property_values(
                        node,
                        JCR_PREDECESSORS,
                        ValueType::Reference,
                        vec![Value::Reference(root)],
                    )?;
                }
                debug!(node = %node, history = %history_id, "versionable node initialized");
            }
            Ok(VersionHistoryInfo::from(&history))
        })
    }

    // -- checkin / checkout -------------------------------------------------

    /// Create a new version of a node from its current state.
    ///
    /// Nodes with `mix:versionable` grow from their declared predecessors;
    /// nodes that are only `mix:simpleVersionable` grow from their base
    /// version. The version, its frozen node, the predecessor and activity
    /// links, and the node's own versioning properties are written in one
    /// operation.
    pub fn checkin(
        &self,
        node: &NodeId,
        created: Option<DateTime<Utc>>,
    ) -> VersionResult<InternalVersion> {
        let created = created.unwrap_or_else(Utc::now);
        self.write(|lsm| self.checkin_in(lsm, node, created))
    }

    fn checkin_in(
        &self,
        lsm: &mut LocalStateManager,
        node: &NodeId,
        created: DateTime<Utc>,
    ) -> VersionResult<InternalVersion> {
        use well_known::*;

        let data = load_node(lsm, node)?;
        let ent = lsm.effective_node_type(node)?;
        if !ent.includes(&MIX_SIMPLE_VERSIONABLE) {
            return Err(VersionError::NotVersionable(*node));
        }
        let full = ent.includes(&MIX_VERSIONABLE);
        let history_id = self
            .layout
            .history_of(lsm, node)?
            .ok_or_else(|| VersionError::inconsistent(format!("{node} has no version history")))?;
        let history = InternalVersionHistory::load(lsm, &history_id)?;

        let predecessors = if full {
            let declared = node_ids(&load_values(lsm, node, &data, &JCR_PREDECESSORS)?);
            if declared.is_empty() {
                return Err(VersionError::MissingPredecessors { node: *node });
            }
            if let Some(bad) = declared.iter().find(|p| !history.contains(p)) {
                return Err(VersionError::InvalidPredecessor {
                    node: *node,
                    predecessor: *bad,
                });
            }
            declared
        } else {
            let head = node_ids(&load_values(lsm, node, &data, &JCR_BASE_VERSION)?)
                .first()
                .copied()
                .filter(|base| history.contains(base))
                .or_else(|| history.versions().last().map(|(_, id)| *id))
                .ok_or_else(|| VersionError::inconsistent(format!("history {history_id} is empty")))?;
            vec![head]
        };

        let loaded = predecessors
            .iter()
            .map(|p| InternalVersion::load(lsm, p))
            .collect::<VersionResult<Vec<_>>>()?;
        let candidates: Vec<NamingBase<'_>> = loaded
            .iter()
            .map(|v| NamingBase {
                name: v.name().local_name(),
                is_root: v.is_root_version(),
                successor_count: v.successors().len(),
            })
            .collect();
        let base = select_base(&candidates).ok_or(VersionError::MissingPredecessors { node: *node })?;
        let name = Name::local(next_version_name(base, |n| history.has_version_named(n)))?;

        let version = lsm.add_node(&history_id, name.clone(), NT_VERSION, None)?;
        lsm.set_property(&version, JCR_CREATED, Value::Date(created))?;
        lsm.set_property_values(
            &version,
            JCR_PREDECESSORS,
            ValueType::WeakReference,
            predecessors.iter().copied().map(Value::WeakReference).collect(),
        )?;
        lsm.set_property_values(&version, JCR_SUCCESSORS, ValueType::WeakReference, vec![])?;
        for predecessor in &predecessors {
            append_weak(lsm, predecessor, JCR_SUCCESSORS, version)?;
        }

        let frozen = frozen::freeze(lsm, &self.layout, &version, JCR_FROZEN_NODE, node)?;
        if ent.includes(&NT_CONFIGURATION) {
            let root = node_ids(&load_values(lsm, node, &data, &JCR_ROOT)?);
            if let Some(root) = root.first() {
                let bases = frozen::collect_base_versions(lsm, root)?;
                lsm.set_property_values(
                    &frozen,
                    REP_BASE_VERSIONS,
                    ValueType::WeakReference,
                    bases.into_iter().map(Value::WeakReference).collect(),
                )?;
            }
        }

        if let Some(activity) = node_ids(&load_values(lsm, node, &data, &JCR_ACTIVITY)?).first() {
            lsm.set_property(&version, JCR_ACTIVITY, Value::WeakReference(*activity))?;
            append_weak(lsm, activity, REP_VERSIONS, version)?;
        }

        lsm.set_property(node, JCR_IS_CHECKED_OUT, Value::Boolean(false))?;
        lsm.set_property(node, JCR_BASE_VERSION, Value::Reference(version))?;
        if full {
            lsm.set_property_values(node, JCR_PREDECESSORS, ValueType::Reference, vec![])?;
        }

        info!(node = %node, version = %name, "checked in");
        InternalVersion::load(lsm, &version)
    }

    /// Check a node out again, optionally into an activity. Returns the base
    /// version it was checked out from.
    pub fn checkout(&self, node: &NodeId, activity: Option<NodeId>) -> VersionResult<NodeId> {
        self.write(|lsm| {
            use well_known::*;

            let data = load_node(lsm, node)?;
            let ent = lsm.effective_node_type(node)?;
            if !ent.includes(&MIX_SIMPLE_VERSIONABLE) {
                return Err(VersionError::NotVersionable(*node));
            }
            let base = node_ids(&load_values(lsm, node, &data, &JCR_BASE_VERSION)?)
                .first()
                .copied()
                .ok_or_else(|| VersionError::inconsistent(format!("{node} has no base version")))?;
            lsm.set_property(node, JCR_IS_CHECKED_OUT, Value::Boolean(true))?;
            if ent.includes(&MIX_VERSIONABLE) {
                lsm.set_property_values(
                    node,
                    JCR_PREDECESSORS,
                    ValueType::Reference,
                    vec![Value::Reference(base)],
                )?;
            }
            match activity {
                Some(activity) => {
                    if self.layout.activity(lsm, &activity)?.is_none() {
                        return Err(VersionError::NotFound(activity));
                    }
                    lsm.set_property(node, JCR_ACTIVITY, Value::Reference(activity))?;
                }
                None => {
                    lsm.remove_property(node, &JCR_ACTIVITY)?;
                }
            }
            debug!(node = %node, base = %base, "checked out");
            Ok(base)
        })
    }

    // -- activities ---------------------------------------------------------

    pub fn create_activity(&self, title: &str) -> VersionResult<InternalActivity> {
        self.write(|lsm| {
            let id = self.id_factory.new_node_id();
            let activities_root = self.layout.roots().activities_root;
            let directory = self.layout.ensure_directory(
                lsm,
                activities_root,
                &id,
                &well_known::REP_ACTIVITIES,
            )?;
            lsm.add_node(&directory, leaf_name(&id)?, well_known::NT_ACTIVITY, Some(id))?;
            lsm.set_property(&id, well_known::JCR_ACTIVITY_TITLE, Value::from(title))?;
            lsm.set_property_values(&id, well_known::REP_VERSIONS, ValueType::WeakReference, vec![])?;
            info!(activity = %id, title, "created activity");
            InternalActivity::load(lsm, &id)
        })
    }

    /// Remove an activity that no workspace item refers to any more, along
    /// with directories left empty. Its versions are not modified.
    pub fn remove_activity(&self, id: &NodeId) -> VersionResult<()> {
        self.write(|lsm| {
            let activity = InternalActivity::load(lsm, id)?;
            let references = lsm.get_node_references(id)?;
            if references.has_references() {
                return Err(VersionError::ReferentialIntegrity {
                    target: *id,
                    reason: format!("activity is still referenced by {} items", references.len()),
                });
            }
            // Versions keep their weak `jcr:activity`; readers check that the
            // activity still exists.
            let stop = self.layout.roots().activities_root;
            let pruned = self.layout.remove_and_prune(lsm, id, stop)?;
            info!(activity = %id, versions = activity.versions().count(), pruned, "removed activity");
            Ok(())
        })
    }

    // -- removal ------------------------------------------------------------

    /// Remove one version. The graph is reconnected around it and its
    /// labels and activity membership go with it.
    pub fn remove_version(&self, history: &NodeId, name: &Name) -> VersionResult<()> {
        self.write(|lsm| {
            let loaded = InternalVersionHistory::load(lsm, history)?;
            let id = loaded.version(name).ok_or_else(|| VersionError::NoSuchVersion {
                history: *history,
                name: name.clone(),
            })?;
            if id == loaded.root_version() {
                return Err(VersionError::RootVersionProtected(*history));
            }
            if lsm.has_node_references(&id)? {
                return Err(VersionError::ReferentialIntegrity {
                    target: id,
                    reason: format!("version {name} is still referenced"),
                });
            }
            let version = InternalVersion::load(lsm, &id)?;

            for label in version.labels() {
                lsm.remove_property(&loaded.labels_node(), label)?;
            }
            for predecessor in version.predecessors() {
                splice_weak(lsm, predecessor, well_known::JCR_SUCCESSORS, &id, version.successors())?;
            }
            for successor in version.successors() {
                splice_weak(lsm, successor, well_known::JCR_PREDECESSORS, &id, version.predecessors())?;
            }
            if let Some(activity) = version.activity() {
                if self.layout.activity(lsm, &activity)?.is_some() {
                    splice_weak(lsm, &activity, well_known::REP_VERSIONS, &id, &[])?;
                }
            }
            lsm.remove_node(&id)?;
            info!(history = %history, version = %name, "removed version");
            Ok(())
        })
    }

    /// Remove a whole version history once nothing refers to it or to any
    /// of its versions.
    pub fn remove_version_history(&self, history: &NodeId) -> VersionResult<()> {
        self.write(|lsm| {
            let loaded = InternalVersionHistory::load(lsm, history)?;
            if lsm.has_node_references(history)? {
                return Err(VersionError::ReferentialIntegrity {
                    target: *history,
                    reason: "version history is still referenced".into(),
                });
            }
            for (name, id) in loaded.versions() {
                if lsm.has_node_references(id)? {
                    return Err(VersionError::ReferentialIntegrity {
                        target: *id,
                        reason: format!("version {name} is still referenced"),
                    });
                }
            }
            for (_, id) in loaded.versions() {
                let version = InternalVersion::load(lsm, id)?;
                if let Some(activity) = version.activity() {
                    if self.layout.activity(lsm, &activity)?.is_some() {
                        splice_weak(lsm, &activity, well_known::REP_VERSIONS, id, &[])?;
                    }
                }
            }
            let stop = self.layout.roots().storage_root;
            let pruned = self.layout.remove_and_prune(lsm, history, stop)?;
            info!(history = %history, pruned, "removed version history");
            Ok(())
        })
    }

    // -- labels -------------------------------------------------------------

    /// Put `label` on the version `version_name`, or take it off when
    /// `version_name` is `None`. Returns the version that held the label
    /// before. A label held by another version is only moved when
    /// `move_label` is set.
    pub fn set_version_label(
        &self,
        history: &NodeId,
        version_name: Option<&Name>,
        label: &Name,
        move_label: bool,
    ) -> VersionResult<Option<InternalVersion>> {
        self.write(|lsm| {
            let loaded = InternalVersionHistory::load(lsm, history)?;
            let labels = loaded.labels_node();
            let previous = loaded.version_by_label(label);
            let previous_version = previous
                .map(|id| InternalVersion::load(lsm, &id))
                .transpose()?;

            match version_name {
                None => {
                    if previous.is_some() {
                        lsm.remove_property(&labels, label)?;
                        debug!(history = %history, label = %label, "label removed");
                    }
                }
                Some(name) => {
                    let target = loaded.version(name).ok_or_else(|| VersionError::NoSuchVersion {
                        history: *history,
                        name: name.clone(),
                    })?;
                    match &previous_version {
                        Some(holder) if holder.id() == target => {}
                        Some(holder) if !move_label => {
                            return Err(VersionError::LabelExists {
                                label: label.clone(),
                                version: holder.name().clone(),
                            })
                        }
                        _ => {
                            lsm.set_property(&labels, label.clone(), Value::WeakReference(target))?;
                            debug!(history = %history, label = %label, version = %name, "label set");
                        }
                    }
                }
            }
            Ok(previous_version)
        })
    }
}

impl std::fmt::Debug for InternalVersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalVersionManager")
            .field("storage", self.layout.roots())
            .field("config", self.layout.config())
            .finish()
    }
}
