//! Workspace handles.
//!
//! A [`Workspace`] is one user's view of one workspace: reads resolve paths
//! through a hierarchy tree and its item state factory, writes go through a
//! private local state manager, and versioning calls are forwarded to the
//! repository's version manager. Every workspace owns a distinct root
//! subtree; the version storage is shared by all of them.
//!
//! Each handle observes the repository's committed changes, so entries it
//! has loaded are refetched after any session saves them.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use cairn_hierarchy::{HierarchyTree, ItemStateFactory, PersistenceInfoSource, SessionContext};
use cairn_state::{LocalStateManager, NodeData, ObserverHandle, PropertyData, WriteOperation};
use cairn_types::{well_known, Name, NodeId, Path, Value};
use cairn_version::{InternalActivity, InternalVersion, InternalVersionHistory, VersionError};

use crate::error::{RepoError, RepoResult};
use crate::repository::Repository;

/// One edit epoch of a workspace. Saved with
/// [`save`](WriteOperation::save); dropping it unsaved discards every change.
pub type WorkspaceEdit<'a> = WriteOperation<&'a mut LocalStateManager>;

/// A node as read from a workspace.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub path: Path,
    pub data: NodeData,
}

impl Node {
    pub fn name(&self) -> &Name {
        &self.data.name
    }

    pub fn primary_type(&self) -> &Name {
        &self.data.primary_type
    }

    pub fn child_names(&self) -> Vec<Name> {
        self.data.children.iter().map(|c| c.name).collect()
    }
}

pub struct Workspace<'r> {
    repository: &'r Repository,
    name: String,
    root: NodeId,
    session: LocalStateManager,
    tree: HierarchyTree,
    factory: ItemStateFactory,
    activity: Option<NodeId>,
    _invalidation: ObserverHandle,
}

impl<'r> Workspace<'r> {
    pub(crate) fn new(repository: &'r Repository, name: &str, user_id: &str, root: NodeId) -> Self {
        let source = Arc::new(PersistenceInfoSource::new(
            repository.persistence().clone(),
            root,
        ));
        let factory = ItemStateFactory::new(
            source,
            SessionContext::new(name, user_id),
            &repository.config().cache,
        );
        let tree = HierarchyTree::new(root);
        let invalidation = repository.shared().observe(tree.invalidator());
        Self {
            repository,
            name: name.to_string(),
            root,
            session: repository.new_session(),
            tree,
            factory,
            activity: None,
            _invalidation: invalidation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn user_id(&self) -> &str {
        &self.factory.session().user_id
    }

    /// The activity new checkouts are recorded in.
    pub fn activity(&self) -> Option<NodeId> {
        self.activity
    }

    // -- reads --------------------------------------------------------------

    /// The node at an absolute workspace path.
    pub fn node(&self, path: &str) -> RepoResult<Node> {
        let path = Path::from_str(path)?;
        let entry = self.factory.resolve_path(&self.tree, &path)?;
        let state = self.factory.resolve_node(&entry)?;
        Ok(Node {
            id: entry.id(),
            path: entry.workspace_path(),
            data: state.node()?.clone(),
        })
    }

    pub fn node_id(&self, path: &str) -> RepoResult<NodeId> {
        Ok(self.node(path)?.id)
    }

    pub fn property(&self, path: &str, name: &Name) -> RepoResult<Option<PropertyData>> {
        let id = self.node_id(path)?;
        Ok(self.session.property(&id, name)?)
    }

    // -- writes -------------------------------------------------------------

    /// Start an edit epoch on this workspace.
    pub fn edit(&mut self) -> RepoResult<WorkspaceEdit<'_>> {
        Ok(WriteOperation::start(&mut self.session)?)
    }

    /// Add an `nt:unstructured` child below the node at `parent`.
    pub fn add_node(&mut self, parent: &str, name: &str) -> RepoResult<NodeId> {
        let parent = self.node_id(parent)?;
        let name = Name::local(name)?;
        let mut edit = self.edit()?;
        let id = edit.add_node(&parent, name, well_known::NT_UNSTRUCTURED, None)?;
        edit.save()?;
        Ok(id)
    }

    pub fn set_property(&mut self, path: &str, name: Name, value: Value) -> RepoResult<()> {
        let id = self.node_id(path)?;
        let mut edit = self.edit()?;
        edit.set_property(&id, name, value)?;
        edit.save()?;
        Ok(())
    }

    /// Add a versioning mixin to the node at `path` and give it a version
    /// history.
    pub fn make_versionable(&mut self, path: &str, mixin: Name) -> RepoResult<NodeId> {
        let id = self.node_id(path)?;
        let mut edit = self.edit()?;
        edit.add_mixin(&id, mixin)?;
        edit.save()?;
        self.repository.versions().initialize_versionable(&id)?;
        Ok(id)
    }

    /// Add a child node that is `mix:versionable` from the start.
    pub fn add_versionable(&mut self, parent: &str, name: &str) -> RepoResult<NodeId> {
        let parent_id = self.node_id(parent)?;
        let name = Name::local(name)?;
        let mut edit = self.edit()?;
        let id = edit.add_node(&parent_id, name, well_known::NT_UNSTRUCTURED, None)?;
        edit.add_mixin(&id, well_known::MIX_VERSIONABLE)?;
        edit.save()?;
        let history = self.repository.versions().initialize_versionable(&id)?;
        info!(node = %id, history = %history.history, "versionable node added");
        Ok(id)
    }

    // -- versioning ---------------------------------------------------------

    fn versionable(&self, path: &str) -> RepoResult<NodeId> {
        let node = self.node(path)?;
        let ent = self.session.effective_node_type(&node.id)?;
        if !ent.includes(&well_known::MIX_SIMPLE_VERSIONABLE) {
            return Err(RepoError::NotVersionable(node.path));
        }
        Ok(node.id)
    }

    fn is_checked_out(&self, id: &NodeId) -> RepoResult<bool> {
        Ok(self
            .session
            .property_value(id, &well_known::JCR_IS_CHECKED_OUT)?
            .and_then(|v| v.as_bool())
            .unwrap_or(true))
    }

    /// The version the node at `path` was last checked in as, or checked
    /// out from.
    pub fn base_version(&self, path: &str) -> RepoResult<InternalVersion> {
        let id = self.versionable(path)?;
        let base = self
            .session
            .property_value(&id, &well_known::JCR_BASE_VERSION)?
            .and_then(|v| v.as_node_id().copied())
            .ok_or_else(|| VersionError::InconsistentVersioningState(format!("{id} has no base version")))?;
        Ok(self.repository.versions().get_version(&base)?)
    }

    /// Check the node in. A node that is already checked in is left alone
    /// and its base version returned.
    pub fn checkin(&mut self, path: &str) -> RepoResult<InternalVersion> {
        let id = self.versionable(path)?;
        if !self.is_checked_out(&id)? {
            debug!(node = %id, "already checked in");
            return self.base_version(path);
        }
        Ok(self.repository.versions().checkin(&id, None)?)
    }

    /// Check the node out into the current activity. Returns the base
    /// version; a node that is already checked out is left alone.
    pub fn checkout(&mut self, path: &str) -> RepoResult<NodeId> {
        let id = self.versionable(path)?;
        if self.is_checked_out(&id)? {
            return Ok(self.base_version(path)?.id());
        }
        Ok(self.repository.versions().checkout(&id, self.activity)?)
    }

    pub fn version_history(&self, path: &str) -> RepoResult<InternalVersionHistory> {
        let id = self.versionable(path)?;
        self.repository
            .versions()
            .get_version_history_of_node(&id)?
            .ok_or_else(|| VersionError::InconsistentVersioningState(format!("{id} has no version history")).into())
    }

    /// Label a version of the node's history, or remove a label when
    /// `version` is `None`. Returns the version that held the label before.
    pub fn set_version_label(
        &mut self,
        path: &str,
        version: Option<&Name>,
        label: &Name,
        move_label: bool,
    ) -> RepoResult<Option<InternalVersion>> {
        let history = self.version_history(path)?;
        Ok(self
            .repository
            .versions()
            .set_version_label(&history.id(), version, label, move_label)?)
    }

    pub fn remove_version(&mut self, path: &str, version: &Name) -> RepoResult<()> {
        let history = self.version_history(path)?;
        self.repository.versions().remove_version(&history.id(), version)?;
        Ok(())
    }

    pub fn create_activity(&self, title: &str) -> RepoResult<InternalActivity> {
        Ok(self.repository.versions().create_activity(title)?)
    }

    /// Remove an activity. It stops being this workspace's current activity.
    pub fn remove_activity(&mut self, id: &NodeId) -> RepoResult<()> {
        self.repository.versions().remove_activity(id)?;
        if self.activity == Some(*id) {
            self.activity = None;
        }
        Ok(())
    }

    /// Make `activity` current for later checkouts. Returns the previous one.
    pub fn set_activity(&mut self, activity: Option<NodeId>) -> RepoResult<Option<NodeId>> {
        if let Some(id) = activity {
            if !self.repository.versions().has_activity(&id)? {
                return Err(VersionError::NotFound(id).into());
            }
        }
        debug!(workspace = %self.name, activity = ?activity, "current activity changed");
        Ok(std::mem::replace(&mut self.activity, activity))
    }
}

impl std::fmt::Debug for Workspace<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("activity", &self.activity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use cairn_hierarchy::HierarchyError;
    use cairn_state::{InMemoryPersistenceManager, PersistenceManager, StateError};
    use cairn_types::ItemId;

    use crate::config::{JournalConfig, RepositoryConfig};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn name(s: &str) -> Name {
        Name::local(s).unwrap()
    }

    fn in_memory() -> (Arc<InMemoryPersistenceManager>, Repository) {
        init_tracing();
        let pm = Arc::new(InMemoryPersistenceManager::new());
        let config = RepositoryConfig {
            workspaces: vec!["default".into(), "staging".into()],
            ..RepositoryConfig::default()
        };
        let repo = Repository::with_persistence(config, pm.clone()).unwrap();
        (pm, repo)
    }

    #[test]
    fn read_after_write() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        assert_eq!(ws.user_id(), "alice");
        let root = ws.node("/").unwrap();
        assert_eq!(root.id, ws.root_id());
        assert!(root.child_names().is_empty());

        let docs = ws.add_node("/", "docs").unwrap();
        let readme = ws.add_node("/docs", "readme").unwrap();
        ws.set_property("/docs/readme", name("title"), Value::from("Hello")).unwrap();

        assert_eq!(ws.node("/").unwrap().child_names(), vec![name("docs")]);
        let node = ws.node("/docs/readme").unwrap();
        assert_eq!(node.id, readme);
        assert_eq!(node.path.to_string(), "/docs/readme");
        assert_eq!(node.data.parent_id, Some(docs));
        assert_eq!(
            ws.property("/docs/readme", &name("title")).unwrap().unwrap().value(),
            Some(&Value::from("Hello"))
        );
    }

    #[test]
    fn failed_save_leaves_storage_untouched() {
        let (pm, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_node("/", "docs").unwrap();
        let docs = ws.node_id("/docs").unwrap();
        let before = pm.snapshot().unwrap();

        pm.fail_next_store("disk full");
        let mut edit = ws.edit().unwrap();
        let draft = edit.add_node(&docs, name("draft"), well_known::NT_UNSTRUCTURED, None).unwrap();
        edit.set_property(&draft, name("body"), Value::from("text")).unwrap();
        edit.set_property(&docs, name("count"), Value::Long(1)).unwrap();
        assert!(edit.save().is_err());

        assert_eq!(pm.snapshot().unwrap(), before);
        assert!(!pm.exists(&ItemId::Node(draft)).unwrap());
        assert!(matches!(
            ws.node("/docs/draft"),
            Err(RepoError::Hierarchy(HierarchyError::PathNotFound(_)))
        ));
        // the session is usable again
        ws.add_node("/docs", "draft").unwrap();
    }

    #[test]
    fn dropped_edit_is_cancelled() {
        let (pm, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        let before = pm.snapshot().unwrap();
        {
            let root = ws.root_id();
            let mut edit = ws.edit().unwrap();
            edit.add_node(&root, name("scratch"), well_known::NT_UNSTRUCTURED, None).unwrap();
        }
        assert_eq!(pm.snapshot().unwrap(), before);
        assert!(ws.node("/scratch").is_err());
    }

    #[test]
    fn workspaces_are_isolated() {
        let (_, repo) = in_memory();
        let mut default = repo.login("alice", Some("default")).unwrap();
        let staging = repo.login("bob", Some("staging")).unwrap();
        assert_ne!(default.root_id(), staging.root_id());

        default.add_node("/", "shared").unwrap();
        assert!(default.node("/shared").is_ok());
        assert!(matches!(
            staging.node("/shared"),
            Err(RepoError::Hierarchy(HierarchyError::PathNotFound(_)))
        ));
    }

    #[test]
    fn saves_from_other_sessions_are_visible() {
        let (_, repo) = in_memory();
        let mut writer = repo.login("alice", None).unwrap();
        let reader = repo.login("bob", None).unwrap();
        let docs = writer.add_node("/", "docs").unwrap();

        let before = reader.node("/docs").unwrap();
        assert_eq!(before.id, docs);
        assert!(before.child_names().is_empty());
        assert!(!before.data.property_names.contains(&name("title")));

        writer.set_property("/docs", name("title"), Value::from("Docs")).unwrap();
        let child = writer.add_node("/docs", "child").unwrap();

        let after = reader.node("/docs").unwrap();
        assert!(after.data.property_names.contains(&name("title")));
        assert_eq!(after.child_names(), vec![name("child")]);
        assert!(reader.property("/docs", &name("title")).unwrap().is_some());
        assert_eq!(reader.node_id("/docs/child").unwrap(), child);
    }

    #[test]
    fn checkin_and_checkout_cycle() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_versionable("/", "doc").unwrap();

        let v1 = ws.checkin("/doc").unwrap();
        assert_eq!(v1.name(), &name("1.0"));
        // a second checkin is a no-op
        assert_eq!(ws.checkin("/doc").unwrap().id(), v1.id());

        assert_eq!(ws.checkout("/doc").unwrap(), v1.id());
        assert_eq!(ws.checkout("/doc").unwrap(), v1.id());
        let v2 = ws.checkin("/doc").unwrap();
        assert_eq!(v2.name(), &name("1.1"));
        assert_eq!(v2.predecessors(), &[v1.id()]);

        let history = ws.version_history("/doc").unwrap();
        assert_eq!(history.num_versions(), 3);
        assert_eq!(ws.base_version("/doc").unwrap().id(), v2.id());
    }

    #[test]
    fn simple_versionable_nodes() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_node("/", "note").unwrap();
        assert!(matches!(ws.checkin("/note"), Err(RepoError::NotVersionable(_))));

        ws.make_versionable("/note", well_known::MIX_SIMPLE_VERSIONABLE).unwrap();
        assert_eq!(ws.checkin("/note").unwrap().name(), &name("1.0"));
        ws.checkout("/note").unwrap();
        assert_eq!(ws.checkin("/note").unwrap().name(), &name("1.1"));
        assert!(ws.property("/note", &well_known::JCR_PREDECESSORS).unwrap().is_none());
    }

    #[test]
    fn labels_through_the_workspace() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_versionable("/", "doc").unwrap();
        let v1 = ws.checkin("/doc").unwrap();
        let release = name("release");

        assert!(ws.set_version_label("/doc", Some(v1.name()), &release, false).unwrap().is_none());
        let history = ws.version_history("/doc").unwrap();
        assert_eq!(history.version_by_label(&release), Some(v1.id()));
        assert_eq!(
            ws.set_version_label("/doc", None, &release, false).unwrap().map(|v| v.id()),
            Some(v1.id())
        );
    }

    #[test]
    fn checkouts_join_the_current_activity() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_versionable("/", "doc").unwrap();
        ws.checkin("/doc").unwrap();

        let activity = ws.create_activity("spring cleaning").unwrap();
        assert_eq!(ws.set_activity(Some(activity.id())).unwrap(), None);
        ws.checkout("/doc").unwrap();
        let version = ws.checkin("/doc").unwrap();
        assert_eq!(version.activity(), Some(activity.id()));

        // the checked-in node still names the activity
        assert!(matches!(
            ws.remove_activity(&activity.id()),
            Err(RepoError::Version(VersionError::ReferentialIntegrity { .. }))
        ));

        assert_eq!(ws.set_activity(None).unwrap(), Some(activity.id()));
        ws.checkout("/doc").unwrap();
        assert!(ws.property("/doc", &well_known::JCR_ACTIVITY).unwrap().is_none());
        ws.remove_activity(&activity.id()).unwrap();
        assert!(!repo.versions().has_activity(&activity.id()).unwrap());

        assert!(matches!(
            ws.set_activity(Some(activity.id())),
            Err(RepoError::Version(VersionError::NotFound(_)))
        ));
    }

    #[test]
    fn removing_a_version() {
        let (_, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_versionable("/", "doc").unwrap();
        let v1 = ws.checkin("/doc").unwrap();
        ws.checkout("/doc").unwrap();
        let v2 = ws.checkin("/doc").unwrap();

        assert!(matches!(
            ws.remove_version("/doc", v2.name()),
            Err(RepoError::Version(VersionError::ReferentialIntegrity { .. }))
        ));
        ws.remove_version("/doc", v1.name()).unwrap();
        let history = ws.version_history("/doc").unwrap();
        assert!(!history.contains(&v1.id()));
        assert_eq!(
            repo.versions().get_version(&v2.id()).unwrap().predecessors(),
            &[history.root_version()]
        );
    }

    #[test]
    fn version_storage_is_shared_between_workspaces() {
        let (_, repo) = in_memory();
        let mut default = repo.login("alice", Some("default")).unwrap();
        let mut staging = repo.login("bob", Some("staging")).unwrap();
        default.add_versionable("/", "doc").unwrap();
        staging.add_versionable("/", "doc").unwrap();
        let a = default.checkin("/doc").unwrap();
        let b = staging.checkin("/doc").unwrap();
        assert_ne!(a.history(), b.history());

        let activity = default.create_activity("cross").unwrap();
        staging.set_activity(Some(activity.id())).unwrap();
        staging.checkout("/doc").unwrap();
        let b2 = staging.checkin("/doc").unwrap();
        let loaded = repo.versions().get_activity(&activity.id()).unwrap();
        assert_eq!(loaded.latest_version_of(&b.history()), Some(b2.id()));
    }

    #[test]
    fn journal_survives_reopen() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let config = RepositoryConfig {
            journal: Some(JournalConfig {
                path: dir.path().join("items.journal"),
                sync_mode: Default::default(),
            }),
            ..RepositoryConfig::default()
        };

        let first_version = {
            let repo = Repository::open(config.clone()).unwrap();
            let mut ws = repo.login("alice", None).unwrap();
            ws.add_versionable("/", "doc").unwrap();
            ws.checkin("/doc").unwrap().id()
        };

        let repo = Repository::open(config).unwrap();
        let mut ws = repo.login("alice", None).unwrap();
        assert_eq!(ws.base_version("/doc").unwrap().id(), first_version);
        ws.checkout("/doc").unwrap();
        assert_eq!(ws.checkin("/doc").unwrap().name(), &name("1.1"));
    }

    #[test]
    fn version_writes_refuse_dangling_state() {
        let (pm, repo) = in_memory();
        let mut ws = repo.login("alice", None).unwrap();
        ws.add_versionable("/", "doc").unwrap();
        let before = pm.snapshot().unwrap();

        pm.fail_next_store("device unplugged");
        assert!(matches!(
            ws.checkin("/doc"),
            Err(RepoError::Version(VersionError::State(StateError::Storage(_))))
        ));
        assert_eq!(pm.snapshot().unwrap(), before);
        assert_eq!(ws.checkin("/doc").unwrap().name(), &name("1.0"));
    }
}
