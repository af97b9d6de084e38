//! The repository context: one persistence backend, the node type registry,
//! the version manager, and the workspaces sharing them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use cairn_state::{
    IdFactory, InMemoryNodeTypeRegistry, InMemoryPersistenceManager, ItemStateManager,
    JournalPersistenceManager, LocalStateManager, NodeData, PersistenceManager,
    SharedItemStateManager, UpdatableItemStateManager, UuidIdFactory, WriteOperation,
};
use cairn_types::{well_known, ItemId, Name, NodeId};
use cairn_version::{InternalVersionManager, VersionStorage};

use crate::config::RepositoryConfig;
use crate::error::{RepoError, RepoResult};
use crate::workspace::Workspace;

/// Ids of the nodes every repository starts with.
struct Layout {
    system: NodeId,
    storage: VersionStorage,
    workspaces: BTreeMap<String, NodeId>,
}

/// A content repository.
///
/// Everything a workspace needs is owned here and handed down explicitly;
/// there is no global state.
pub struct Repository {
    config: RepositoryConfig,
    persistence: Arc<dyn PersistenceManager>,
    shared: SharedItemStateManager,
    id_factory: Arc<dyn IdFactory>,
    node_types: Arc<InMemoryNodeTypeRegistry>,
    versions: InternalVersionManager,
    system: NodeId,
    workspaces: BTreeMap<String, NodeId>,
}

impl Repository {
    /// Open a repository on the configured journal, or in memory if none is
    /// configured.
    pub fn open(config: RepositoryConfig) -> RepoResult<Self> {
        let persistence: Arc<dyn PersistenceManager> = match &config.journal {
            Some(journal) => Arc::new(JournalPersistenceManager::open(&journal.path, journal.sync_mode)?),
            None => Arc::new(InMemoryPersistenceManager::new()),
        };
        Self::with_persistence(config, persistence)
    }

    /// Open a repository on an existing backend, creating the root, the
    /// system node, the version storage and any missing workspace roots.
    pub fn with_persistence(
        config: RepositoryConfig,
        persistence: Arc<dyn PersistenceManager>,
    ) -> RepoResult<Self> {
        config.validate()?;
        let shared = SharedItemStateManager::new(persistence.clone());
        let id_factory: Arc<dyn IdFactory> = Arc::new(UuidIdFactory);
        let node_types = Arc::new(InMemoryNodeTypeRegistry::new());

        let mut lsm = LocalStateManager::new(shared.clone(), id_factory.clone(), node_types.clone());
        let layout = bootstrap(&mut lsm, &config)?;
        let versions = InternalVersionManager::new(
            shared.clone(),
            id_factory.clone(),
            node_types.clone(),
            layout.storage,
            config.versioning.clone(),
        );
        info!(
            workspaces = layout.workspaces.len(),
            storage_root = %layout.storage.storage_root,
            "repository opened"
        );
        Ok(Self {
            config,
            persistence,
            shared,
            id_factory,
            node_types,
            versions,
            system: layout.system,
            workspaces: layout.workspaces,
        })
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceManager> {
        &self.persistence
    }

    /// Register custom node types here before using them.
    pub fn node_types(&self) -> &Arc<InMemoryNodeTypeRegistry> {
        &self.node_types
    }

    pub fn versions(&self) -> &InternalVersionManager {
        &self.versions
    }

    pub fn system_node(&self) -> NodeId {
        self.system
    }

    pub fn workspace_names(&self) -> impl Iterator<Item = &str> {
        self.workspaces.keys().map(String::as_str)
    }

    /// Open a workspace as `user_id`. `None` selects the default workspace.
    pub fn login(&self, user_id: &str, workspace: Option<&str>) -> RepoResult<Workspace<'_>> {
        let name = workspace.unwrap_or(&self.config.default_workspace);
        let root = *self
            .workspaces
            .get(name)
            .ok_or_else(|| RepoError::NoSuchWorkspace(name.to_string()))?;
        debug!(workspace = name, user = user_id, "login");
        Ok(Workspace::new(self, name, user_id, root))
    }

    pub(crate) fn shared(&self) -> &SharedItemStateManager {
        &self.shared
    }

    /// A fresh local state manager for one session.
    pub(crate) fn new_session(&self) -> LocalStateManager {
        LocalStateManager::new(
            self.shared.clone(),
            self.id_factory.clone(),
            self.node_types.clone(),
        )
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("workspaces", &self.workspaces)
            .field("system", &self.system)
            .finish()
    }
}

fn bootstrap(lsm: &mut LocalStateManager, config: &RepositoryConfig) -> RepoResult<Layout> {
    use well_known::*;

    let mut op = WriteOperation::start(lsm)?;
    if !op.has_item_state(&ItemId::Node(NodeId::ROOT))? {
        info!("initializing empty repository");
        op.create_new_node(NodeId::ROOT, NodeData::new(None, ROOT, REP_ROOT))?;
    }
    let system = match op.child_node_id(&NodeId::ROOT, &JCR_SYSTEM, 1)? {
        Some(existing) => existing,
        None => op.add_node(&NodeId::ROOT, JCR_SYSTEM, REP_SYSTEM, None)?,
    };
    let storage = match VersionStorage::locate(&*op, &system)? {
        Some(existing) => existing,
        None => VersionStorage::create(&mut op, &system, &config.versioning)?,
    };
    let mut workspaces = BTreeMap::new();
    for name in &config.workspaces {
        let node_name = Name::local(name.as_str())?;
        let root = match op.child_node_id(&NodeId::ROOT, &node_name, 1)? {
            Some(existing) => existing,
            None => {
                debug!(workspace = %name, "creating workspace root");
                op.add_node(&NodeId::ROOT, node_name, REP_WORKSPACE, None)?
            }
        };
        workspaces.insert(name.clone(), root);
    }
    let summary = op.save()?;
    debug!(added = summary.added.len(), "bootstrap complete");
    Ok(Layout {
        system,
        storage,
        workspaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn two_workspaces() -> RepositoryConfig {
        RepositoryConfig {
            workspaces: vec!["default".into(), "staging".into()],
            ..RepositoryConfig::default()
        }
    }

    #[test]
    fn bootstrap_creates_system_layout() {
        init_tracing();
        let pm = Arc::new(InMemoryPersistenceManager::new());
        let repo = Repository::with_persistence(two_workspaces(), pm.clone()).unwrap();
        assert_eq!(repo.workspace_names().collect::<Vec<_>>(), vec!["default", "staging"]);

        let lsm = repo.new_session();
        let root = lsm.node_data(&NodeId::ROOT).unwrap();
        assert_eq!(root.primary_type, well_known::REP_ROOT);
        assert_eq!(root.children.len(), 3);
        let system = lsm.node_data(&repo.system_node()).unwrap();
        assert_eq!(system.primary_type, well_known::REP_SYSTEM);
        let storage = VersionStorage::locate(&lsm, &repo.system_node()).unwrap().unwrap();
        assert_eq!(&storage, repo.versions().storage());
    }

    #[test]
    fn reopening_finds_the_same_layout() {
        init_tracing();
        let pm = Arc::new(InMemoryPersistenceManager::new());
        let first = Repository::with_persistence(RepositoryConfig::default(), pm.clone()).unwrap();
        let before = pm.snapshot().unwrap();

        let second = Repository::with_persistence(RepositoryConfig::default(), pm.clone()).unwrap();
        assert_eq!(pm.snapshot().unwrap(), before);
        assert_eq!(second.system_node(), first.system_node());
        assert_eq!(second.versions().storage(), first.versions().storage());

        // a newly configured workspace is added next to the existing ones
        let third = Repository::with_persistence(two_workspaces(), pm.clone()).unwrap();
        assert_eq!(third.workspace_names().count(), 2);
        assert_eq!(third.system_node(), first.system_node());
    }

    #[test]
    fn recorded_fanout_survives_config_changes() {
        init_tracing();
        let pm = Arc::new(InMemoryPersistenceManager::new());
        let first = Repository::with_persistence(RepositoryConfig::default(), pm.clone()).unwrap();
        let (doc, history) = {
            let mut ws = first.login("alice", None).unwrap();
            let doc = ws.add_versionable("/", "doc").unwrap();
            ws.checkin("/doc").unwrap();
            (doc, ws.version_history("/doc").unwrap().id())
        };
        assert_eq!(first.versions().storage().fanout, (3, 2));

        let mut config = RepositoryConfig::default();
        config.versioning.fanout_depth = 1;
        config.versioning.fanout_width = 4;
        let second = Repository::with_persistence(config, pm.clone()).unwrap();
        assert_eq!(second.versions().storage().fanout, (3, 2));
        assert_eq!(second.versions().config().fanout_depth, 3);

        let found = second.versions().get_version_history_of_node(&doc).unwrap().unwrap();
        assert_eq!(found.id(), history);
        let info = second.versions().initialize_versionable(&doc).unwrap();
        assert_eq!(info.history, history);
    }

    #[test]
    fn unknown_workspace() {
        let repo = Repository::open(RepositoryConfig::default()).unwrap();
        assert!(matches!(
            repo.login("alice", Some("nope")),
            Err(RepoError::NoSuchWorkspace(name)) if name == "nope"
        ));
        assert_eq!(repo.login("alice", None).unwrap().name(), "default");
    }

    #[test]
    fn invalid_config_is_rejected_before_opening() {
        let config = RepositoryConfig {
            default_workspace: "missing".into(),
            ..RepositoryConfig::default()
        };
        assert!(matches!(Repository::open(config), Err(RepoError::Config(_))));
    }
}
