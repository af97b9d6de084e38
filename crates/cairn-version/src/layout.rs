//! Where histories and activities live below their storage roots.
//!
//! Nodes are spread over a fixed number of directory levels named after a
//! hash of the node id, which bounds how many children any one directory
//! collects: `<root>/<aa>/<bb>/<cc>/<node-id>`.

use tracing::{debug, warn};

use cairn_state::{ItemStateManager, LocalStateManager, NodeData};
use cairn_types::{well_known, Name, NodeId, TypeError, Value};

use crate::config::VersioningConfig;
use crate::entity::{load_node, load_values};
use crate::error::{VersionError, VersionResult};

/// Domain tag hashed in front of every id.
const DOMAIN: &str = "cairn-version-storage-v1";

fn digest(id: &NodeId) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(DOMAIN.as_bytes());
    hasher.update(b":");
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Names of the directory levels for `id`, outermost first.
pub fn directory_names(id: &NodeId, config: &VersioningConfig) -> Result<Vec<Name>, TypeError> {
    let (depth, width) = config.fanout();
    let digest = digest(id);
    (0..depth)
        .map(|level| Name::local(&digest[level * width..(level + 1) * width]))
        .collect()
}

/// The name of the history or activity node itself.
pub fn leaf_name(id: &NodeId) -> Result<Name, TypeError> {
    Name::local(id.to_string())
}

/// The two storage roots below `jcr:system`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionStorage {
    pub storage_root: NodeId,
    pub activities_root: NodeId,
    /// Directory depth and width the storage was created with. Recorded on
    /// the storage root and used for every later lookup.
    pub fanout: (usize, usize),
}

impl VersionStorage {
    /// Create both roots below the system node in the current epoch.
    pub fn create(
        lsm: &mut LocalStateManager,
        system: &NodeId,
        config: &VersioningConfig,
    ) -> VersionResult<Self> {
        let storage_root = lsm.add_node(
            system,
            well_known::JCR_VERSION_STORAGE,
            well_known::REP_VERSION_STORAGE,
            None,
        )?;
        let activities_root = lsm.add_node(
            system,
            well_known::JCR_ACTIVITIES,
            well_known::REP_ACTIVITIES,
            None,
        )?;
        let fanout = config.fanout();
        lsm.set_property(&storage_root, well_known::REP_FANOUT_DEPTH, Value::Long(fanout.0 as i64))?;
        lsm.set_property(&storage_root, well_known::REP_FANOUT_WIDTH, Value::Long(fanout.1 as i64))?;
        Ok(Self {
            storage_root,
            activities_root,
            fanout,
        })
    }

    /// Find both roots below the system node.
    pub fn locate<S>(states: &S, system: &NodeId) -> VersionResult<Option<Self>>
    where
        S: ItemStateManager + ?Sized,
    {
        let data = load_node(states, system)?;
        let storage = data.children.get(&well_known::JCR_VERSION_STORAGE, 1);
        let activities = data.children.get(&well_known::JCR_ACTIVITIES, 1);
        let (Some(storage), Some(activities)) = (storage, activities) else {
            return Ok(None);
        };
        let root = load_node(states, &storage.id)?;
        let depth = recorded_size(states, &storage.id, &root, &well_known::REP_FANOUT_DEPTH)?;
        let width = recorded_size(states, &storage.id, &root, &well_known::REP_FANOUT_WIDTH)?;
        Ok(Some(Self {
            storage_root: storage.id,
            activities_root: activities.id,
            fanout: (depth, width),
        }))
    }
}

fn recorded_size<S>(states: &S, root: &NodeId, data: &NodeData, name: &Name) -> VersionResult<usize>
where
    S: ItemStateManager + ?Sized,
{
    match load_values(states, root, data, name)?.first() {
        Some(Value::Long(n)) if *n >= 0 => Ok(*n as usize),
        _ => Err(VersionError::inconsistent(format!(
            "version storage {root} has no valid {name}"
        ))),
    }
}

/// Path arithmetic over the version storage.
#[derive(Clone, Debug)]
pub(crate) struct StorageLayout {
    roots: VersionStorage,
    config: VersioningConfig,
}

impl StorageLayout {
    /// The fanout recorded in `roots` wins over the configured one.
    pub(crate) fn new(roots: VersionStorage, mut config: VersioningConfig) -> Self {
        if config.fanout() != roots.fanout {
            warn!(
                configured = ?config.fanout(),
                recorded = ?roots.fanout,
                "ignoring configured fanout for existing version storage"
            );
        }
        (config.fanout_depth, config.fanout_width) = roots.fanout;
        Self { roots, config }
    }

    pub(crate) fn roots(&self) -> &VersionStorage {
        &self.roots
    }

    pub(crate) fn config(&self) -> &VersioningConfig {
        &self.config
    }

    fn locate<S>(&self, states: &S, root: NodeId, id: &NodeId) -> VersionResult<Option<NodeId>>
    where
        S: ItemStateManager + ?Sized,
    {
        let mut names = directory_names(id, &self.config)?;
        names.push(leaf_name(id)?);
        let mut current = root;
        for name in &names {
            match load_node(states, &current)?.children.get(name, 1) {
                Some(entry) => current = entry.id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// The version history of a versionable node, if one exists.
    pub(crate) fn history_of<S>(&self, states: &S, node: &NodeId) -> VersionResult<Option<NodeId>>
    where
        S: ItemStateManager + ?Sized,
    {
        self.locate(states, self.roots.storage_root, node)
    }

    pub(crate) fn activity<S>(&self, states: &S, activity: &NodeId) -> VersionResult<Option<NodeId>>
    where
        S: ItemStateManager + ?Sized,
    {
        self.locate(states, self.roots.activities_root, activity)
    }

    /// The directory a new history or activity for `id` goes into,
    /// created as needed.
    pub(crate) fn ensure_directory(
        &self,
        lsm: &mut LocalStateManager,
        root: NodeId,
        id: &NodeId,
        directory_type: &Name,
    ) -> VersionResult<NodeId> {
        let mut current = root;
        for name in directory_names(id, &self.config)? {
            current = match lsm.child_node_id(&current, &name, 1)? {
                Some(existing) => existing,
                None => lsm.add_node(&current, name, directory_type.clone(), None)?,
            };
        }
        Ok(current)
    }

    /// Remove a node, then every ancestor directory left empty, stopping
    /// below `stop`.
    pub(crate) fn remove_and_prune(
        &self,
        lsm: &mut LocalStateManager,
        id: &NodeId,
        stop: NodeId,
    ) -> VersionResult<usize> {
        let mut parent = load_node(lsm, id)?
            .parent_id
            .ok_or_else(|| VersionError::inconsistent(format!("{id} has no parent")))?;
        lsm.remove_node(id)?;
        let mut pruned = 0;
        while parent != stop {
            let data = load_node(lsm, &parent)?;
            if !data.children.is_empty() {
                break;
            }
            let next = data
                .parent_id
                .ok_or_else(|| VersionError::inconsistent(format!("{parent} is outside the storage root")))?;
            debug!(directory = %parent, "pruning empty storage directory");
            lsm.remove_node(&parent)?;
            pruned += 1;
            parent = next;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable_hex_pairs() {
        let id = NodeId::new();
        let config = VersioningConfig::default();
        let first = directory_names(&id, &config).unwrap();
        let second = directory_names(&id, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        for name in &first {
            assert_eq!(name.local_name().len(), 2);
            assert!(name.local_name().chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_eq!(leaf_name(&id).unwrap().to_string(), id.to_string());
    }

    #[test]
    fn fanout_follows_config() {
        let id = NodeId::new();
        let config = VersioningConfig {
            fanout_depth: 2,
            fanout_width: 4,
            lock_timeout_ms: None,
        };
        let names = directory_names(&id, &config).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n.local_name().len() == 4));
    }
}
