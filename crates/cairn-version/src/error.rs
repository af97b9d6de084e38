use std::time::Duration;

use cairn_state::StateError;
use cairn_types::{Name, NodeId, TypeError};

/// Errors from version storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// No version storage item with this id.
    #[error("version item not found: {0}")]
    NotFound(NodeId),

    /// The item exists but is something else.
    #[error("{id} is not a {expected}")]
    WrongItemType { id: NodeId, expected: &'static str },

    #[error("node {0} is not versionable")]
    NotVersionable(NodeId),

    /// A fully versionable node has no `jcr:predecessors` to check in from.
    #[error("cannot check in {node}: missing predecessors")]
    MissingPredecessors { node: NodeId },

    #[error("cannot check in {node}: predecessor {predecessor} is not a version of its history")]
    InvalidPredecessor { node: NodeId, predecessor: NodeId },

    #[error("version history {history} has no version named {name}")]
    NoSuchVersion { history: NodeId, name: Name },

    /// The label is already held by another version and `move` was not set.
    #[error("label {label} already exists on version {version}")]
    LabelExists { label: Name, version: Name },

    #[error("the root version of history {0} cannot be removed")]
    RootVersionProtected(NodeId),

    /// The item is still strongly referenced.
    #[error("referential integrity violation on {target}: {reason}")]
    ReferentialIntegrity { target: NodeId, reason: String },

    /// The version storage is missing something it must contain.
    #[error("inconsistent versioning state: {0}")]
    InconsistentVersioningState(String),

    /// A child item with the `Abort` on-parent-version action exists.
    #[error("checkin of {node} aborted by item {item}")]
    CheckinAborted { node: NodeId, item: Name },

    #[error("timed out after {0:?} waiting for the versioning write lock")]
    LockTimeout(Duration),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl VersionError {
    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentVersioningState(msg.into())
    }
}

/// Result alias for version storage operations.
pub type VersionResult<T> = Result<T, VersionError>;
