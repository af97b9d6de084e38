//! Error types for the repository crate.

use cairn_hierarchy::HierarchyError;
use cairn_state::StateError;
use cairn_types::{Path, TypeError};
use cairn_version::VersionError;

/// Errors from opening a repository or working in one of its workspaces.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such workspace: {0}")]
    NoSuchWorkspace(String),

    #[error("node at {0} is not versionable")]
    NotVersionable(Path),

    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

pub type RepoResult<T> = Result<T, RepoError>;
