//! The Cairn content repository.
//!
//! [`Repository`] wires persistence, node types and versioning together and
//! bootstraps the system subtree. [`Workspace`] handles are what callers
//! work with: path-based reads, scoped edits and the versioning operations.

pub mod config;
pub mod error;
pub mod repository;
pub mod workspace;

pub use config::{JournalConfig, RepositoryConfig};
pub use error::{RepoError, RepoResult};
pub use repository::Repository;
pub use workspace::{Node, Workspace, WorkspaceEdit};

pub use cairn_types::{well_known, Name, NodeId, Path, Value};
pub use cairn_version::{InternalActivity, InternalVersion, InternalVersionHistory, VersioningConfig};
