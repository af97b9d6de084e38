//! Error types for the hierarchy crate.

use cairn_state::StateError;
use cairn_types::{ItemId, Path, TypeError};

/// Errors from hierarchy resolution and state creation.
#[derive(Debug, thiserror::Error)]
pub enum HierarchyError {
    /// The item does not exist, or no longer exists where the hierarchy
    /// expects it.
    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    /// No item at this path.
    #[error("path not found: {0}")]
    PathNotFound(Path),

    /// The hierarchy entry has been removed.
    #[error("hierarchy entry removed: {0}")]
    EntryRemoved(String),

    /// The info source returned data that does not fit the request.
    #[error("invalid item info: {0}")]
    InvalidInfo(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Convenience alias for hierarchy results.
pub type HierarchyResult<T> = Result<T, HierarchyError>;
