use cairn_types::{ItemId, Name, NodeId, TypeError};

use crate::status::Status;

/// Errors from item-state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The requested item does not exist.
    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// The item exists but is not of the expected kind.
    #[error("item {id} is not a {expected}")]
    WrongItemKind { id: ItemId, expected: &'static str },

    /// An item with this id already exists.
    #[error("item already exists: {0}")]
    ItemExists(ItemId),

    /// `edit()` was called while an edit epoch is already open.
    #[error("state manager is already in edit mode")]
    AlreadyEditing,

    /// A mutation was attempted outside an edit epoch.
    #[error("state manager is not in edit mode")]
    NotEditing,

    /// The item was changed or destroyed by someone else since it was read.
    #[error("stale item state {id}: {reason}")]
    Stale { id: ItemId, reason: String },

    /// The item has been removed.
    #[error("item has been removed: {0}")]
    Removed(ItemId),

    /// The item cannot be modified in its current status.
    #[error("item {id} cannot be modified in status {status}")]
    IllegalModification { id: ItemId, status: Status },

    /// A strong reference would dangle, or a referenced node would be removed.
    #[error("referential integrity violation on {target}: {reason}")]
    ReferentialIntegrity { target: NodeId, reason: String },

    #[error("no such node type: {0}")]
    NoSuchNodeType(Name),

    /// The buffered change set is internally inconsistent.
    #[error("inconsistent change set: {0}")]
    Inconsistent(String),

    /// Persistence backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Result alias for item-state operations.
pub type StateResult<T> = Result<T, StateError>;
