//! Item-state management for the Cairn content repository.
//!
//! Every node and property is tracked as an [`ItemState`] moving through the
//! [`Status`] machine. Writes are buffered by a [`LocalStateManager`] for one
//! edit epoch and persisted atomically through a [`PersistenceManager`];
//! [`WriteOperation`] ties an epoch to a scope so that anything not saved is
//! cancelled.

pub mod changelog;
pub mod error;
pub mod item;
pub mod journal;
pub mod listener;
pub mod local;
pub mod memory;
pub mod nodetype;
pub mod operation;
pub mod record;
pub mod references;
pub mod shared;
pub mod status;
pub mod traits;

pub use changelog::{ChangeLog, PersistedChanges};
pub use error::{StateError, StateResult};
pub use item::{
    ChildNodeEntries, ChildNodeEntry, ItemData, ItemState, NodeData, PersistedItem, PropertyData,
};
pub use journal::{JournalPersistenceManager, SyncMode};
pub use listener::{
    ItemStateObserver, ListenerHandle, ObserverHandle, Registry, StateObservers, StatusListener,
    StatusListeners, Subscription,
};
pub use local::LocalStateManager;
pub use memory::InMemoryPersistenceManager;
pub use nodetype::{
    EffectiveNodeType, InMemoryNodeTypeRegistry, NodeTypeDef, NodeTypeRegistry, OnParentVersion,
};
pub use operation::{OperationPhase, WriteOperation};
pub use record::ChangeRecord;
pub use references::NodeReferences;
pub use shared::SharedItemStateManager;
pub use status::Status;
pub use traits::{
    IdFactory, ItemStateManager, PersistenceManager, UpdatableItemStateManager, UpdateSummary,
    UuidIdFactory,
};
