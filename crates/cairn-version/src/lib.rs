//! Version storage for the Cairn content repository.
//!
//! Every versionable node has a version history below
//! `/jcr:system/jcr:versionStorage`, and activities live below
//! `/jcr:system/jcr:activities`. The [`InternalVersionManager`] is the only
//! writer of both subtrees. It serializes its writes with a
//! [`VersioningLock`] and runs each one as a single
//! [`WriteOperation`](cairn_state::WriteOperation), so checkin, label and
//! removal operations are all-or-nothing.
//!
//! # Key Types
//!
//! - [`InternalVersionManager`]: reads and writes of the version storage
//! - [`InternalVersionHistory`], [`InternalVersion`], [`InternalActivity`],
//!   [`InternalBaseline`], [`InternalFrozenNode`]: loaded snapshots
//! - [`VersioningLock`]: reentrant read/write lock with writer preference
//! - [`VersioningConfig`]: storage fan-out and lock wait bound

pub mod config;
pub mod entity;
pub mod error;
mod frozen;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod naming;

pub use config::VersioningConfig;
pub use entity::{
    InternalActivity, InternalBaseline, InternalFrozenNode, InternalVersion,
    InternalVersionHistory, InternalVersionItem, InternalVersionedChild,
};
pub use error::{VersionError, VersionResult};
pub use layout::VersionStorage;
pub use lock::{ReadGuard, VersioningLock, WriteGuard};
pub use manager::{InternalVersionManager, VersionHistoryInfo};
pub use naming::{next_version_name, select_base, NamingBase};
