//! Foundation types for the Cairn content repository.
//!
//! Every other Cairn crate depends on `cairn-types`.
//!
//! # Key Types
//!
//! - [`NodeId`]: UUID v7 node identifier
//! - [`PropertyId`]: parent node id + property name
//! - [`ItemId`]: either of the above
//! - [`Name`]: namespace-qualified name, see [`well_known`] for built-ins
//! - [`Path`]: structured path with same-name-sibling indices
//! - [`Value`]: typed property value

pub mod error;
pub mod id;
pub mod name;
pub mod path;
pub mod value;

pub use error::TypeError;
pub use id::{ItemId, NodeId, PropertyId};
pub use name::{ns, well_known, Name};
pub use path::{Path, PathElement, DEFAULT_INDEX};
pub use value::{Value, ValueType};
