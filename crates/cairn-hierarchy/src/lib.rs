//! Hierarchy entries and item state resolution for the Cairn content
//! repository.
//!
//! A [`HierarchyTree`] mirrors the persisted node tree for the parts a
//! session has touched. The [`ItemStateFactory`] fills its entries with
//! item states fetched in batches from an [`ItemInfoSource`] and cached in
//! an [`ItemInfoCache`] tagged by generation.

pub mod cache;
pub mod error;
pub mod factory;
pub mod info;
pub mod tree;

pub use cache::{CacheConfig, CachedInfo, ItemInfoCache};
pub use error::{HierarchyError, HierarchyResult};
pub use factory::ItemStateFactory;
pub use info::{
    ItemInfo, ItemInfoSource, NodeInfo, PersistenceInfoSource, PropertyInfo, SessionContext,
};
pub use tree::{HierarchyTree, NodeEntry, PropertyEntry, TreeInvalidator};
