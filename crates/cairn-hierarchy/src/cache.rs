//! Generation-tagged item info cache.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::trace;

use cairn_types::ItemId;

use crate::info::ItemInfo;

/// Cache sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of infos held before the oldest is evicted.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 5000 }
    }
}

/// An info together with the tree generation it was fetched at.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedInfo {
    pub info: ItemInfo,
    pub generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ItemId, CachedInfo>,
    order: VecDeque<ItemId>,
}

/// Bounded, first-in-first-out info cache keyed by item id.
pub struct ItemInfoCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ItemInfoCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            inner: Mutex::new(Inner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, id: &ItemId) -> Option<CachedInfo> {
        let inner = self.inner.lock().expect("info cache lock poisoned");
        let found = inner.entries.get(id).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn put(&self, info: ItemInfo, generation: u64) {
        let mut inner = self.inner.lock().expect("info cache lock poisoned");
        self.insert(&mut inner, info, generation);
    }

    /// Cache a whole batch under one generation.
    pub fn put_batch(&self, infos: impl IntoIterator<Item = ItemInfo>, generation: u64) {
        let mut inner = self.inner.lock().expect("info cache lock poisoned");
        let mut count = 0usize;
        for info in infos {
            self.insert(&mut inner, info, generation);
            count += 1;
        }
        trace!(count, generation, "cached info batch");
    }

    fn insert(&self, inner: &mut Inner, info: ItemInfo, generation: u64) {
        let id = info.id();
        if inner
            .entries
            .insert(id.clone(), CachedInfo { info, generation })
            .is_none()
        {
            inner.order.push_back(id);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn remove(&self, id: &ItemId) -> Option<CachedInfo> {
        let mut inner = self.inner.lock().expect("info cache lock poisoned");
        let removed = inner.entries.remove(id);
        if removed.is_some() {
            inner.order.retain(|o| o != id);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("info cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("info cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for ItemInfoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemInfoCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::NodeInfo;
    use cairn_state::NodeData;
    use cairn_types::{well_known, Name, NodeId, Path};

    fn info(name: &str) -> ItemInfo {
        let name = Name::local(name).unwrap();
        ItemInfo::Node(NodeInfo {
            id: NodeId::new(),
            path: Path::root().child(name.clone()),
            data: NodeData::new(Some(NodeId::new()), name, well_known::NT_UNSTRUCTURED),
            modcount: 1,
        })
    }

    #[test]
    fn evicts_oldest_first() {
        let cache = ItemInfoCache::new(&CacheConfig { capacity: 2 });
        let (a, b, c) = (info("a"), info("b"), info("c"));
        cache.put(a.clone(), 0);
        cache.put(b.clone(), 0);
        cache.put(a.clone(), 1);
        cache.put(c.clone(), 1);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a.id()).is_none());
        assert_eq!(cache.get(&b.id()).unwrap().generation, 0);
        assert!(cache.get(&c.id()).is_some());
        assert_eq!(cache.stats(), (2, 1));
    }

    #[test]
    fn batch_shares_generation() {
        let cache = ItemInfoCache::new(&CacheConfig::default());
        let batch = vec![info("a"), info("b")];
        let ids: Vec<ItemId> = batch.iter().map(ItemInfo::id).collect();
        cache.put_batch(batch, 7);
        for id in &ids {
            assert_eq!(cache.get(id).unwrap().generation, 7);
        }
        cache.remove(&ids[0]);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn config_from_toml() {
        let config: CacheConfig = toml::from_str("capacity = 16").unwrap();
        assert_eq!(config.capacity, 16);
        let defaulted: CacheConfig = toml::from_str("").unwrap();
        assert_eq!(defaulted, CacheConfig::default());
    }
}
