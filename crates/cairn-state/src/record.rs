//! Validated change records and the item table both persistence backends
//! apply them to.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use cairn_types::{ItemId, NodeId, PropertyId};

use crate::changelog::ChangeLog;
use crate::error::{StateError, StateResult};
use crate::item::{ItemData, PersistedItem};
use crate::references::NodeReferences;

/// The persisted form of one change log: records carry their post-store
/// modcounts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub added: Vec<(ItemId, PersistedItem)>,
    pub modified: Vec<(ItemId, PersistedItem)>,
    pub deleted: Vec<ItemId>,
}

impl ChangeRecord {
    pub fn from_changes(changes: &ChangeLog) -> Self {
        let added = changes
            .added_states()
            .map(|s| {
                let mut record = s.to_persisted();
                record.modcount = 1;
                (s.id().clone(), record)
            })
            .collect();
        let modified = changes
            .modified_states()
            .map(|s| {
                let mut record = s.to_persisted();
                record.modcount += 1;
                (s.id().clone(), record)
            })
            .collect();
        let deleted = changes.deleted_states().map(|s| s.id().clone()).collect();
        Self {
            added,
            modified,
            deleted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    fn written(&self) -> impl Iterator<Item = &(ItemId, PersistedItem)> {
        self.added.iter().chain(self.modified.iter())
    }
}

/// Item records plus the strong-reference index derived from them.
#[derive(Clone, Debug, Default)]
pub(crate) struct ItemTable {
    items: HashMap<ItemId, PersistedItem>,
    references: HashMap<NodeId, BTreeSet<PropertyId>>,
}

impl ItemTable {
    pub(crate) fn get(&self, id: &ItemId) -> Option<&PersistedItem> {
        self.items.get(id)
    }

    pub(crate) fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn references(&self, target: &NodeId) -> NodeReferences {
        match self.references.get(target) {
            Some(referrers) => NodeReferences::with_referrers(*target, referrers.iter().cloned()),
            None => NodeReferences::new(*target),
        }
    }

    /// Records sorted by id.
    pub(crate) fn sorted(&self) -> Vec<(&ItemId, &PersistedItem)> {
        let mut items: Vec<_> = self.items.iter().collect();
        items.sort_by(|a, b| a.0.cmp(b.0));
        items
    }

    /// Check a change log against the current records without applying it.
    pub(crate) fn validate(&self, changes: &ChangeLog) -> StateResult<ChangeRecord> {
        for state in changes.added_states() {
            if self.items.contains_key(state.id()) && !changes.is_deleted(state.id()) {
                return Err(StateError::ItemExists(state.id().clone()));
            }
        }
        for state in changes.modified_states().chain(changes.deleted_states()) {
            match self.items.get(state.id()) {
                None => {
                    return Err(StateError::Stale {
                        id: state.id().clone(),
                        reason: "item no longer exists".into(),
                    })
                }
                Some(stored) if stored.modcount != state.modcount() => {
                    return Err(StateError::Stale {
                        id: state.id().clone(),
                        reason: format!(
                            "modified externally (stored modcount {}, local {})",
                            stored.modcount,
                            state.modcount()
                        ),
                    })
                }
                Some(_) => {}
            }
        }
        let record = ChangeRecord::from_changes(changes);
        self.check_integrity(&record)?;
        Ok(record)
    }

    fn check_integrity(&self, record: &ChangeRecord) -> StateResult<()> {
        let deleted: HashSet<&ItemId> = record.deleted.iter().collect();
        let added: HashSet<&ItemId> = record.added.iter().map(|(id, _)| id).collect();
        let exists_after = |node: &NodeId| {
            let id = ItemId::Node(*node);
            added.contains(&id) || (!deleted.contains(&id) && self.items.contains_key(&id))
        };

        for (id, item) in record.written() {
            if let ItemData::Property(prop) = &item.data {
                if let Some(target) = prop.strong_references().find(|t| !exists_after(t)) {
                    return Err(StateError::ReferentialIntegrity {
                        target: *target,
                        reason: format!("{id} refers to a node that does not exist"),
                    });
                }
            }
        }

        let rewritten: HashSet<&ItemId> = record
            .written()
            .map(|(id, _)| id)
            .chain(record.deleted.iter())
            .collect();
        for id in &record.deleted {
            let ItemId::Node(node) = id else { continue };
            if added.contains(id) {
                continue;
            }
            let surviving = self.references.get(node).and_then(|referrers| {
                referrers
                    .iter()
                    .find(|p| !rewritten.contains(&ItemId::Property((*p).clone())))
            });
            if let Some(referrer) = surviving {
                return Err(StateError::ReferentialIntegrity {
                    target: *node,
                    reason: format!("still referenced by {referrer}"),
                });
            }
        }
        Ok(())
    }

    /// Apply a validated record.
    pub(crate) fn apply(&mut self, record: &ChangeRecord) {
        for id in &record.deleted {
            if let Some(old) = self.items.remove(id) {
                self.unindex(id, &old);
            }
            if let ItemId::Node(node) = id {
                self.references.remove(node);
            }
        }
        for (id, item) in record.written() {
            if let Some(old) = self.items.insert(id.clone(), item.clone()) {
                self.unindex(id, &old);
            }
            self.index(id, item);
        }
    }

    fn index(&mut self, id: &ItemId, item: &PersistedItem) {
        let (ItemId::Property(pid), ItemData::Property(prop)) = (id, &item.data) else {
            return;
        };
        for target in prop.strong_references() {
            self.references
                .entry(*target)
                .or_default()
                .insert(pid.clone());
        }
    }

    fn unindex(&mut self, id: &ItemId, item: &PersistedItem) {
        let (ItemId::Property(pid), ItemData::Property(prop)) = (id, &item.data) else {
            return;
        };
        for target in prop.strong_references() {
            if let Some(referrers) = self.references.get_mut(target) {
                referrers.remove(pid);
                if referrers.is_empty() {
                    self.references.remove(target);
                }
            }
        }
    }
}
