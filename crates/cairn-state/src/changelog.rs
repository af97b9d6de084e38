//! Buffered changes of one edit epoch.

use std::collections::HashMap;

use cairn_types::ItemId;

use crate::item::ItemState;
use crate::status::Status;

/// Insertion-ordered set of states keyed by item id.
#[derive(Clone, Debug, Default)]
struct StateSet {
    order: Vec<ItemId>,
    states: HashMap<ItemId, ItemState>,
}

impl StateSet {
    fn put(&mut self, state: ItemState) {
        let id = state.id().clone();
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push(id);
        }
    }

    fn take(&mut self, id: &ItemId) -> Option<ItemState> {
        let state = self.states.remove(id)?;
        self.order.retain(|o| o != id);
        Some(state)
    }

    fn get(&self, id: &ItemId) -> Option<&ItemState> {
        self.states.get(id)
    }

    fn contains(&self, id: &ItemId) -> bool {
        self.states.contains_key(id)
    }

    fn iter(&self) -> impl Iterator<Item = &ItemState> {
        self.order.iter().filter_map(|id| self.states.get(id))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut ItemState> {
        self.states.values_mut()
    }

    fn drain(&mut self) -> Vec<ItemState> {
        let mut states = std::mem::take(&mut self.states);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| states.remove(&id))
            .collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// The added, modified and deleted states of one edit epoch.
///
/// An item added and then deleted in the same epoch disappears from the
/// log entirely. An item modified and then deleted is only recorded as
/// deleted.
#[derive(Clone, Debug, Default)]
pub struct ChangeLog {
    added: StateSet,
    modified: StateSet,
    deleted: StateSet,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created state.
    pub fn added(&mut self, state: ItemState) {
        self.added.put(state);
    }

    /// Record a modified state. States created in this epoch stay "added".
    pub fn modified(&mut self, state: ItemState) {
        if self.added.contains(state.id()) {
            self.added.put(state);
        } else {
            self.modified.put(state);
        }
    }

    /// Record a deleted state. Returns `true` if the item was created in
    /// this epoch and therefore simply dropped from the log.
    pub fn deleted(&mut self, state: ItemState) -> bool {
        if self.added.take(state.id()).is_some() {
            return true;
        }
        self.modified.take(state.id());
        self.deleted.put(state);
        false
    }

    /// The pending state of an added or modified item.
    pub fn get(&self, id: &ItemId) -> Option<&ItemState> {
        self.added.get(id).or_else(|| self.modified.get(id))
    }

    pub fn is_deleted(&self, id: &ItemId) -> bool {
        self.deleted.contains(id)
    }

    pub fn is_added(&self, id: &ItemId) -> bool {
        self.added.contains(id)
    }

    pub fn added_states(&self) -> impl Iterator<Item = &ItemState> {
        self.added.iter()
    }

    pub fn modified_states(&self) -> impl Iterator<Item = &ItemState> {
        self.modified.iter()
    }

    pub fn deleted_states(&self) -> impl Iterator<Item = &ItemState> {
        self.deleted.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    /// Mark a buffered state stale after a failed update.
    pub fn mark_stale(&mut self, id: &ItemId, destroyed: bool) {
        let target = if destroyed {
            Status::StaleDestroyed
        } else {
            Status::StaleModified
        };
        let state = self
            .modified
            .iter_mut()
            .chain(self.deleted.iter_mut())
            .find(|s| s.id() == id);
        if let Some(state) = state {
            if state.status().can_transition_to(target) {
                state.set_status(target);
            }
        }
    }

    /// Transition every state to its post-persist status and hand the
    /// states back, bumping modcounts of modified items.
    pub fn persisted(&mut self) -> PersistedChanges {
        let mut added = self.added.drain();
        for state in &mut added {
            state.set_modcount(1);
            state.set_status(Status::Existing);
        }
        let mut modified = self.modified.drain();
        for state in &mut modified {
            state.set_modcount(state.modcount() + 1);
            if state.status() != Status::Existing {
                state.set_status(Status::Existing);
            }
        }
        let mut deleted = self.deleted.drain();
        for state in &mut deleted {
            state.set_status(Status::Removed);
        }
        PersistedChanges {
            added,
            modified,
            deleted,
        }
    }

    /// Discard everything, reverting statuses to their last persisted value.
    /// New items become `Removed`; they can never be revived.
    pub fn undo(&mut self) -> Vec<ItemState> {
        let mut discarded = Vec::with_capacity(self.len());
        for mut state in self.added.drain() {
            if state.status() != Status::Removed {
                state.set_status(Status::Removed);
            }
            discarded.push(state);
        }
        for mut state in self.modified.drain().into_iter().chain(self.deleted.drain()) {
            match state.status() {
                Status::ExistingModified | Status::ExistingRemoved | Status::StaleModified => {
                    state.set_status(Status::Existing)
                }
                Status::StaleDestroyed => state.set_status(Status::Removed),
                _ => {}
            }
            discarded.push(state);
        }
        discarded
    }
}

/// States returned by [`ChangeLog::persisted`].
#[derive(Debug, Default)]
pub struct PersistedChanges {
    pub added: Vec<ItemState>,
    pub modified: Vec<ItemState>,
    pub deleted: Vec<ItemState>,
}
