//! The item-state lifecycle.
//!
//! Every [`ItemState`](crate::ItemState) carries a [`Status`]. Transitions
//! follow a fixed table ([`Status::can_transition_to`]); an illegal
//! transition is a programming error and panics.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of an item state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Created in the current edit epoch, not yet persisted.
    New,
    /// In sync with persistence.
    Existing,
    /// Persisted item with pending local modifications.
    ExistingModified,
    /// Persisted item pending local removal.
    ExistingRemoved,
    /// Locally modified, but the persisted item changed underneath.
    StaleModified,
    /// Locally modified, but the persisted item was destroyed underneath.
    StaleDestroyed,
    /// Possibly out of date; re-validated lazily on next access.
    Invalidated,
    /// Transient marker used to fan out an external change before
    /// collapsing back to `Existing`.
    Modified,
    /// Terminal.
    Removed,
}

impl Status {
    /// The fixed transition table.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        match self {
            New => matches!(next, Existing | Removed),
            Existing => matches!(
                next,
                ExistingModified | ExistingRemoved | Invalidated | Modified | Removed
            ),
            ExistingModified => matches!(
                next,
                Existing | ExistingRemoved | StaleModified | StaleDestroyed | Removed
            ),
            ExistingRemoved => matches!(next, Existing | StaleDestroyed | Removed),
            Invalidated => matches!(next, Existing | Modified | Removed),
            Modified => matches!(next, Existing | Removed),
            StaleModified => matches!(next, Existing | StaleDestroyed | Removed),
            StaleDestroyed => matches!(next, Removed),
            Removed => false,
        }
    }

    /// Pending local changes that have not been persisted.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::New | Status::ExistingModified | Status::ExistingRemoved
        )
    }

    pub fn is_stale(self) -> bool {
        matches!(self, Status::StaleModified | Status::StaleDestroyed)
    }

    pub fn is_terminal(self) -> bool {
        self == Status::Removed
    }

    /// Whether the item is still visible to readers.
    pub fn is_valid(self) -> bool {
        matches!(
            self,
            Status::New
                | Status::Existing
                | Status::ExistingModified
                | Status::Invalidated
                | Status::Modified
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::New => "NEW",
            Status::Existing => "EXISTING",
            Status::ExistingModified => "EXISTING_MODIFIED",
            Status::ExistingRemoved => "EXISTING_REMOVED",
            Status::StaleModified => "STALE_MODIFIED",
            Status::StaleDestroyed => "STALE_DESTROYED",
            Status::Invalidated => "INVALIDATED",
            Status::Modified => "MODIFIED",
            Status::Removed => "REMOVED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 9] = [
        Status::New,
        Status::Existing,
        Status::ExistingModified,
        Status::ExistingRemoved,
        Status::StaleModified,
        Status::StaleDestroyed,
        Status::Invalidated,
        Status::Modified,
        Status::Removed,
    ];

    #[test]
    fn removed_is_terminal() {
        for next in ALL {
            assert!(!Status::Removed.can_transition_to(next), "{next}");
        }
    }

    #[test]
    fn nothing_returns_to_new() {
        for from in ALL {
            assert!(!from.can_transition_to(Status::New), "{from}");
        }
    }

    #[test]
    fn self_transitions_are_illegal() {
        for status in ALL {
            assert!(!status.can_transition_to(status), "{status}");
        }
    }

    #[test]
    fn every_live_status_can_be_removed() {
        for from in ALL.into_iter().filter(|s| *s != Status::Removed) {
            assert!(from.can_transition_to(Status::Removed), "{from}");
        }
    }

    #[test]
    fn stale_only_reached_from_local_changes() {
        assert!(Status::ExistingModified.can_transition_to(Status::StaleModified));
        assert!(!Status::Existing.can_transition_to(Status::StaleModified));
        assert!(!Status::New.can_transition_to(Status::StaleDestroyed));
    }

    #[test]
    fn classification() {
        assert!(Status::New.is_transient());
        assert!(Status::ExistingRemoved.is_transient());
        assert!(!Status::Existing.is_transient());
        assert!(Status::StaleModified.is_stale());
        assert!(!Status::ExistingRemoved.is_valid());
        assert_eq!(Status::ExistingModified.to_string(), "EXISTING_MODIFIED");
    }
}
