//! Object lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Persistence state of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any context
    Transient,
    /// Registered, not yet inserted
    New,
    /// In sync with the last known row
    Committed,
    /// Has local edits
    Modified,
    /// Known to exist, properties unresolved
    Hollow,
    /// Marked for deletion at next commit
    Deleted,
}

impl PersistenceState {
    /// Whether the lifecycle allows moving from `self` to `to`.
    ///
    /// Staying in the same state is always allowed. HOLLOW may be entered from
    /// any registered state when an object is invalidated, and any registered
    /// state may drop back to TRANSIENT when the object is unregistered.
    pub fn can_transition_to(self, to: PersistenceState) -> bool {
        use PersistenceState::{Committed, Deleted, Hollow, Modified, New, Transient};

        if self == to {
            return true;
        }
        match (self, to) {
            (Transient, New) => true,
            (_, Transient) => true,
            (New, Committed) => true,
            (Hollow, Committed) => true,
            (Committed | Modified | Deleted, Hollow) => true,
            (Committed, Modified) => true,
            (Modified, Committed) => true,
            (Committed | Modified, Deleted) => true,
            (Hollow, Deleted) => true,
            (Deleted, New) => true,
            (Modified, New) => true,
            (Deleted, Committed) => true,
            // Refresh of a hollow object with local edits recorded in a child.
            (Hollow, Modified) => true,
            _ => false,
        }
    }

    /// Registered and holding local changes that a commit has to push.
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
        )
    }

    /// Registered with a context.
    pub fn is_managed(self) -> bool {
        self != PersistenceState::Transient
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PersistenceState::Transient => "TRANSIENT",
            PersistenceState::New => "NEW",
            PersistenceState::Committed => "COMMITTED",
            PersistenceState::Modified => "MODIFIED",
            PersistenceState::Hollow => "HOLLOW",
            PersistenceState::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}
