//! Record lifecycle state machine.
//!
//! ```text
//! empty -> loading -> loaded.saved
//! loaded.saved -> loaded.updated.uncommitted -> loaded.updated.inflight
//!     -> loaded.saved | loaded.updated.invalid | loaded.updated.uncommitted
//! empty -> loaded.created.uncommitted -> loaded.created.inflight
//!     -> loaded.saved | loaded.created.invalid | loaded.created.uncommitted
//! loaded.* -> deleted.uncommitted -> deleted.inflight -> deleted.saved
//! * -> destroying -> destroyed
//! ```
//!
//! Transitions are pure; the store owns the current state per identifier and
//! applies side effects after a transition succeeds.

use crate::LifecycleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    Empty,
    Loading,
    LoadedSaved,
    UpdatedUncommitted,
    UpdatedInflight,
    UpdatedInvalid,
    CreatedUncommitted,
    CreatedInflight,
    CreatedInvalid,
    DeletedUncommitted,
    DeletedInflight,
    DeletedInvalid,
    DeletedSaved,
    Destroying,
    Destroyed,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Empty => "empty",
            RecordState::Loading => "loading",
            RecordState::LoadedSaved => "loaded.saved",
            RecordState::UpdatedUncommitted => "loaded.updated.uncommitted",
            RecordState::UpdatedInflight => "loaded.updated.inflight",
            RecordState::UpdatedInvalid => "loaded.updated.invalid",
            RecordState::CreatedUncommitted => "loaded.created.uncommitted",
            RecordState::CreatedInflight => "loaded.created.inflight",
            RecordState::CreatedInvalid => "loaded.created.invalid",
            RecordState::DeletedUncommitted => "deleted.uncommitted",
            RecordState::DeletedInflight => "deleted.inflight",
            RecordState::DeletedInvalid => "deleted.invalid",
            RecordState::DeletedSaved => "deleted.saved",
            RecordState::Destroying => "destroying",
            RecordState::Destroyed => "destroyed",
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == RecordState::Empty
    }

    pub fn is_loading(&self) -> bool {
        *self == RecordState::Loading
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(
            self,
            RecordState::Empty | RecordState::Loading | RecordState::Destroying | RecordState::Destroyed
        )
    }

    /// Has local changes the server has not confirmed.
    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            RecordState::UpdatedUncommitted
                | RecordState::UpdatedInflight
                | RecordState::UpdatedInvalid
                | RecordState::CreatedUncommitted
                | RecordState::CreatedInflight
                | RecordState::CreatedInvalid
                | RecordState::DeletedUncommitted
                | RecordState::DeletedInflight
                | RecordState::DeletedInvalid
        )
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            RecordState::CreatedUncommitted | RecordState::CreatedInflight | RecordState::CreatedInvalid
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            RecordState::DeletedUncommitted
                | RecordState::DeletedInflight
                | RecordState::DeletedInvalid
                | RecordState::DeletedSaved
        )
    }

    pub fn is_saving(&self) -> bool {
        matches!(
            self,
            RecordState::UpdatedInflight | RecordState::CreatedInflight | RecordState::DeletedInflight
        )
    }

    pub fn is_uncommitted(&self) -> bool {
        matches!(
            self,
            RecordState::UpdatedUncommitted
                | RecordState::CreatedUncommitted
                | RecordState::DeletedUncommitted
        )
    }

    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            RecordState::UpdatedInvalid | RecordState::CreatedInvalid | RecordState::DeletedInvalid
        )
    }

    /// True from unload until the record is finally destroyed, inclusive.
    pub fn is_destroying(&self) -> bool {
        matches!(self, RecordState::Destroying | RecordState::Destroyed)
    }

    pub fn is_destroyed(&self) -> bool {
        *self == RecordState::Destroyed
    }

    /// Apply an event, returning the next state.
    pub fn transition(self, event: RecordEvent) -> Result<RecordState, LifecycleError> {
        use RecordEvent as E;
        use RecordState as S;

        let next = match (self, event) {
            (S::Empty, E::LoadingStarted) => S::Loading,
            (S::Loading, E::LoadingStarted) => S::Loading,
            (S::Loading, E::NotFound) => S::Empty,
            (S::Empty | S::Loading, E::Loaded) => S::LoadedSaved,
            (s, E::Loaded) if s.is_loaded() => s,
            // A reload of an already loaded record.
            (s, E::LoadingStarted) if s.is_loaded() => s,
            (s, E::NotFound) if s.is_loaded() && !s.is_dirty() => S::Empty,

            (S::Empty, E::Created) => S::CreatedUncommitted,

            (S::LoadedSaved, E::Edited) => S::UpdatedUncommitted,
            (s, E::Edited) if s.is_dirty() && !s.is_deleted() => s,

            (S::UpdatedInvalid, E::ErrorsCleared) => S::UpdatedUncommitted,
            (S::CreatedInvalid, E::ErrorsCleared) => S::CreatedUncommitted,
            (S::DeletedInvalid, E::ErrorsCleared) => S::DeletedUncommitted,

            (S::UpdatedUncommitted | S::UpdatedInvalid | S::UpdatedInflight, E::WillCommit) => {
                S::UpdatedInflight
            }
            (S::CreatedUncommitted | S::CreatedInvalid | S::CreatedInflight, E::WillCommit) => {
                S::CreatedInflight
            }
            (S::DeletedUncommitted | S::DeletedInvalid | S::DeletedInflight, E::WillCommit) => {
                S::DeletedInflight
            }

            (S::UpdatedInflight | S::CreatedInflight, E::DidCommit) => S::LoadedSaved,
            (S::DeletedInflight, E::DidCommit) => S::DeletedSaved,

            (S::UpdatedInflight, E::BecameInvalid) => S::UpdatedInvalid,
            (S::CreatedInflight, E::BecameInvalid) => S::CreatedInvalid,
            (S::DeletedInflight, E::BecameInvalid) => S::DeletedInvalid,

            (S::UpdatedInflight, E::BecameError) => S::UpdatedUncommitted,
            (S::CreatedInflight, E::BecameError) => S::CreatedUncommitted,
            (S::DeletedInflight, E::BecameError) => S::DeletedUncommitted,

            (
                S::LoadedSaved | S::UpdatedUncommitted | S::UpdatedInvalid,
                E::Deleted,
            ) => S::DeletedUncommitted,
            // Never persisted: nothing to tell the server.
            (S::CreatedUncommitted | S::CreatedInvalid, E::Deleted) => S::DeletedSaved,
            (s, E::Deleted) if s.is_deleted() => s,

            (S::UpdatedUncommitted | S::UpdatedInvalid, E::RolledBack) => S::LoadedSaved,
            (S::DeletedUncommitted | S::DeletedInvalid, E::RolledBack) => S::LoadedSaved,
            (S::LoadedSaved, E::RolledBack) => S::LoadedSaved,

            (S::Destroyed, E::Unloaded) => {
                return Err(LifecycleError::InvalidTransition {
                    from: self.to_string(),
                    event: event.to_string(),
                })
            }
            (_, E::Unloaded) => S::Destroying,
            (S::Destroying, E::Destroyed) => S::Destroyed,

            _ => {
                return Err(LifecycleError::InvalidTransition {
                    from: self.to_string(),
                    event: event.to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATES
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown record state: {}", s))
    }
}

/// Every state, in declaration order.
pub const ALL_STATES: [RecordState; 15] = [
    RecordState::Empty,
    RecordState::Loading,
    RecordState::LoadedSaved,
    RecordState::UpdatedUncommitted,
    RecordState::UpdatedInflight,
    RecordState::UpdatedInvalid,
    RecordState::CreatedUncommitted,
    RecordState::CreatedInflight,
    RecordState::CreatedInvalid,
    RecordState::DeletedUncommitted,
    RecordState::DeletedInflight,
    RecordState::DeletedInvalid,
    RecordState::DeletedSaved,
    RecordState::Destroying,
    RecordState::Destroyed,
];

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordEvent {
    LoadingStarted,
    NotFound,
    Loaded,
    Created,
    Edited,
    ErrorsCleared,
    WillCommit,
    DidCommit,
    BecameInvalid,
    BecameError,
    Deleted,
    RolledBack,
    Unloaded,
    Destroyed,
}

impl RecordEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordEvent::LoadingStarted => "loadingStarted",
            RecordEvent::NotFound => "notFound",
            RecordEvent::Loaded => "loaded",
            RecordEvent::Created => "created",
            RecordEvent::Edited => "edited",
            RecordEvent::ErrorsCleared => "errorsCleared",
            RecordEvent::WillCommit => "willCommit",
            RecordEvent::DidCommit => "didCommit",
            RecordEvent::BecameInvalid => "becameInvalid",
            RecordEvent::BecameError => "becameError",
            RecordEvent::Deleted => "deleted",
            RecordEvent::RolledBack => "rolledBack",
            RecordEvent::Unloaded => "unloaded",
            RecordEvent::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for RecordEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_event() -> impl Strategy<Value = RecordEvent> {
        prop_oneof![
            Just(RecordEvent::LoadingStarted),
            Just(RecordEvent::NotFound),
            Just(RecordEvent::Loaded),
            Just(RecordEvent::Created),
            Just(RecordEvent::Edited),
            Just(RecordEvent::ErrorsCleared),
            Just(RecordEvent::WillCommit),
            Just(RecordEvent::DidCommit),
            Just(RecordEvent::BecameInvalid),
            Just(RecordEvent::BecameError),
            Just(RecordEvent::Deleted),
            Just(RecordEvent::RolledBack),
            Just(RecordEvent::Unloaded),
            Just(RecordEvent::Destroyed),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Once destroying, the only way forward is destroyed.
        #[test]
        fn prop_destroying_only_reaches_destroyed(events in prop::collection::vec(arb_event(), 0..30)) {
            let mut state = RecordState::Empty;
            let mut destroying = false;
            for event in events {
                if let Ok(next) = state.transition(event) {
                    if destroying {
                        prop_assert!(next.is_destroying());
                    }
                    destroying |= next.is_destroying();
                    state = next;
                }
            }
        }

        /// Inflight states are entered only by starting a save.
        #[test]
        fn prop_inflight_reached_only_through_will_commit(events in prop::collection::vec(arb_event(), 0..30)) {
            let mut state = RecordState::Empty;
            for event in events {
                if let Ok(next) = state.transition(event) {
                    if next.is_saving() && !state.is_saving() {
                        prop_assert_eq!(event, RecordEvent::WillCommit);
                    }
                    state = next;
                }
            }
        }
    }
}
