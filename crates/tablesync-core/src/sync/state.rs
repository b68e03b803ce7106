//! Row synchronization state machine
//!
//! Every row carries a [`SyncState`]. Local writes move a row out of `rest`;
//! the sync processor moves it back once the server acknowledges the change.
//! A rejected push (tag mismatch) parks the row in `conflicting` until it is
//! resolved explicitly. There is no automatic tie-break.
//!
//! ```text
//! insert            -> inserting
//! rest   --edit-->     updating
//! rest   --delete-->   deleting
//! inserting --delete-> (removed, never reached the server)
//! {inserting, updating, deleting} --ack-->      rest (deleting: removed)
//! {inserting, updating, deleting} --rejected--> conflicting
//! conflicting --resolve-->                      rest
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synchronization status of a single row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Matches the last known server version
    Rest,
    /// Created locally, not yet on the server
    Inserting,
    /// Edited locally since the last sync
    Updating,
    /// Deleted locally, delete not yet pushed
    Deleting,
    /// Push was rejected; local and server variants both exist
    Conflicting,
}

/// Something that happens to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEvent {
    LocalEdit,
    LocalDelete,
    PushAccepted,
    PushRejected,
    Resolved,
}

/// Where a row ends up after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFate {
    Keep(SyncState),
    /// Physically delete the row (and any server variant)
    Remove,
}

/// An event that is not valid in the row's current state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot apply {event:?} to a row in state '{state}'")]
pub struct TransitionError {
    pub state: SyncState,
    pub event: RowEvent,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Rest => "rest",
            SyncState::Inserting => "inserting",
            SyncState::Updating => "updating",
            SyncState::Deleting => "deleting",
            SyncState::Conflicting => "conflicting",
        }
    }

    /// Whether the row holds a local change waiting to be pushed
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            SyncState::Inserting | SyncState::Updating | SyncState::Deleting
        )
    }

    /// Apply an event, returning the row's fate
    pub fn apply(self, event: RowEvent) -> Result<RowFate, TransitionError> {
        use RowEvent::*;
        use SyncState::*;

        let fate = match (self, event) {
            (Rest, LocalEdit) => RowFate::Keep(Updating),
            (Inserting, LocalEdit) => RowFate::Keep(Inserting),
            (Updating, LocalEdit) => RowFate::Keep(Updating),

            (Rest, LocalDelete) | (Updating, LocalDelete) => RowFate::Keep(Deleting),
            (Inserting, LocalDelete) => RowFate::Remove,
            (Deleting, LocalDelete) => RowFate::Keep(Deleting),

            (Inserting, PushAccepted) | (Updating, PushAccepted) => RowFate::Keep(Rest),
            (Deleting, PushAccepted) => RowFate::Remove,

            (Inserting, PushRejected) | (Updating, PushRejected) | (Deleting, PushRejected) => {
                RowFate::Keep(Conflicting)
            }

            (Conflicting, Resolved) => RowFate::Keep(Rest),

            (state, event) => return Err(TransitionError { state, event }),
        };
        Ok(fate)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rest" => Ok(SyncState::Rest),
            "inserting" => Ok(SyncState::Inserting),
            "updating" => Ok(SyncState::Updating),
            "deleting" => Ok(SyncState::Deleting),
            "conflicting" => Ok(SyncState::Conflicting),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}
