//! Pending operation per document key and the merge table.
//!
//! An operation is modelled as the pair (presence before the unit of work,
//! presence after it). Merging two operations keeps the first one's initial
//! presence and the second one's final presence, which yields the whole merge
//! table without enumerating it:
//!
//! | existing | incoming | result |
//! |---|---|---|
//! | ADD | UPDATE | ADD |
//! | ADD | DELETE | NOOP |
//! | UPDATE | DELETE | DELETE |
//! | DELETE | ADD | UPDATE |
//! | UPDATE | UPDATE | UPDATE |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexingOperation {
    Add,
    Update,
    Delete,
    AddOrUpdate,
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Absent,
    Present,
    Unknown,
}

impl IndexingOperation {
    fn presence(self) -> (Presence, Presence) {
        use Presence::*;
        match self {
            Self::Add => (Absent, Present),
            Self::Update => (Present, Present),
            Self::Delete => (Present, Absent),
            Self::AddOrUpdate => (Unknown, Present),
            Self::Noop => (Absent, Absent),
        }
    }

    fn from_presence(initial: Presence, current: Presence) -> Self {
        use Presence::*;
        match (initial, current) {
            (Absent, Present) => Self::Add,
            (Present, Present) => Self::Update,
            (Unknown, Present) => Self::AddOrUpdate,
            (Absent, Absent) => Self::Noop,
            // The document may exist: deleting is always safe.
            (Present | Unknown, Absent) => Self::Delete,
            (_, Unknown) => Self::AddOrUpdate,
        }
    }

    /// Result of applying `incoming` after `existing` to the same document.
    pub fn merge(existing: Option<Self>, incoming: Self) -> Self {
        match existing {
            None => incoming,
            Some(existing) => {
                let (initial, _) = existing.presence();
                let (_, current) = incoming.presence();
                Self::from_presence(initial, current)
            }
        }
    }

    /// Whether the document exists after this operation.
    pub fn keeps_document(self) -> bool {
        matches!(self, Self::Add | Self::Update | Self::AddOrUpdate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::AddOrUpdate => "add_or_update",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for IndexingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
