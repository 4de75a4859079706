//! Remote entries and the commit plan produced by reconciliation.

use crate::ids::EntryId;
use crate::row::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// An entry stored in a remote data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Remote identifier.
    pub id: EntryId,
    /// Column values.
    #[serde(default)]
    pub data: Row,
    /// Set during reconciliation when a local row matched this entry.
    /// Never persisted.
    #[serde(skip)]
    pub found: bool,
}

impl RemoteEntry {
    /// Creates an entry with the given id and data.
    pub fn new(id: impl Into<EntryId>, data: Row) -> Self {
        Self {
            id: id.into(),
            data,
            found: false,
        }
    }
}

/// One row to send in a commit: an update when `id` is set, an insert
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntryId>,
    pub data: Row,
}

impl CommitEntry {
    /// A row to insert.
    pub fn insert(data: Row) -> Self {
        Self { id: None, data }
    }

    /// A row that overwrites the remote entry `id`.
    pub fn update(id: EntryId, data: Row) -> Self {
        Self { id: Some(id), data }
    }

    /// Returns true if this entry creates a new remote entry.
    pub fn is_insert(&self) -> bool {
        self.id.is_none()
    }
}

/// The set of changes one reconciliation pass wants to send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitPlan {
    pub commits: Vec<CommitEntry>,
    pub to_delete: Vec<EntryId>,
}

impl CommitPlan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when there is nothing to insert, update or delete.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.to_delete.is_empty()
    }

    /// Number of inserts in the plan.
    pub fn insert_count(&self) -> usize {
        self.commits.iter().filter(|c| c.is_insert()).count()
    }

    /// Number of updates in the plan.
    pub fn update_count(&self) -> usize {
        self.commits.len() - self.insert_count()
    }

    /// Removes duplicate and falsy ids from the deletion list, keeping the
    /// first occurrence of each id in order.
    pub fn compact_deletions(&mut self) {
        let mut seen = HashSet::new();
        self.to_delete
            .retain(|id| !id.is_falsy() && seen.insert(id.clone()));
    }
}
