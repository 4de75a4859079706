//! Reconciliation of local rows against remote entries.
//!
//! A [`Reconciler`] lives for one push run. It indexes the remote entries by
//! normalized primary key, classifies local rows batch by batch, and
//! remembers the keys it has seen across batches so a key that appears in
//! two batches is only sent once. [`Reconciler::finish`] returns the
//! deletions the run implies.

use crate::config::{PushOperation, SyncMode};
use rowsync_types::{
    is_truthy, normalize_key, timestamps_match, CommitEntry, CommitPlan, ComparableKey, EntryId,
    RemoteEntry, Row,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

/// How one local row is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// No matching entry: create one.
    Insert,
    /// Overwrite the matching entry.
    Update(EntryId),
    /// The row is marked deleted and its entry exists: delete it.
    Delete(EntryId),
    /// The entry is already up to date.
    Unchanged(EntryId),
    /// The row is marked deleted and never existed remotely.
    SkipDeleted,
    /// The row has no primary-key value.
    MissingKey,
    /// An earlier row in this run had the same key.
    DuplicateRejected,
}

impl RowOutcome {
    /// Returns true if the row is sent in the commit.
    pub fn is_commit(&self) -> bool {
        matches!(self, RowOutcome::Insert | RowOutcome::Update(_))
    }
}

/// A classified row.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub outcome: RowOutcome,
    /// The row's primary-key value as text, used to prefix uploaded file
    /// names.
    pub primary_value: Option<String>,
    pub row: Row,
}

impl Classified {
    /// Converts a committed row into its commit entry.
    pub fn into_commit(self) -> Option<CommitEntry> {
        match self.outcome {
            RowOutcome::Insert => Some(CommitEntry::insert(self.row)),
            RowOutcome::Update(id) => Some(CommitEntry::update(id, self.row)),
            _ => None,
        }
    }
}

/// Per-run reconciliation state.
#[derive(Debug)]
pub struct Reconciler {
    primary_column: Option<String>,
    timestamp_column: Option<String>,
    delete_column: Option<String>,
    case_insensitive: bool,
    mode: SyncMode,
    entries: Vec<RemoteEntry>,
    index: HashMap<ComparableKey, usize>,
    seen: HashSet<ComparableKey>,
    orphans: Vec<EntryId>,
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Reconciler {
    /// Starts a run over `entries`. `all_rows` is the full local row set of
    /// the run; in replace mode, entries whose key none of them carries are
    /// marked for deletion.
    pub fn new(operation: &PushOperation, mut entries: Vec<RemoteEntry>, all_rows: &[Row]) -> Self {
        let case_insensitive = operation.case_insensitive_primary_column;

        for entry in &mut entries {
            entry.found = false;
        }

        let mut index = HashMap::new();
        let mut orphans = Vec::new();

        if let Some(primary) = &operation.primary_column {
            for (i, entry) in entries.iter().enumerate() {
                if let Some(key) = normalize_key(entry.data.get(primary), case_insensitive) {
                    index.entry(key).or_insert(i);
                }
            }

            if operation.mode != SyncMode::Update {
                let local: HashSet<ComparableKey> = all_rows
                    .iter()
                    .filter_map(|row| normalize_key(row.get(primary), case_insensitive))
                    .collect();
                for entry in &entries {
                    let key = normalize_key(entry.data.get(primary), case_insensitive);
                    if key.is_some_and(|k| !local.contains(&k)) {
                        debug!(
                            "Remote entry with ID {} has been marked for deletion as it doesn't exist in the local dataset",
                            entry.id
                        );
                        orphans.push(entry.id.clone());
                    }
                }
            }
        } else {
            warn!(
                "A primary key has not been set, which means rows will always be appended to the data source"
            );
        }

        Self {
            primary_column: operation.primary_column.clone(),
            timestamp_column: operation.timestamp_column.clone(),
            delete_column: operation.delete_column.clone(),
            case_insensitive,
            mode: operation.mode,
            entries,
            index,
            seen: HashSet::new(),
            orphans,
        }
    }

    /// The remote entries of this run, with their `found` flags.
    pub fn entries(&self) -> &[RemoteEntry] {
        &self.entries
    }

    fn is_deleted(&self, row: &Row) -> bool {
        self.delete_column
            .as_ref()
            .and_then(|col| row.get(col))
            .is_some_and(is_truthy)
    }

    /// Classifies one row.
    pub fn classify(&mut self, row: Row) -> Classified {
        let Some(primary) = self.primary_column.clone() else {
            debug!("Row has been marked for inserting since there is no primary key for the comparison");
            return Classified {
                outcome: RowOutcome::Insert,
                primary_value: None,
                row,
            };
        };

        let raw = row.get(&primary);
        let primary_value = raw.filter(|v| is_truthy(v)).map(value_text);
        let outcome = self.outcome_for(&row, raw);
        Classified {
            outcome,
            primary_value,
            row,
        }
    }

    fn outcome_for(&mut self, row: &Row, raw: Option<&Value>) -> RowOutcome {
        let Some(key) = normalize_key(raw, self.case_insensitive) else {
            let dump = Value::Object(row.clone());
            error!("A row is missing its primary key value. Skipping: {}", dump);
            return RowOutcome::MissingKey;
        };

        if !self.seen.insert(key.clone()) {
            error!("Row #{} has a duplicate primary key and has been skipped", key);
            return RowOutcome::DuplicateRejected;
        }

        let deleted = self.is_deleted(row);
        let Some(&index) = self.index.get(&key) else {
            if deleted {
                debug!(
                    "Row #{} is not present remotely and is locally marked as deleted. Skipping",
                    key
                );
                return RowOutcome::SkipDeleted;
            }
            debug!("Row #{} has been marked for inserting", key);
            return RowOutcome::Insert;
        };

        let entry = &mut self.entries[index];
        entry.found = true;
        let id = entry.id.clone();

        if deleted {
            debug!("Row #{} has been marked for deletion with ID {}", key, id);
            return RowOutcome::Delete(id);
        }

        let unchanged = match &self.timestamp_column {
            Some(column) => timestamps_match(row.get(column), entry.data.get(column)),
            None => true,
        };
        if unchanged && self.mode != SyncMode::Replace {
            debug!("Row #{} already exists with ID {} and does not require updating", key, id);
            return RowOutcome::Unchanged(id);
        }

        debug!("Row #{} has been marked for updating", key);
        RowOutcome::Update(id)
    }

    /// Classifies a batch of rows in order.
    pub fn classify_rows(&mut self, rows: Vec<Row>) -> Vec<Classified> {
        rows.into_iter().map(|row| self.classify(row)).collect()
    }

    /// Deletions implied by the run: orphans, then in replace mode every
    /// entry no row matched. Deduplicated and without falsy ids.
    pub fn finish(&mut self) -> Vec<EntryId> {
        let mut plan = CommitPlan {
            commits: Vec::new(),
            to_delete: std::mem::take(&mut self.orphans),
        };
        if self.mode == SyncMode::Replace {
            for entry in self.entries.iter().filter(|e| !e.found) {
                debug!(
                    "Remote entry with ID {} has been marked for deletion as no local row matched it",
                    entry.id
                );
                plan.to_delete.push(entry.id.clone());
            }
        }
        plan.compact_deletions();
        plan.to_delete
    }
}

/// Reconciles `rows` against `entries` in one pass, without any row
/// transformation.
pub fn reconcile(
    rows: Vec<Row>,
    entries: Vec<RemoteEntry>,
    operation: &PushOperation,
) -> (CommitPlan, Vec<RowOutcome>) {
    let mut reconciler = Reconciler::new(operation, entries, &rows);
    let classified = reconciler.classify_rows(rows);

    let mut plan = CommitPlan::new();
    let mut outcomes = Vec::with_capacity(classified.len());
    for item in classified {
        outcomes.push(item.outcome.clone());
        if let RowOutcome::Delete(id) = &item.outcome {
            plan.to_delete.push(id.clone());
        }
        if let Some(commit) = item.into_commit() {
            plan.commits.push(commit);
        }
    }
    plan.to_delete.extend(reconciler.finish());
    plan.compact_deletions();
    (plan, outcomes)
}
