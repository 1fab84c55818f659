//! Conflict-aware application of remote data to the local store.
//!
//! Both replication paths land here: peer exchanges hand over changelog
//! batches, central pulls hand over full table snapshots. Each call builds
//! one [`WriteBatch`] and commits it under the shared write gate.

use crate::error::SyncResult;
use crate::store::{LocalStore, WriteBatch};
use parking_lot::Mutex;
use peersync_protocol::{
    resolve, sort_causally, ChangeType, ChangelogEntry, ConflictStrategy, Record,
    ReplicatedChange, Resolution, Versioned,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Serializes every engine-side write to the local store.
pub type WriteGate = Arc<Mutex<()>>;

/// Counts from applying a peer batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Changes written locally.
    pub applied: u32,
    /// Changes discarded because the local side won a conflict.
    pub kept_local: u32,
    /// Changes with nothing to apply (no row snapshot, update of an absent row).
    pub skipped: u32,
}

/// Counts from applying one central snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Rows upserted.
    pub upserted: u32,
    /// Rows left alone because the local side won a conflict.
    pub kept_local: u32,
    /// Local rows deleted for being absent centrally.
    pub deleted: u32,
    /// Local rows absent centrally but kept because they have unsynced changes.
    pub pending_kept: u32,
}

/// Applies remote data with conflict resolution.
#[derive(Clone)]
pub struct ChangeApplier {
    store: Arc<dyn LocalStore>,
    gate: WriteGate,
}

impl ChangeApplier {
    /// Creates an applier writing through `gate`.
    pub fn new(store: Arc<dyn LocalStore>, gate: WriteGate) -> Self {
        Self { store, gate }
    }

    /// Applies a peer batch in causal order.
    ///
    /// Incoming changes are written without new changelog entries, so they
    /// are not echoed back to their origin as local mutations.
    pub fn apply_changes(
        &self,
        mut changes: Vec<ReplicatedChange>,
        strategy: ConflictStrategy,
    ) -> SyncResult<ApplyOutcome> {
        sort_causally(&mut changes);

        let _guard = self.gate.lock();
        let mut batch = WriteBatch::new();
        let mut outcome = ApplyOutcome::default();
        let mut superseded = HashSet::new();
        // row presence after the ops queued so far
        let mut staged: HashMap<(String, i64), bool> = HashMap::new();

        for change in changes {
            let entry = change.entry;
            let key = (entry.table_name.clone(), entry.record_id);
            let present = match staged.get(&key) {
                Some(present) => *present,
                None => self
                    .store
                    .get_local_row(&entry.table_name, entry.record_id)?
                    .is_some(),
            };

            let write = match (entry.change_type, change.row) {
                (ChangeType::Delete, _) => IncomingWrite::Delete,
                (ChangeType::Update, _) if present && entry.column_name.is_some() => {
                    IncomingWrite::Column(entry.column_name.clone().unwrap_or_default())
                }
                (_, Some(row)) => IncomingWrite::Row(row),
                (_, None) => {
                    outcome.skipped += 1;
                    continue;
                }
            };

            // only local edits the incoming write overwrites are in conflict
            let pending: Vec<ChangelogEntry> = self
                .pending_for(&entry.table_name, entry.record_id, &superseded)?
                .into_iter()
                .filter(|local| write.overwrites(local))
                .collect();

            if let Some(local_ts) = latest_timestamp(&pending) {
                let local = Versioned::new((), local_ts);
                let incoming = Versioned::new((), entry.timestamp);
                match resolve(strategy, &local, &incoming) {
                    Resolution::KeepLocal => {
                        tracing::debug!(
                            table = %entry.table_name,
                            record = entry.record_id,
                            "local change wins conflict"
                        );
                        outcome.kept_local += 1;
                        continue;
                    }
                    Resolution::AcceptIncoming => {
                        let ids: Vec<u64> = pending.iter().map(|e| e.id).collect();
                        superseded.extend(ids.iter().copied());
                        batch.mark_synced(ids);
                    }
                }
            }

            match write {
                IncomingWrite::Delete => {
                    batch.delete(&entry.table_name, entry.record_id);
                    staged.insert(key, false);
                }
                IncomingWrite::Column(column) => {
                    batch.set_column(
                        &entry.table_name,
                        entry.record_id,
                        column,
                        entry.new_value.clone(),
                        entry.timestamp,
                    );
                }
                IncomingWrite::Row(row) => {
                    batch.upsert(&entry.table_name, row);
                    staged.insert(key, true);
                }
            }
            outcome.applied += 1;
        }

        self.store.commit(batch)?;
        Ok(outcome)
    }

    /// Applies a full central snapshot of one table.
    ///
    /// Rows are replaced by id. With `delete_missing`, local rows absent from
    /// the snapshot are deleted unless they carry unsynced local changes.
    pub fn apply_snapshot(
        &self,
        table: &str,
        rows: Vec<Record>,
        strategy: ConflictStrategy,
        delete_missing: bool,
    ) -> SyncResult<PullOutcome> {
        let _guard = self.gate.lock();
        let mut batch = WriteBatch::new();
        let mut outcome = PullOutcome::default();
        let remote_ids: BTreeSet<i64> = rows.iter().map(|r| r.id).collect();
        let no_superseded = HashSet::new();

        for row in rows {
            let pending = self.pending_for(table, row.id, &no_superseded)?;
            if let Some(local_ts) = latest_timestamp(&pending) {
                let local = Versioned::new((), local_ts);
                let incoming = Versioned::new((), row.modified_at);
                if resolve(strategy, &local, &incoming) == Resolution::KeepLocal {
                    outcome.kept_local += 1;
                    continue;
                }
                batch.mark_synced(pending.iter().map(|e| e.id));
            }
            batch.upsert(table, row);
            outcome.upserted += 1;
        }

        if delete_missing {
            for id in self.store.local_ids(table)? {
                if remote_ids.contains(&id) {
                    continue;
                }
                if self.cascade_has_pending(table, id)? {
                    outcome.pending_kept += 1;
                } else {
                    batch.delete(table, id);
                    outcome.deleted += 1;
                }
            }
        }

        self.store.commit(batch)?;
        Ok(outcome)
    }

    /// True if the row or any child its delete would cascade to has unsynced entries.
    fn cascade_has_pending(&self, table: &str, record_id: i64) -> SyncResult<bool> {
        for (table, id) in self.store.cascade_targets(table, record_id)? {
            if !self.store.unsynced_entries_for(&table, id)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn pending_for(
        &self,
        table: &str,
        record_id: i64,
        superseded: &HashSet<u64>,
    ) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(self
            .store
            .unsynced_entries_for(table, record_id)?
            .into_iter()
            .filter(|e| !superseded.contains(&e.id))
            .collect())
    }
}

/// What an incoming change does to the local row.
enum IncomingWrite {
    Delete,
    Column(String),
    Row(Record),
}

impl IncomingWrite {
    fn overwrites(&self, local: &ChangelogEntry) -> bool {
        match self {
            IncomingWrite::Column(column) => {
                local.change_type == ChangeType::Update
                    && local.column_name.as_deref() == Some(column.as_str())
            }
            IncomingWrite::Delete | IncomingWrite::Row(_) => true,
        }
    }
}

fn latest_timestamp(entries: &[ChangelogEntry]) -> Option<u64> {
    entries.iter().map(|e| e.timestamp).max()
}
