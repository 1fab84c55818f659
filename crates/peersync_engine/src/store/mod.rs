//! The local record store the engine replicates.
//!
//! The store is implemented by the embedding application. It owns the
//! replicated tables, the changelog and the peer registry, and is the only
//! state shared between components. Every engine-side write goes through
//! [`LocalStore::commit`], which must apply a [`WriteBatch`] atomically.

mod memory;

pub use memory::MemoryLocalStore;

use crate::error::SyncResult;
use peersync_protocol::{ChangelogEntry, NewChangelogEntry, NewPeer, Peer, Record};

/// A single row-level write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert the row, or replace it entirely if it exists.
    Upsert {
        /// Target table.
        table: String,
        /// Full row.
        row: Record,
    },
    /// Change one column of an existing row.
    SetColumn {
        /// Target table.
        table: String,
        /// Row id.
        record_id: i64,
        /// Column name.
        column: String,
        /// New value; `None` clears the column.
        value: Option<String>,
        /// Time of the change.
        modified_at: u64,
    },
    /// Delete the row and its dependent child rows. Absent rows are a no-op.
    Delete {
        /// Target table.
        table: String,
        /// Row id.
        record_id: i64,
    },
}

/// A set of writes applied in one store transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// Row writes, in application order.
    pub ops: Vec<WriteOp>,
    /// Changelog entries to flag as synced in the same transaction.
    pub mark_synced: Vec<u64>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an upsert.
    pub fn upsert(&mut self, table: impl Into<String>, row: Record) -> &mut Self {
        self.ops.push(WriteOp::Upsert {
            table: table.into(),
            row,
        });
        self
    }

    /// Queues a column update.
    pub fn set_column(
        &mut self,
        table: impl Into<String>,
        record_id: i64,
        column: impl Into<String>,
        value: Option<String>,
        modified_at: u64,
    ) -> &mut Self {
        self.ops.push(WriteOp::SetColumn {
            table: table.into(),
            record_id,
            column: column.into(),
            value,
            modified_at,
        });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, table: impl Into<String>, record_id: i64) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table: table.into(),
            record_id,
        });
        self
    }

    /// Queues changelog entries to flag as synced.
    pub fn mark_synced(&mut self, ids: impl IntoIterator<Item = u64>) -> &mut Self {
        self.mark_synced.extend(ids);
        self
    }

    /// Returns true if the batch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.mark_synced.is_empty()
    }
}

/// Transactional access to the local store.
pub trait LocalStore: Send + Sync {
    /// All changelog entries with `synced == false`, in id order.
    fn unsynced_changelog_entries(&self) -> SyncResult<Vec<ChangelogEntry>>;

    /// Unsynced changelog entries for one row.
    fn unsynced_entries_for(&self, table: &str, record_id: i64) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(self
            .unsynced_changelog_entries()?
            .into_iter()
            .filter(|e| e.touches(table, record_id))
            .collect())
    }

    /// Changelog entries (synced or not) with `timestamp > watermark`; all entries for `None`.
    fn changelog_since(&self, watermark: Option<u64>) -> SyncResult<Vec<ChangelogEntry>>;

    /// Appends a changelog entry and returns its id.
    fn append_changelog(&self, entry: NewChangelogEntry) -> SyncResult<u64>;

    /// Flags one changelog entry as synced.
    fn mark_changelog_entry_synced(&self, id: u64) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.mark_synced([id]);
        self.commit(batch)
    }

    /// Removes synced entries older than `older_than` (Unix millis). Returns the count removed.
    fn prune_changelog(&self, older_than: u64) -> SyncResult<usize>;

    /// All known peers.
    fn all_peers(&self) -> SyncResult<Vec<Peer>>;

    /// Registers a peer. Returns `None` if its `(ip, port)` is already known.
    fn add_peer(&self, peer: NewPeer) -> SyncResult<Option<Peer>>;

    /// Overwrites a peer row. Returns false if the id is unknown.
    fn update_peer(&self, peer: &Peer) -> SyncResult<bool>;

    /// Removes a peer. Returns false if the id is unknown.
    fn delete_peer(&self, id: u64) -> SyncResult<bool>;

    /// Reads one row.
    fn get_local_row(&self, table: &str, record_id: i64) -> SyncResult<Option<Record>>;

    /// Ids of every row in a table.
    fn local_ids(&self, table: &str) -> SyncResult<Vec<i64>>;

    /// Rows a delete of `table/record_id` would remove, the row itself first.
    ///
    /// Stores without cascading deletes only return the row.
    fn cascade_targets(&self, table: &str, record_id: i64) -> SyncResult<Vec<(String, i64)>> {
        Ok(vec![(table.to_string(), record_id)])
    }

    /// Applies a batch atomically: either every write lands or none does.
    fn commit(&self, batch: WriteBatch) -> SyncResult<()>;

    /// Upserts rows keyed by id in one transaction.
    fn upsert_into_local(&self, table: &str, rows: &[Record]) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        for row in rows {
            batch.upsert(table, row.clone());
        }
        self.commit(batch)
    }

    /// Deletes a row (and its children). Deleting an absent id is a no-op.
    fn delete_local_by_id(&self, table: &str, record_id: i64) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(table, record_id);
        self.commit(batch)
    }
}
