//! Changelog tracking.
//!
//! The changelog is the source of truth for what must be replicated. The
//! business layer appends to it; the engine reads it and flips the synced
//! flag, which never goes back to false.

use crate::error::SyncResult;
use crate::store::{LocalStore, WriteBatch};
use peersync_protocol::{ChangeType, ChangelogEntry, NewChangelogEntry, ReplicatedChange};
use std::sync::Arc;

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Read/mark access to the local changelog.
#[derive(Clone)]
pub struct ChangelogTracker {
    store: Arc<dyn LocalStore>,
}

impl ChangelogTracker {
    /// Creates a tracker over a store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Appends a local mutation.
    pub fn record(&self, entry: NewChangelogEntry) -> SyncResult<u64> {
        self.store.append_changelog(entry)
    }

    /// Entries not yet pushed to the central store, in timestamp order.
    pub fn unsynced(&self) -> SyncResult<Vec<ChangelogEntry>> {
        let mut entries = self.store.unsynced_changelog_entries()?;
        entries.sort_by_key(ChangelogEntry::causal_key);
        Ok(entries)
    }

    /// Flags entries as synced in one transaction.
    pub fn mark_synced(&self, ids: impl IntoIterator<Item = u64>) -> SyncResult<()> {
        let mut batch = WriteBatch::new();
        batch.mark_synced(ids);
        self.store.commit(batch)
    }

    /// Builds the outgoing batch for a peer exchange: every entry newer than
    /// the watermark, with the current row attached to inserts and updates.
    pub fn outgoing_since(&self, watermark: Option<u64>) -> SyncResult<Vec<ReplicatedChange>> {
        let mut entries = self.store.changelog_since(watermark)?;
        entries.sort_by_key(ChangelogEntry::causal_key);

        entries
            .into_iter()
            .map(|entry| {
                let row = match entry.change_type {
                    ChangeType::Delete => None,
                    ChangeType::Insert | ChangeType::Update => self
                        .store
                        .get_local_row(&entry.table_name, entry.record_id)?,
                };
                Ok(ReplicatedChange::new(entry, row))
            })
            .collect()
    }

    /// Drops synced entries older than the retention window. Returns the count removed.
    pub fn prune(&self, retention_days: u32, now: u64) -> SyncResult<usize> {
        let cutoff = now.saturating_sub(u64::from(retention_days) * MILLIS_PER_DAY);
        self.store.prune_changelog(cutoff)
    }
}
