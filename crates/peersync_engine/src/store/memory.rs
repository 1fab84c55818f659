//! In-memory local store.

use super::{LocalStore, WriteBatch, WriteOp};
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use peersync_protocol::{
    default_entities, ChangelogEntry, EntityKind, NewChangelogEntry, NewPeer, Peer, Record,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

type Tables = BTreeMap<String, BTreeMap<i64, Record>>;

#[derive(Debug, Default)]
struct Inner {
    next_changelog_id: u64,
    changelog: Vec<ChangelogEntry>,
    next_peer_id: u64,
    peers: BTreeMap<u64, Peer>,
    tables: Tables,
}

/// A [`LocalStore`] kept in memory.
///
/// Commits are staged on a copy of the tables and swapped in only when
/// every write succeeded. Child rows are removed with their parent
/// according to the configured [`EntityKind`]s.
#[derive(Debug)]
pub struct MemoryLocalStore {
    inner: RwLock<Inner>,
    entities: Vec<EntityKind>,
    fail_commits: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store using the default entity set.
    pub fn new() -> Self {
        Self::with_entities(default_entities())
    }

    /// Creates an empty store using the given entity set for cascades.
    pub fn with_entities(entities: Vec<EntityKind>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_changelog_id: 1,
                next_peer_id: 1,
                ..Inner::default()
            }),
            entities,
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Makes every following commit fail (for testing rollback paths).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Inserts a row and records an `INSERT` changelog entry, as the business layer does.
    pub fn insert_tracked(&self, table: &str, row: Record) -> SyncResult<u64> {
        let timestamp = row.modified_at;
        let record_id = row.id;
        let mut inner = self.inner.write();
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record_id, row);
        Ok(Self::append(
            &mut inner,
            NewChangelogEntry::insert(table, record_id, timestamp),
        ))
    }

    /// Updates one column and records an `UPDATE` changelog entry.
    pub fn update_tracked(
        &self,
        table: &str,
        record_id: i64,
        column: &str,
        value: &str,
        timestamp: u64,
    ) -> SyncResult<u64> {
        let mut inner = self.inner.write();
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&record_id))
            .ok_or_else(|| SyncError::Store(format!("{table}/{record_id} does not exist")))?;
        let old_value = row.column(column).map(str::to_string);
        row.set_column(column, Some(value), timestamp);
        Ok(Self::append(
            &mut inner,
            NewChangelogEntry::update(
                table,
                record_id,
                column,
                old_value,
                Some(value.to_string()),
                timestamp,
            ),
        ))
    }

    /// Deletes a row and records a `DELETE` changelog entry.
    pub fn delete_tracked(&self, table: &str, record_id: i64, timestamp: u64) -> SyncResult<u64> {
        let mut inner = self.inner.write();
        self.delete_cascade(&mut inner.tables, table, record_id);
        Ok(Self::append(
            &mut inner,
            NewChangelogEntry::delete(table, record_id, timestamp),
        ))
    }

    /// Returns a copy of a table's rows, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.inner
            .read()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns a copy of the whole changelog.
    pub fn changelog(&self) -> Vec<ChangelogEntry> {
        self.inner.read().changelog.clone()
    }

    fn append(inner: &mut Inner, entry: NewChangelogEntry) -> u64 {
        let id = inner.next_changelog_id;
        inner.next_changelog_id += 1;
        inner.changelog.push(entry.into_entry(id));
        id
    }

    fn delete_cascade(&self, tables: &mut Tables, table: &str, record_id: i64) {
        let mut doomed = Vec::new();
        self.collect_cascade(tables, table, record_id, &mut doomed);
        for (table, id) in doomed {
            if let Some(rows) = tables.get_mut(&table) {
                rows.remove(&id);
            }
        }
    }

    /// Collects the row and, depth first, every child row pointing at it.
    fn collect_cascade(
        &self,
        tables: &Tables,
        table: &str,
        record_id: i64,
        out: &mut Vec<(String, i64)>,
    ) {
        let exists = tables
            .get(table)
            .is_some_and(|rows| rows.contains_key(&record_id));
        if !exists || out.iter().any(|(t, id)| t == table && *id == record_id) {
            return;
        }
        out.push((table.to_string(), record_id));

        let Some(kind) = self.entities.iter().find(|e| e.table == table) else {
            return;
        };
        let parent_key = record_id.to_string();
        for relation in &kind.children {
            let orphans: Vec<i64> = tables
                .get(&relation.table)
                .map(|rows| {
                    rows.values()
                        .filter(|r| r.column(&relation.foreign_key) == Some(parent_key.as_str()))
                        .map(|r| r.id)
                        .collect()
                })
                .unwrap_or_default();
            for child_id in orphans {
                self.collect_cascade(tables, &relation.table, child_id, out);
            }
        }
    }

    fn apply_op(&self, tables: &mut Tables, op: WriteOp) -> SyncResult<()> {
        match op {
            WriteOp::Upsert { table, row } => {
                tables.entry(table).or_default().insert(row.id, row);
            }
            WriteOp::SetColumn {
                table,
                record_id,
                column,
                value,
                modified_at,
            } => {
                let row = tables
                    .get_mut(&table)
                    .and_then(|rows| rows.get_mut(&record_id))
                    .ok_or_else(|| {
                        SyncError::Store(format!("{table}/{record_id} does not exist"))
                    })?;
                row.set_column(&column, value.as_deref(), modified_at);
            }
            WriteOp::Delete { table, record_id } => {
                self.delete_cascade(tables, &table, record_id);
            }
        }
        Ok(())
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryLocalStore {
    fn unsynced_changelog_entries(&self) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(self
            .inner
            .read()
            .changelog
            .iter()
            .filter(|e| !e.synced)
            .cloned()
            .collect())
    }

    fn unsynced_entries_for(&self, table: &str, record_id: i64) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(self
            .inner
            .read()
            .changelog
            .iter()
            .filter(|e| !e.synced && e.touches(table, record_id))
            .cloned()
            .collect())
    }

    fn changelog_since(&self, watermark: Option<u64>) -> SyncResult<Vec<ChangelogEntry>> {
        Ok(self
            .inner
            .read()
            .changelog
            .iter()
            .filter(|e| watermark.map_or(true, |w| e.timestamp > w))
            .cloned()
            .collect())
    }

    fn append_changelog(&self, entry: NewChangelogEntry) -> SyncResult<u64> {
        Ok(Self::append(&mut self.inner.write(), entry))
    }

    fn prune_changelog(&self, older_than: u64) -> SyncResult<usize> {
        let mut inner = self.inner.write();
        let before = inner.changelog.len();
        inner
            .changelog
            .retain(|e| !(e.synced && e.timestamp < older_than));
        Ok(before - inner.changelog.len())
    }

    fn all_peers(&self) -> SyncResult<Vec<Peer>> {
        Ok(self.inner.read().peers.values().cloned().collect())
    }

    fn add_peer(&self, peer: NewPeer) -> SyncResult<Option<Peer>> {
        let mut inner = self.inner.write();
        if inner
            .peers
            .values()
            .any(|p| p.matches(peer.ip_address, peer.port))
        {
            return Ok(None);
        }
        let id = inner.next_peer_id;
        inner.next_peer_id += 1;
        let peer = peer.into_peer(id);
        inner.peers.insert(id, peer.clone());
        Ok(Some(peer))
    }

    fn update_peer(&self, peer: &Peer) -> SyncResult<bool> {
        let mut inner = self.inner.write();
        if inner
            .peers
            .values()
            .any(|p| p.id != peer.id && p.matches(peer.ip_address, peer.port))
        {
            return Err(SyncError::Store(format!("peer {peer} is already registered")));
        }
        match inner.peers.get_mut(&peer.id) {
            Some(slot) => {
                *slot = peer.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_peer(&self, id: u64) -> SyncResult<bool> {
        Ok(self.inner.write().peers.remove(&id).is_some())
    }

    fn get_local_row(&self, table: &str, record_id: i64) -> SyncResult<Option<Record>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&record_id))
            .cloned())
    }

    fn local_ids(&self, table: &str) -> SyncResult<Vec<i64>> {
        Ok(self
            .inner
            .read()
            .tables
            .get(table)
            .map(|rows| rows.keys().copied().collect())
            .unwrap_or_default())
    }

    fn cascade_targets(&self, table: &str, record_id: i64) -> SyncResult<Vec<(String, i64)>> {
        let mut targets = Vec::new();
        self.collect_cascade(&self.inner.read().tables, table, record_id, &mut targets);
        Ok(targets)
    }

    fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::Store("commit rejected".into()));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let mut staged = inner.tables.clone();
        for op in batch.ops {
            self.apply_op(&mut staged, op)?;
        }
        inner.tables = staged;

        for entry in inner
            .changelog
            .iter_mut()
            .filter(|e| batch.mark_synced.contains(&e.id))
        {
            entry.synced = true;
        }
        Ok(())
    }
}
