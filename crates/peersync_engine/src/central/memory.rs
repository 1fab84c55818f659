//! In-memory central store for tests and local setups.

use super::{CentralConnector, CentralEndpoint, CentralSession, CentralTransaction, HealthStatus};
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use peersync_protocol::{ChangeType, Record, ReplicatedChange};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Tables = BTreeMap<String, BTreeMap<i64, Record>>;

#[derive(Default)]
struct State {
    tables: Mutex<Tables>,
    failing_records: Mutex<HashSet<(String, i64)>>,
    failing_fetches: Mutex<HashSet<String>>,
    fail_commits: AtomicBool,
    unreachable: AtomicBool,
    degraded: AtomicBool,
    health_delay: Mutex<Option<Duration>>,
    required_token: Mutex<Option<String>>,
    commits: AtomicUsize,
}

/// A central store kept in memory, with failure injection.
///
/// Clones share the same data, so a test can keep one handle for
/// inspection while the engine uses another as its connector.
#[derive(Clone, Default)]
pub struct MemoryCentralStore {
    state: Arc<State>,
}

impl MemoryCentralStore {
    /// Creates an empty, healthy store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires sessions to present this auth token.
    pub fn with_required_token(self, token: impl Into<String>) -> Self {
        *self.state.required_token.lock() = Some(token.into());
        self
    }

    /// Seeds a row directly.
    pub fn put_row(&self, table: &str, row: Record) {
        self.state
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(row.id, row);
    }

    /// Removes a row directly.
    pub fn remove_row(&self, table: &str, id: i64) {
        if let Some(rows) = self.state.tables.lock().get_mut(table) {
            rows.remove(&id);
        }
    }

    /// Returns a table's rows, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.state
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Makes every statement touching this row fail.
    pub fn fail_record(&self, table: &str, id: i64) {
        self.state
            .failing_records
            .lock()
            .insert((table.to_string(), id));
    }

    /// Makes snapshot reads of this table fail.
    pub fn fail_fetch(&self, table: &str) {
        self.state.failing_fetches.lock().insert(table.to_string());
    }

    /// Makes commits fail.
    pub fn set_fail_commits(&self, fail: bool) {
        self.state.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes connection attempts fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Makes health probes report a degraded store.
    pub fn set_degraded(&self, degraded: bool) {
        self.state.degraded.store(degraded, Ordering::SeqCst);
    }

    /// Delays health probes.
    pub fn set_health_delay(&self, delay: Option<Duration>) {
        *self.state.health_delay.lock() = delay;
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }
}

impl CentralConnector for MemoryCentralStore {
    fn connect(&self, endpoint: &CentralEndpoint) -> SyncResult<Box<dyn CentralSession>> {
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable(format!(
                "cannot reach {}",
                endpoint.url
            )));
        }
        if let Some(required) = self.state.required_token.lock().as_deref() {
            if endpoint.auth_token.as_deref() != Some(required) {
                return Err(SyncError::Central("authentication rejected".into()));
            }
        }
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySession {
    state: Arc<State>,
}

impl CentralSession for MemorySession {
    fn health(&mut self) -> SyncResult<HealthStatus> {
        let delay = *self.state.health_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.state.degraded.load(Ordering::SeqCst) {
            return Ok(HealthStatus::Degraded("read-only maintenance".into()));
        }
        Ok(HealthStatus::Ok)
    }

    fn fetch_snapshot(&mut self, table: &str) -> SyncResult<Vec<Record>> {
        if self.state.failing_fetches.lock().contains(table) {
            return Err(SyncError::Central(format!("cannot read {table}")));
        }
        Ok(self
            .state
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn begin(&mut self) -> SyncResult<Box<dyn CentralTransaction + '_>> {
        let staged = self.state.tables.lock().clone();
        Ok(Box::new(MemoryTransaction {
            state: &self.state,
            staged,
        }))
    }
}

struct MemoryTransaction<'a> {
    state: &'a State,
    staged: Tables,
}

impl CentralTransaction for MemoryTransaction<'_> {
    fn apply(&mut self, change: &ReplicatedChange) -> SyncResult<()> {
        let entry = &change.entry;
        if self
            .state
            .failing_records
            .lock()
            .contains(&(entry.table_name.clone(), entry.record_id))
        {
            return Err(SyncError::Central(format!(
                "constraint violation on {}/{}",
                entry.table_name, entry.record_id
            )));
        }

        let rows = self.staged.entry(entry.table_name.clone()).or_default();
        match (entry.change_type, &change.row) {
            (ChangeType::Delete, _) => {
                rows.remove(&entry.record_id);
            }
            (_, Some(row)) => {
                rows.insert(row.id, row.clone());
            }
            (ChangeType::Update, None) => {
                let row = rows.get_mut(&entry.record_id).ok_or_else(|| {
                    SyncError::Central(format!(
                        "{}/{} does not exist",
                        entry.table_name, entry.record_id
                    ))
                })?;
                let column = entry.column_name.as_deref().ok_or_else(|| {
                    SyncError::Central("update without row or column".into())
                })?;
                row.set_column(column, entry.new_value.as_deref(), entry.timestamp);
            }
            (ChangeType::Insert, None) => {
                return Err(SyncError::Central("insert without row".into()));
            }
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> SyncResult<()> {
        if self.state.fail_commits.load(Ordering::SeqCst) {
            return Err(SyncError::Central("commit failed".into()));
        }
        *self.state.tables.lock() = self.staged;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(self: Box<Self>) -> SyncResult<()> {
        Ok(())
    }
}
