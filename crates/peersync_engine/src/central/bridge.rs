//! Push/pull synchronization against the central store.

use super::{CentralConnector, CentralEndpoint, HealthStatus};
use crate::apply::{ChangeApplier, PullOutcome, WriteGate};
use crate::changelog::ChangelogTracker;
use crate::error::{SyncError, SyncResult};
use crate::log::{now_millis, SyncLog};
use crate::store::LocalStore;
use peersync_protocol::{ChangeType, ConflictStrategy, EntityKind, ReplicatedChange};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Unsynced entries found.
    pub attempted: usize,
    /// Entries committed centrally and marked synced.
    pub pushed: usize,
    /// Inserts whose row no longer exists locally; marked synced without sending.
    pub superseded: usize,
    /// Entries rejected by the central store; they stay unsynced.
    pub failed: usize,
}

/// Outcome of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Per-table results, in entity order.
    pub tables: Vec<(String, PullOutcome)>,
    /// Tables whose snapshot could not be fetched or applied.
    pub failed_tables: Vec<String>,
    /// When the pull finished (Unix millis).
    pub completed_at: u64,
}

impl PullReport {
    /// Returns true if every table was pulled.
    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty()
    }
}

/// Moves changes between the local store and the central store.
pub struct CentralSyncBridge {
    connector: Arc<dyn CentralConnector>,
    store: Arc<dyn LocalStore>,
    tracker: ChangelogTracker,
    applier: ChangeApplier,
    gate: WriteGate,
    entities: Vec<EntityKind>,
    log: SyncLog,
}

impl CentralSyncBridge {
    /// Creates a bridge.
    pub fn new(
        connector: Arc<dyn CentralConnector>,
        store: Arc<dyn LocalStore>,
        gate: WriteGate,
        entities: Vec<EntityKind>,
        log: SyncLog,
    ) -> Self {
        Self {
            connector,
            tracker: ChangelogTracker::new(Arc::clone(&store)),
            applier: ChangeApplier::new(Arc::clone(&store), Arc::clone(&gate)),
            store,
            gate,
            entities,
            log,
        }
    }

    /// Pushes every unsynced changelog entry in one central transaction.
    ///
    /// Entries are marked synced only after the commit succeeds. A rejected
    /// entry stays unsynced without failing the rest of the batch.
    pub fn push(&self, endpoint: &CentralEndpoint) -> SyncResult<PushReport> {
        let entries = self.tracker.unsynced()?;
        let mut report = PushReport {
            attempted: entries.len(),
            ..PushReport::default()
        };
        if entries.is_empty() {
            self.log.info("Central push: nothing to push");
            return Ok(report);
        }

        let mut session = self.connector.connect(endpoint)?;
        let mut tx = session.begin()?;
        let mut done = Vec::with_capacity(entries.len());

        for entry in entries {
            let row = match entry.change_type {
                ChangeType::Delete => None,
                ChangeType::Insert | ChangeType::Update => self
                    .store
                    .get_local_row(&entry.table_name, entry.record_id)?,
            };
            if entry.change_type == ChangeType::Insert && row.is_none() {
                report.superseded += 1;
                done.push(entry.id);
                continue;
            }

            let change = ReplicatedChange::new(entry, row);
            match tx.apply(&change) {
                Ok(()) => {
                    report.pushed += 1;
                    done.push(change.entry.id);
                }
                Err(e) => {
                    report.failed += 1;
                    self.log.warn(format_args!(
                        "Central push: {} {}/{} rejected: {e}",
                        change.entry.change_type, change.entry.table_name, change.entry.record_id
                    ));
                }
            }
        }

        if done.is_empty() {
            tx.rollback()?;
            self.log.warn(format_args!(
                "Central push: all {} entries rejected",
                report.failed
            ));
            return Ok(report);
        }

        if let Err(e) = tx.commit() {
            self.log.error(format_args!("Central push: commit failed: {e}"));
            return Err(e);
        }

        {
            let _guard = self.gate.lock();
            self.tracker.mark_synced(done)?;
        }
        self.log.info(format_args!(
            "Central push: {} pushed, {} superseded, {} failed",
            report.pushed, report.superseded, report.failed
        ));
        Ok(report)
    }

    /// Pulls every entity's central snapshot into the local store.
    ///
    /// A table that cannot be fetched or applied is skipped and reported;
    /// the others still complete.
    pub fn pull(
        &self,
        endpoint: &CentralEndpoint,
        strategy: ConflictStrategy,
        delete_missing: bool,
    ) -> SyncResult<PullReport> {
        let mut session = self.connector.connect(endpoint)?;
        let mut report = PullReport::default();

        for kind in &self.entities {
            let applied = session.fetch_snapshot(&kind.table).and_then(|rows| {
                self.applier
                    .apply_snapshot(&kind.table, rows, strategy, delete_missing)
            });
            match applied {
                Ok(outcome) => {
                    self.log.info(format_args!(
                        "Central pull: {} upserted={} kept_local={} deleted={}",
                        kind.table, outcome.upserted, outcome.kept_local, outcome.deleted
                    ));
                    report.tables.push((kind.table.clone(), outcome));
                }
                Err(e) => {
                    self.log
                        .warn(format_args!("Central pull: {} skipped: {e}", kind.table));
                    report.failed_tables.push(kind.table.clone());
                }
            }
        }

        report.completed_at = now_millis();
        Ok(report)
    }

    /// Probes the central store, bounded by the endpoint timeout.
    ///
    /// Succeeds only on an explicit [`HealthStatus::Ok`].
    pub fn test_connection(&self, endpoint: &CentralEndpoint) -> SyncResult<()> {
        let (tx, rx) = mpsc::channel();
        let connector = Arc::clone(&self.connector);
        let probe_endpoint = endpoint.clone();
        // left running if it outlives the timeout
        let _probe = thread::Builder::new()
            .name("central-probe".into())
            .spawn(move || {
                let result = connector
                    .connect(&probe_endpoint)
                    .and_then(|mut session| session.health());
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(endpoint.timeout) {
            Ok(Ok(HealthStatus::Ok)) => Ok(()),
            Ok(Ok(HealthStatus::Degraded(reason))) => Err(SyncError::Central(reason)),
            Ok(Err(e)) => Err(e),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(SyncError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(SyncError::Central("health probe aborted".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::MemoryCentralStore;
    use crate::store::MemoryLocalStore;
    use peersync_protocol::{default_entities, Record};
    use std::time::Duration;

    struct Fixture {
        local: Arc<MemoryLocalStore>,
        central: MemoryCentralStore,
        bridge: CentralSyncBridge,
    }

    fn fixture() -> Fixture {
        let local = Arc::new(MemoryLocalStore::new());
        let central = MemoryCentralStore::new();
        let bridge = CentralSyncBridge::new(
            Arc::new(central.clone()),
            local.clone(),
            WriteGate::default(),
            default_entities(),
            SyncLog::disabled(),
        );
        Fixture {
            local,
            central,
            bridge,
        }
    }

    fn endpoint() -> CentralEndpoint {
        CentralEndpoint {
            url: "memory://central".into(),
            auth_token: None,
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn push_is_idempotent() {
        let f = fixture();
        f.local
            .insert_tracked("users", Record::new(1, 10).with_column("name", "Ada"))
            .unwrap();
        f.local.update_tracked("users", 1, "name", "Ada L.", 20).unwrap();

        let first = f.bridge.push(&endpoint()).unwrap();
        assert_eq!(first.pushed, 2);
        assert!(f.local.unsynced_changelog_entries().unwrap().is_empty());
        let after_first = f.central.rows("users");
        assert_eq!(after_first[0].column("name"), Some("Ada L."));

        let second = f.bridge.push(&endpoint()).unwrap();
        assert_eq!(second, PushReport::default());
        assert_eq!(f.central.rows("users"), after_first);
        assert_eq!(f.central.commit_count(), 1);
    }

    #[test]
    fn local_edit_survives_peer_edit_of_another_column() {
        let f = fixture();
        let row = Record::new(1, 1)
            .with_column("title", "T1")
            .with_column("status", "draft");
        f.local.upsert_into_local("plans", &[row.clone()]).unwrap();
        f.central.put_row("plans", row);
        f.local.update_tracked("plans", 1, "status", "approved", 100).unwrap();

        let from_peer = ReplicatedChange::new(
            peersync_protocol::NewChangelogEntry::update(
                "plans",
                1,
                "title",
                Some("T1".into()),
                Some("T2".into()),
                200,
            )
            .into_entry(7),
            None,
        );
        ChangeApplier::new(f.local.clone(), WriteGate::default())
            .apply_changes(vec![from_peer], ConflictStrategy::LastWriteWins)
            .unwrap();

        let report = f.bridge.push(&endpoint()).unwrap();
        assert_eq!(report.pushed, 1);
        let central = &f.central.rows("plans")[0];
        assert_eq!(central.column("status"), Some("approved"));
        assert_eq!(central.column("title"), Some("T2"));
    }

    #[test]
    fn failing_entry_stays_unsynced() {
        let f = fixture();
        f.central.fail_record("users", 2);
        for id in 1..=3 {
            f.local.insert_tracked("users", Record::new(id, id as u64)).unwrap();
        }

        let report = f.bridge.push(&endpoint()).unwrap();
        assert_eq!((report.pushed, report.failed), (2, 1));

        let unsynced = f.local.unsynced_changelog_entries().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].record_id, 2);
        let ids: Vec<i64> = f.central.rows("users").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn failed_commit_marks_nothing() {
        let f = fixture();
        f.central.set_fail_commits(true);
        f.local.insert_tracked("users", Record::new(1, 1)).unwrap();

        assert!(f.bridge.push(&endpoint()).is_err());
        assert_eq!(f.local.unsynced_changelog_entries().unwrap().len(), 1);
        assert!(f.central.rows("users").is_empty());
    }

    #[test]
    fn insert_of_deleted_row_is_superseded() {
        let f = fixture();
        f.central.put_row("users", Record::new(1, 1));
        f.local.insert_tracked("users", Record::new(1, 5)).unwrap();
        f.local.delete_tracked("users", 1, 6).unwrap();

        let report = f.bridge.push(&endpoint()).unwrap();
        assert_eq!((report.superseded, report.pushed), (1, 1));
        assert!(f.central.rows("users").is_empty());
        assert!(f.local.unsynced_changelog_entries().unwrap().is_empty());
    }

    #[test]
    fn pull_is_idempotent_and_isolates_failures() {
        let f = fixture();
        f.central.put_row("users", Record::new(1, 1).with_column("name", "Ada"));
        f.central.put_row("plans", Record::new(7, 1).with_column("title", "Q3"));
        f.central.fail_fetch("documents");

        let first = f
            .bridge
            .pull(&endpoint(), ConflictStrategy::LastWriteWins, false)
            .unwrap();
        assert_eq!(first.failed_tables, vec!["documents".to_string()]);
        assert!(!first.is_complete());
        assert_eq!(first.tables.len(), 4);

        let users = f.local.rows("users");
        let plans = f.local.rows("plans");
        f.bridge
            .pull(&endpoint(), ConflictStrategy::LastWriteWins, false)
            .unwrap();
        assert_eq!(f.local.rows("users"), users);
        assert_eq!(f.local.rows("plans"), plans);
    }

    #[test]
    fn pull_prunes_only_when_enabled() {
        let f = fixture();
        f.central.put_row("plans", Record::new(1, 1));
        f.local
            .upsert_into_local("plans", &[Record::new(1, 1), Record::new(2, 1)])
            .unwrap();
        f.local
            .upsert_into_local("documents", &[Record::new(5, 1).with_column("plan_id", "2")])
            .unwrap();

        f.bridge
            .pull(&endpoint(), ConflictStrategy::LastWriteWins, false)
            .unwrap();
        assert_eq!(f.local.local_ids("plans").unwrap(), vec![1, 2]);

        f.bridge
            .pull(&endpoint(), ConflictStrategy::LastWriteWins, true)
            .unwrap();
        assert_eq!(f.local.local_ids("plans").unwrap(), vec![1]);
        assert!(f.local.local_ids("documents").unwrap().is_empty());
    }

    #[test]
    fn connection_test_requires_explicit_ok() {
        let f = fixture();
        assert!(f.bridge.test_connection(&endpoint()).is_ok());

        f.central.set_degraded(true);
        assert!(f.bridge.test_connection(&endpoint()).is_err());
        f.central.set_degraded(false);

        f.central.set_health_delay(Some(Duration::from_secs(2)));
        assert!(matches!(
            f.bridge.test_connection(&endpoint()),
            Err(SyncError::Timeout)
        ));

        f.central.set_health_delay(None);
        f.central.set_unreachable(true);
        assert!(f.bridge.test_connection(&endpoint()).is_err());
    }
}
