//! Central store connectivity.
//!
//! The central store is reached through a [`CentralConnector`] supplied by
//! the embedding application. A connector turns a [`CentralEndpoint`] into a
//! [`CentralSession`], which can probe health, read whole-table snapshots
//! and open a [`CentralTransaction`] for pushing changes.

mod bridge;
mod memory;

pub use bridge::{CentralSyncBridge, PullReport, PushReport};
pub use memory::MemoryCentralStore;

use crate::error::SyncResult;
use peersync_protocol::{Record, ReplicatedChange};
use std::fmt;
use std::time::Duration;

/// Where and how to reach the central store.
#[derive(Clone, PartialEq, Eq)]
pub struct CentralEndpoint {
    /// Connection URL.
    pub url: String,
    /// Bearer token, if the store requires one.
    pub auth_token: Option<String>,
    /// Bound on every call.
    pub timeout: Duration,
}

impl fmt::Debug for CentralEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralEndpoint")
            .field("url", &self.url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// The store answered and is serving.
    Ok,
    /// The store answered but reported a problem.
    Degraded(String),
}

/// Opens sessions against the central store.
pub trait CentralConnector: Send + Sync {
    /// Connects to the endpoint.
    fn connect(&self, endpoint: &CentralEndpoint) -> SyncResult<Box<dyn CentralSession>>;
}

/// An open connection to the central store.
pub trait CentralSession: Send {
    /// Probes the store.
    fn health(&mut self) -> SyncResult<HealthStatus>;

    /// Reads every row of a table.
    fn fetch_snapshot(&mut self, table: &str) -> SyncResult<Vec<Record>>;

    /// Opens a write transaction.
    fn begin(&mut self) -> SyncResult<Box<dyn CentralTransaction + '_>>;
}

/// A write transaction on the central store.
///
/// Each `apply` is atomic on its own: a failed statement leaves the
/// transaction usable and unchanged.
pub trait CentralTransaction {
    /// Applies one local change.
    fn apply(&mut self, change: &ReplicatedChange) -> SyncResult<()>;

    /// Commits every applied change. On failure nothing is kept.
    fn commit(self: Box<Self>) -> SyncResult<()>;

    /// Discards every applied change.
    fn rollback(self: Box<Self>) -> SyncResult<()>;
}
