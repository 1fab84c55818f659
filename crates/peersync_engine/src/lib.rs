//! # PeerSync Engine
//!
//! Keeps a local record store eventually consistent with peer installations
//! and a central store.
//!
//! This crate provides:
//! - Changelog tracking and a peer registry over a [`LocalStore`]
//! - UDP peer discovery
//! - TCP peer replication (listener and client)
//! - Central push/pull through a [`CentralConnector`]
//! - Conflict-aware application of remote changes
//! - A scheduler and lifecycle driven by [`SyncOrchestrator`]
//!
//! ## Architecture
//!
//! The orchestrator owns the configuration and starts a subset of
//! background services based on the sync role and hybrid mode:
//!
//! - **Server**: replication listener plus discovery listener
//! - **Client**: scheduled P2P cycle against trusted peers plus a
//!   scheduled discovery round
//! - **Central**: scheduled push then pull against the central store
//!
//! ## Key Invariants
//!
//! - A changelog entry is marked synced only after a successful central
//!   commit, or when conflict resolution supersedes it
//! - A peer endpoint `(ip, port)` is registered at most once
//! - Local rows are deleted on pull only when explicitly enabled
//! - Every engine write to the local store is one atomic batch

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod central;
mod changelog;
mod config;
mod config_store;
mod discovery;
mod error;
mod lifecycle;
mod log;
mod orchestrator;
mod peers;
mod scheduler;
mod store;
mod transport;

pub use apply::{ApplyOutcome, ChangeApplier, PullOutcome, WriteGate};
pub use central::{
    CentralConnector, CentralEndpoint, CentralSession, CentralSyncBridge, CentralTransaction,
    HealthStatus, MemoryCentralStore, PullReport, PushReport,
};
pub use changelog::ChangelogTracker;
pub use config::{keys, HybridMode, NetworkConfig, SharedConfig, SyncConfiguration, SyncRole};
pub use config_store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore};
pub use discovery::{local_ipv4, DiscoveryListener, DiscoveryReport, DiscoveryService};
pub use error::{SyncError, SyncResult};
pub use lifecycle::{Lifecycle, LifecycleState, StateTransition};
pub use log::{format_clock, now_millis, LogSink, SyncLog};
pub use orchestrator::{OrchestratorBuilder, P2pReport, SyncOrchestrator};
pub use peers::PeerRegistry;
pub use scheduler::{CancelToken, Scheduler};
pub use store::{LocalStore, MemoryLocalStore, WriteBatch, WriteOp};
pub use transport::{
    read_message, write_message, ExchangeHandler, ExchangeSummary, PeerExchanger, PeerListener,
    PeerTransport, TcpPeerTransport,
};
