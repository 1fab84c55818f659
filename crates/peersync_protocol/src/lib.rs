//! # PeerSync Protocol
//!
//! Replication types and wire formats for PeerSync.
//!
//! This crate provides:
//! - `ChangelogEntry` for local mutations awaiting propagation
//! - `Peer` for known remote installations
//! - `Record` and `EntityKind` for generic replicated rows
//! - Conflict resolution strategies (`resolve`)
//! - Peer exchange messages (CBOR frames)
//! - The UDP discovery payload format
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changelog;
pub mod conflict;
mod discovery;
mod error;
mod messages;
mod peer;
mod record;

pub use changelog::{ChangeType, ChangelogEntry, NewChangelogEntry};
pub use conflict::{resolve, ConflictStrategy, Resolution, Versioned};
pub use discovery::{DiscoveryAnnouncement, DISCOVERY_REQUEST};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    check_frame_len, sort_causally, ExchangeRequest, ExchangeResponse, PeerMessage,
    ReplicatedChange, TransportFlags, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use peer::{NewPeer, Peer, PeerStatus};
pub use record::{default_entities, ChildRelation, EntityKind, Record};
