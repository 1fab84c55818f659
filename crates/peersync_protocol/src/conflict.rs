//! Conflict resolution.
//!
//! A conflict exists when an incoming value (from the central store or a
//! peer) would overwrite a local row that still has unsynced changelog
//! entries. [`resolve`] decides which side wins; it performs no I/O.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Later timestamp wins; ties go to the incoming value.
    #[default]
    LastWriteWins,
    /// The incoming (central or peer) value always wins.
    ServerWins,
    /// The local value always wins.
    ClientWins,
}

impl ConflictStrategy {
    /// Returns the canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "LastWriteWins",
            ConflictStrategy::ServerWins => "ServerWins",
            ConflictStrategy::ClientWins => "ClientWins",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "lastwritewins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "serverwins" => Ok(ConflictStrategy::ServerWins),
            "clientwins" => Ok(ConflictStrategy::ClientWins),
            _ => Err(ProtocolError::unknown("conflict strategy", s)),
        }
    }
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Overwrite the local row; pending local entries are superseded.
    AcceptIncoming,
    /// Keep the local row; the incoming value is dropped for this record.
    KeepLocal,
}

/// A value stamped with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// The value.
    pub value: T,
    /// Write time in Unix milliseconds.
    pub timestamp: u64,
}

impl<T> Versioned<T> {
    /// Creates a versioned value.
    pub fn new(value: T, timestamp: u64) -> Self {
        Self { value, timestamp }
    }
}

/// Decides which side of a conflict wins.
pub fn resolve<L, R>(
    strategy: ConflictStrategy,
    local: &Versioned<L>,
    incoming: &Versioned<R>,
) -> Resolution {
    match strategy {
        ConflictStrategy::ServerWins => Resolution::AcceptIncoming,
        ConflictStrategy::ClientWins => Resolution::KeepLocal,
        ConflictStrategy::LastWriteWins => {
            if incoming.timestamp >= local.timestamp {
                Resolution::AcceptIncoming
            } else {
                Resolution::KeepLocal
            }
        }
    }
}

/// Returns the winning value of a conflict between two values of one type.
pub fn winner<'a, T>(
    strategy: ConflictStrategy,
    local: &'a Versioned<T>,
    incoming: &'a Versioned<T>,
) -> &'a T {
    match resolve(strategy, local, incoming) {
        Resolution::AcceptIncoming => &incoming.value,
        Resolution::KeepLocal => &local.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn last_write_wins_prefers_newer_incoming() {
        let local = Versioned::new("A", 100);
        let incoming = Versioned::new("B", 200);
        assert_eq!(
            winner(ConflictStrategy::LastWriteWins, &local, &incoming),
            &"B"
        );
    }

    #[test]
    fn last_write_wins_keeps_newer_local() {
        let local = Versioned::new("A", 300);
        let incoming = Versioned::new("B", 200);
        assert_eq!(
            resolve(ConflictStrategy::LastWriteWins, &local, &incoming),
            Resolution::KeepLocal
        );
    }

    #[test]
    fn last_write_wins_tie_goes_to_incoming() {
        let local = Versioned::new("A", 200);
        let incoming = Versioned::new("B", 200);
        assert_eq!(
            resolve(ConflictStrategy::LastWriteWins, &local, &incoming),
            Resolution::AcceptIncoming
        );
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "LastWriteWins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::LastWriteWins
        );
        assert_eq!(
            "SERVER_WINS".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::ServerWins
        );
        assert_eq!(
            "client-wins".parse::<ConflictStrategy>().unwrap(),
            ConflictStrategy::ClientWins
        );
        assert!("Merge".parse::<ConflictStrategy>().is_err());
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriteWins);
    }

    proptest! {
        #[test]
        fn client_wins_ignores_timestamps(t1 in any::<u64>(), t2 in any::<u64>()) {
            let local = Versioned::new(1, t1);
            let incoming = Versioned::new(2, t2);
            prop_assert_eq!(*winner(ConflictStrategy::ClientWins, &local, &incoming), 1);
        }

        #[test]
        fn server_wins_ignores_timestamps(t1 in any::<u64>(), t2 in any::<u64>()) {
            let local = Versioned::new(1, t1);
            let incoming = Versioned::new(2, t2);
            prop_assert_eq!(*winner(ConflictStrategy::ServerWins, &local, &incoming), 2);
        }

        #[test]
        fn last_write_wins_picks_the_later_stamp(t1 in any::<u64>(), t2 in any::<u64>()) {
            let local = Versioned::new(1, t1);
            let incoming = Versioned::new(2, t2);
            let expected = if t2 >= t1 { 2 } else { 1 };
            prop_assert_eq!(*winner(ConflictStrategy::LastWriteWins, &local, &incoming), expected);
        }
    }
}
