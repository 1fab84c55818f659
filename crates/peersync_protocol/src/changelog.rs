//! Changelog entries.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type of a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    /// Row was created.
    Insert,
    /// Row was modified.
    Update,
    /// Row was removed.
    Delete,
}

impl ChangeType {
    /// Returns the canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeType::Insert),
            "UPDATE" => Ok(ChangeType::Update),
            "DELETE" => Ok(ChangeType::Delete),
            _ => Err(ProtocolError::unknown("change type", s)),
        }
    }
}

/// One row of the local changelog.
///
/// Entries are appended by the business layer whenever it mutates a
/// replicated entity. The `synced` flag only ever moves from `false` to
/// `true`: once an entry has reached the central store (or has been
/// superseded by conflict resolution) it is never pushed again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Local sequence number.
    pub id: u64,
    /// Replicated table the mutation touched.
    pub table_name: String,
    /// Primary key of the mutated row.
    pub record_id: i64,
    /// Kind of mutation.
    pub change_type: ChangeType,
    /// Changed column (updates only).
    pub column_name: Option<String>,
    /// Previous value (updates only).
    pub old_value: Option<String>,
    /// New value (updates only).
    pub new_value: Option<String>,
    /// Mutation time in Unix milliseconds.
    pub timestamp: u64,
    /// Whether the entry has been pushed to the central store.
    pub synced: bool,
}

impl ChangelogEntry {
    /// Returns true if this entry refers to the given row.
    pub fn touches(&self, table_name: &str, record_id: i64) -> bool {
        self.record_id == record_id && self.table_name == table_name
    }

    /// Ordering key used for batches: timestamp first, then local sequence.
    pub fn causal_key(&self) -> (u64, u64) {
        (self.timestamp, self.id)
    }
}

/// A changelog entry before the store assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangelogEntry {
    /// Replicated table.
    pub table_name: String,
    /// Primary key of the mutated row.
    pub record_id: i64,
    /// Kind of mutation.
    pub change_type: ChangeType,
    /// Changed column (updates only).
    pub column_name: Option<String>,
    /// Previous value (updates only).
    pub old_value: Option<String>,
    /// New value (updates only).
    pub new_value: Option<String>,
    /// Mutation time in Unix milliseconds.
    pub timestamp: u64,
}

impl NewChangelogEntry {
    /// Creates an insert entry.
    pub fn insert(table_name: impl Into<String>, record_id: i64, timestamp: u64) -> Self {
        Self::bare(table_name, record_id, ChangeType::Insert, timestamp)
    }

    /// Creates a delete entry.
    pub fn delete(table_name: impl Into<String>, record_id: i64, timestamp: u64) -> Self {
        Self::bare(table_name, record_id, ChangeType::Delete, timestamp)
    }

    /// Creates a column-level update entry.
    pub fn update(
        table_name: impl Into<String>,
        record_id: i64,
        column_name: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            record_id,
            change_type: ChangeType::Update,
            column_name: Some(column_name.into()),
            old_value,
            new_value,
            timestamp,
        }
    }

    fn bare(
        table_name: impl Into<String>,
        record_id: i64,
        change_type: ChangeType,
        timestamp: u64,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            record_id,
            change_type,
            column_name: None,
            old_value: None,
            new_value: None,
            timestamp,
        }
    }

    /// Materializes the entry with its assigned id, unsynced.
    pub fn into_entry(self, id: u64) -> ChangelogEntry {
        ChangelogEntry {
            id,
            table_name: self.table_name,
            record_id: self.record_id,
            change_type: self.change_type,
            column_name: self.column_name,
            old_value: self.old_value,
            new_value: self.new_value,
            timestamp: self.timestamp,
            synced: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_parsing() {
        assert_eq!("INSERT".parse::<ChangeType>().unwrap(), ChangeType::Insert);
        assert_eq!("update".parse::<ChangeType>().unwrap(), ChangeType::Update);
        assert_eq!(" Delete ".parse::<ChangeType>().unwrap(), ChangeType::Delete);
        assert!("UPSERT".parse::<ChangeType>().is_err());
        assert_eq!(ChangeType::Update.to_string(), "UPDATE");
    }

    #[test]
    fn new_entries_start_unsynced() {
        let entry = NewChangelogEntry::insert("plans", 7, 1_000).into_entry(3);
        assert_eq!(entry.id, 3);
        assert!(!entry.synced);
        assert!(entry.column_name.is_none());
        assert!(entry.touches("plans", 7));
        assert!(!entry.touches("users", 7));
    }

    #[test]
    fn update_entries_carry_column_values() {
        let entry = NewChangelogEntry::update(
            "users",
            1,
            "email",
            Some("a@x.org".into()),
            Some("b@x.org".into()),
            5,
        )
        .into_entry(1);

        assert_eq!(entry.change_type, ChangeType::Update);
        assert_eq!(entry.column_name.as_deref(), Some("email"));
        assert_eq!(entry.new_value.as_deref(), Some("b@x.org"));
    }

    #[test]
    fn causal_key_orders_by_time_then_id() {
        let a = NewChangelogEntry::insert("t", 1, 10).into_entry(2);
        let b = NewChangelogEntry::insert("t", 1, 10).into_entry(1);
        let c = NewChangelogEntry::insert("t", 1, 5).into_entry(9);

        let mut entries = [a, b, c];
        entries.sort_by_key(ChangelogEntry::causal_key);
        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![9, 1, 2]);
    }
}
