//! Generic replicated rows and the entities they belong to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of a replicated entity.
///
/// Rows are replaced as a whole on upsert; columns are kept as text so
/// the engine stays agnostic of the business schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: i64,
    /// Last modification time in Unix milliseconds.
    pub modified_at: u64,
    /// Column values by name.
    pub columns: BTreeMap<String, String>,
}

impl Record {
    /// Creates a row with no columns.
    pub fn new(id: i64, modified_at: u64) -> Self {
        Self {
            id,
            modified_at,
            columns: BTreeMap::new(),
        }
    }

    /// Adds a column value.
    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    /// Returns a column value.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns.get(name).map(String::as_str)
    }

    /// Sets a single column, or clears it when `value` is `None`.
    pub fn set_column(&mut self, name: &str, value: Option<&str>, modified_at: u64) {
        match value {
            Some(v) => {
                self.columns.insert(name.to_string(), v.to_string());
            }
            None => {
                self.columns.remove(name);
            }
        }
        self.modified_at = self.modified_at.max(modified_at);
    }
}

/// A child table whose rows reference a parent row through a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRelation {
    /// Child table name.
    pub table: String,
    /// Column in the child holding the parent id.
    pub foreign_key: String,
}

/// A replicated table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityKind {
    /// Table name.
    pub table: String,
    /// Tables whose rows are removed with a parent row.
    pub children: Vec<ChildRelation>,
}

impl EntityKind {
    /// Creates an entity with no children.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            children: Vec::new(),
        }
    }

    /// Declares a child table.
    pub fn with_child(mut self, table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.children.push(ChildRelation {
            table: table.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }
}

/// The application's replicated entities, parents first.
pub fn default_entities() -> Vec<EntityKind> {
    vec![
        EntityKind::new("users"),
        EntityKind::new("plans")
            .with_child("documents", "plan_id")
            .with_child("billing", "plan_id")
            .with_child("plan_logs", "plan_id"),
        EntityKind::new("documents"),
        EntityKind::new("billing"),
        EntityKind::new("plan_logs"),
    ]
}
