//! Introspected table and view metadata.

use crate::models::schema::quote_ident;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A column read from the live schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDetail {
    /// Column name.
    pub name: String,
    /// Data type as reported by the engine (e.g., "integer", "DATETIME").
    pub data_type: String,
    /// Whether the column allows NULL values.
    pub is_nullable: bool,
    /// Whether this column is part of the primary key.
    pub is_primary_key: bool,
    /// Column position (1-based ordinal).
    pub ordinal_position: i32,
}

/// Whether a reflected relation is a table or a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Table,
    View,
}

/// Handle to an introspected table or view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedTable {
    pub name: String,
    pub kind: RelationKind,
    pub columns: Vec<ColumnDetail>,
}

impl ReflectedTable {
    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDetail> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Get a column by 0-based ordinal.
    pub fn column_at(&self, index: usize) -> Option<&ColumnDetail> {
        self.columns.get(index)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// `SELECT` of every reflected column.
    pub fn select_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(&c.name)).collect();
        format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&self.name))
    }
}

/// Every table and view found in the current schema, keyed by name.
///
/// Built once during bootstrap when reflection is requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedCatalog {
    relations: BTreeMap<String, ReflectedTable>,
}

impl ReflectedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: ReflectedTable) {
        self.relations.insert(table.name.clone(), table);
    }

    /// Get a table or view by name.
    pub fn get(&self, name: &str) -> Option<&ReflectedTable> {
        self.relations.get(name)
    }

    /// Names of all relations, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.relations.keys().map(String::as_str).collect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &ReflectedTable> {
        self.relations.values().filter(|t| t.kind == RelationKind::Table)
    }

    pub fn views(&self) -> impl Iterator<Item = &ReflectedTable> {
        self.relations.values().filter(|t| t.kind == RelationKind::View)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
