//! View registration and two-phase schema materialization.
//!
//! Views are registered against a base's metadata first. Materialization
//! then creates the declared tables followed by each pending view that does
//! not exist yet. Teardown runs in reverse: existing views, then tables.

use crate::error::DbResult;
use crate::models::{
    drop_relation_sql, ReflectedCatalog, RelationKind, SchemaMetadata, Selectable, ViewDef,
    ViewHandle,
};
use crate::services::engine::Connection;

/// Parameters for one view.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub name: String,
    pub metadata: SchemaMetadata,
    pub selectable: Selectable,
}

impl ViewSpec {
    pub fn new(name: impl Into<String>, metadata: &SchemaMetadata, selectable: Selectable) -> Self {
        Self { name: name.into(), metadata: metadata.clone(), selectable }
    }
}

/// Register a view for creation with `metadata` and return its query handle.
pub fn register(name: &str, metadata: &SchemaMetadata, selectable: Selectable) -> ViewHandle {
    let view = ViewDef { name: name.to_string(), selectable };
    let handle = ViewHandle::new(&view);
    metadata.add_view(view);
    tracing::debug!(view = name, "Registered view");
    handle
}

/// Register several views, returning handles in the same order.
pub fn register_all(specs: Vec<ViewSpec>) -> Vec<ViewHandle> {
    specs.into_iter().map(|spec| register(&spec.name, &spec.metadata, spec.selectable)).collect()
}

/// Create declared tables, then pending views that do not exist yet.
pub fn create_all(conn: &mut dyn Connection, metadata: &SchemaMetadata) -> DbResult<()> {
    let dialect = conn.dialect().to_string();
    for table in metadata.tables() {
        conn.execute(&table.create_sql(&dialect))?;
    }

    let existing = conn.view_names()?;
    for view in metadata.views() {
        if existing.contains(&view.name) {
            tracing::debug!(view = %view.name, "View exists, skipping");
            continue;
        }
        conn.execute(&view.create_sql())?;
    }

    conn.commit()
}

/// Drop existing pending views in reverse order, then declared tables.
///
/// On PostgreSQL the drops cascade to dependent views and foreign keys.
pub fn drop_all(conn: &mut dyn Connection, metadata: &SchemaMetadata) -> DbResult<()> {
    let dialect = conn.dialect().to_string();
    let existing = conn.view_names()?;
    for view in metadata.views().iter().rev() {
        if existing.contains(&view.name) {
            conn.execute(&view.drop_sql(&dialect))?;
        }
    }
    for table in metadata.tables().iter().rev() {
        conn.execute(&table.drop_sql(&dialect))?;
    }

    conn.commit()
}

/// Drop everything in a reflected catalog: views first, then tables.
pub fn drop_reflected(conn: &mut dyn Connection, catalog: &ReflectedCatalog) -> DbResult<()> {
    let dialect = conn.dialect().to_string();
    let existing = conn.view_names()?;
    for view in catalog.views() {
        if existing.contains(&view.name) {
            conn.execute(&drop_relation_sql(RelationKind::View, &view.name, &dialect))?;
        }
    }
    for table in catalog.tables() {
        conn.execute(&drop_relation_sql(RelationKind::Table, &table.name, &dialect))?;
    }

    conn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, ColumnType, TableBase, TimezoneHandling};
    use crate::services::engine::Engine;
    use crate::testing::MockEngine;

    fn base_with_table() -> (TableBase, crate::models::TableDef) {
        let base = TableBase::new(TimezoneHandling::Naive);
        let table = base.define_table(
            "DBTestDate",
            vec![ColumnDef::new("test_date", ColumnType::Timestamp).primary_key()],
        );
        (base, table)
    }

    #[test]
    fn test_register_all_preserves_order() {
        let (base, table) = base_with_table();
        let handles = register_all(vec![
            ViewSpec::new("date_view", base.metadata(), Selectable::from_table(&table)),
            ViewSpec::new("other_view", base.metadata(), Selectable::from_table(&table)),
        ]);
        assert_eq!(handles[0].name(), "date_view");
        assert_eq!(handles[1].name(), "other_view");
        assert_eq!(handles[0].columns()[0].name, "test_date");
        assert_eq!(base.metadata().views().len(), 2);
    }

    #[test]
    fn test_create_all_tables_before_views_and_skips_existing() {
        let (base, table) = base_with_table();
        register("date_view", base.metadata(), Selectable::from_table(&table));
        register("old_view", base.metadata(), Selectable::from_table(&table));

        let engine = MockEngine::new("sqlite:///x.db").with_existing_view("old_view");
        let mut conn = engine.connect().unwrap();
        create_all(conn.as_mut(), base.metadata()).unwrap();

        let events = engine.log.events();
        let create_table = events.iter().position(|e| e.starts_with("execute: CREATE TABLE")).unwrap();
        let create_view = events.iter().position(|e| e.starts_with("execute: CREATE VIEW")).unwrap();
        assert!(create_table < create_view);
        assert_eq!(engine.log.count("execute: CREATE VIEW \"date_view\""), 1);
        assert_eq!(engine.log.count("execute: CREATE VIEW \"old_view\""), 0);
        assert_eq!(events.last().map(String::as_str), Some("commit"));

        // Second run creates nothing new
        create_all(conn.as_mut(), base.metadata()).unwrap();
        assert_eq!(engine.log.count("execute: CREATE VIEW"), 1);
    }

    #[test]
    fn test_drop_all_views_in_reverse_then_tables() {
        let (base, table) = base_with_table();
        register("first", base.metadata(), Selectable::from_table(&table));
        register("second", base.metadata(), Selectable::from_table(&table));

        let engine = MockEngine::new("sqlite:///x.db");
        let mut conn = engine.connect().unwrap();
        create_all(conn.as_mut(), base.metadata()).unwrap();
        drop_all(conn.as_mut(), base.metadata()).unwrap();

        let drops: Vec<String> = engine
            .log
            .events()
            .into_iter()
            .filter(|e| e.starts_with("execute: DROP"))
            .collect();
        assert_eq!(
            drops,
            vec![
                "execute: DROP VIEW \"second\"",
                "execute: DROP VIEW \"first\"",
                "execute: DROP TABLE IF EXISTS \"db_test_date\"",
            ]
        );

        // Views are gone, so a second drop only touches tables
        drop_all(conn.as_mut(), base.metadata()).unwrap();
        assert_eq!(engine.log.count("execute: DROP VIEW"), 2);
    }

    #[test]
    fn test_drop_all_cascades_to_dependents_on_postgresql() {
        let base = TableBase::new(TimezoneHandling::Naive);
        let members =
            base.define_table_named("members", vec![ColumnDef::new("org_id", ColumnType::Integer)]);
        let orgs = base.define_table_named("orgs", vec![ColumnDef::new("id", ColumnType::Integer)]);
        register("member_view", base.metadata(), Selectable::from_table(&members));
        register("org_view", base.metadata(), Selectable::from_table(&orgs));

        // members references orgs, member_view reads org_view
        let engine = MockEngine::new("postgresql://myuser@myserver/mydatabase")
            .with_dependency("members", "orgs")
            .with_dependency("member_view", "org_view");
        let mut conn = engine.connect().unwrap();
        create_all(conn.as_mut(), base.metadata()).unwrap();
        drop_all(conn.as_mut(), base.metadata()).unwrap();

        assert_eq!(engine.log.count("execute: DROP VIEW IF EXISTS \"org_view\" CASCADE"), 1);
        assert_eq!(engine.log.count("execute: DROP VIEW IF EXISTS \"member_view\" CASCADE"), 1);
        assert_eq!(engine.log.count("execute: DROP TABLE IF EXISTS \"orgs\" CASCADE"), 1);
        assert_eq!(engine.log.count("execute: DROP TABLE IF EXISTS \"members\" CASCADE"), 1);
        assert!(conn.table_names().unwrap().is_empty());
        assert!(conn.view_names().unwrap().is_empty());
    }

    #[test]
    fn test_drop_without_cascade_fails_on_dependents() {
        let engine = MockEngine::new("postgresql://myuser@myserver/mydatabase")
            .with_existing_table("orgs")
            .with_existing_table("members")
            .with_dependency("members", "orgs");
        let mut conn = engine.connect().unwrap();
        assert!(conn.execute("DROP TABLE IF EXISTS \"orgs\"").is_err());
        assert_eq!(conn.table_names().unwrap(), vec!["orgs", "members"]);
    }

    #[test]
    fn test_drop_reflected_with_dependent_views() {
        // The catalog drops in name order, so "a_view" and "c_table" still
        // have dependents when their turn comes
        let mut catalog = ReflectedCatalog::new();
        for (name, kind) in [
            ("a_view", RelationKind::View),
            ("b_view", RelationKind::View),
            ("c_table", RelationKind::Table),
            ("d_table", RelationKind::Table),
        ] {
            catalog.insert(crate::models::ReflectedTable { name: name.into(), kind, columns: vec![] });
        }

        let engine = MockEngine::new("postgresql://myuser@myserver/mydatabase")
            .with_existing_table("c_table")
            .with_existing_table("d_table")
            .with_existing_view("a_view")
            .with_existing_view("b_view")
            .with_dependency("b_view", "a_view")
            .with_dependency("d_table", "c_table");
        let mut conn = engine.connect().unwrap();
        drop_reflected(conn.as_mut(), &catalog).unwrap();
        assert!(conn.table_names().unwrap().is_empty());
        assert!(conn.view_names().unwrap().is_empty());

        let sqlite = MockEngine::new("sqlite:///x.db").with_existing_view("a_view");
        let mut conn = sqlite.connect().unwrap();
        drop_reflected(conn.as_mut(), &catalog).unwrap();
        assert_eq!(sqlite.log.count("execute: DROP VIEW \"a_view\""), 1);
        assert_eq!(sqlite.log.count("execute: DROP TABLE IF EXISTS \"c_table\""), 1);
        assert_eq!(sqlite.log.count("execute: DROP TABLE IF EXISTS \"c_table\" CASCADE"), 0);
    }
}
