//! System catalog for RookDB
//!
//! Per-database registry of tables, indexes, views and triggers. The catalog
//! is cached in memory and persisted to `catalog.json` in the database
//! directory; the engine saves it on every committed DDL statement, which
//! also serves as the cache invalidation point.

use super::schema::{
    IndexDef, Schema, TableDef, TableStatistics, TriggerDef, TriggerEvent, TriggerTiming, ViewDef,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// System catalog - all metadata of one database
#[derive(Debug)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<TableDef>>>,
    indexes: RwLock<HashMap<String, Arc<IndexDef>>>,
    views: RwLock<HashMap<String, Arc<ViewDef>>>,
    triggers: RwLock<HashMap<String, Arc<TriggerDef>>>,
    /// One id namespace for every paged file of the database.
    next_file_id: RwLock<u32>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            views: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
            next_file_id: RwLock::new(1),
        }
    }

    fn allocate_file_id(&self) -> u32 {
        let mut next = self.next_file_id.write().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    fn name_in_use(&self, name: &str) -> Option<Error> {
        if self.tables.read().unwrap().contains_key(name) {
            return Some(Error::TableAlreadyExists(name.to_string()));
        }
        if self.views.read().unwrap().contains_key(name) {
            return Some(Error::ViewAlreadyExists(name.to_string()));
        }
        None
    }

    // ---- tables ----

    pub fn create_table(&self, mut def: TableDef) -> Result<Arc<TableDef>> {
        if let Some(err) = self.name_in_use(&def.name) {
            return Err(err);
        }
        def.id = self.allocate_file_id();
        let def = Arc::new(def);
        self.tables
            .write()
            .unwrap()
            .insert(def.name.clone(), def.clone());
        Ok(def)
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<TableDef>> {
        self.tables
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.tables.read().unwrap().contains_key(name)
    }

    /// Drop a table along with its indexes and triggers.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        if self.tables.write().unwrap().remove(name).is_none() {
            return Err(Error::TableNotFound(name.to_string()));
        }
        self.indexes
            .write()
            .unwrap()
            .retain(|_, idx| idx.table_name != name);
        self.triggers
            .write()
            .unwrap()
            .retain(|_, t| t.table_name != name);
        Ok(())
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn update_table_stats(&self, name: &str, stats: TableStatistics) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let table = tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        let mut updated = (**table).clone();
        updated.stats = Some(stats);
        tables.insert(name.to_string(), Arc::new(updated));
        Ok(())
    }

    /// Tables whose foreign keys reference `name` (for RESTRICT checks).
    pub fn referencing_tables(&self, name: &str) -> Vec<Arc<TableDef>> {
        self.tables
            .read()
            .unwrap()
            .values()
            .filter(|t| t.foreign_keys.iter().any(|fk| fk.ref_table == name))
            .cloned()
            .collect()
    }

    // ---- indexes ----

    pub fn create_index(
        &self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
        unique: bool,
        primary: bool,
    ) -> Result<Arc<IndexDef>> {
        let table = self.get_table(table_name)?;
        for col_name in &columns {
            if table.get_column(col_name).is_none() {
                return Err(Error::ColumnNotFound(
                    col_name.clone(),
                    table_name.to_string(),
                ));
            }
        }

        let mut indexes = self.indexes.write().unwrap();
        if indexes.contains_key(name) {
            return Err(Error::IndexAlreadyExists(name.to_string()));
        }
        let def = Arc::new(
            IndexDef::new(name, table_name, columns, self.allocate_file_id())
                .unique(unique)
                .primary(primary),
        );
        indexes.insert(name.to_string(), def.clone());
        Ok(def)
    }

    pub fn get_index(&self, name: &str) -> Result<Arc<IndexDef>> {
        self.indexes
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))
    }

    pub fn drop_index(&self, name: &str) -> Result<Arc<IndexDef>> {
        let mut indexes = self.indexes.write().unwrap();
        let def = indexes
            .remove(name)
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        if def.primary {
            indexes.insert(name.to_string(), def);
            return Err(Error::ExecutionError(
                "cannot drop a primary key index".to_string(),
            ));
        }
        Ok(def)
    }

    /// Remove an index entry without the primary-key guard. Only for rolling
    /// back a failed CREATE TABLE / CREATE INDEX.
    pub(crate) fn remove_index_unchecked(&self, name: &str) {
        self.indexes.write().unwrap().remove(name);
    }

    pub fn get_table_indexes(&self, table_name: &str) -> Vec<Arc<IndexDef>> {
        let mut defs: Vec<Arc<IndexDef>> = self
            .indexes
            .read()
            .unwrap()
            .values()
            .filter(|idx| idx.table_name == table_name)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    // ---- views ----

    pub fn create_view(&self, name: &str, query: &str, or_replace: bool) -> Result<Arc<ViewDef>> {
        if self.tables.read().unwrap().contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        let mut views = self.views.write().unwrap();
        if views.contains_key(name) && !or_replace {
            return Err(Error::ViewAlreadyExists(name.to_string()));
        }
        let def = Arc::new(ViewDef {
            name: name.to_string(),
            query: query.to_string(),
        });
        views.insert(name.to_string(), def.clone());
        Ok(def)
    }

    pub fn get_view(&self, name: &str) -> Option<Arc<ViewDef>> {
        self.views.read().unwrap().get(name).cloned()
    }

    pub fn drop_view(&self, name: &str) -> Result<()> {
        if self.views.write().unwrap().remove(name).is_none() {
            return Err(Error::ViewNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn list_views(&self) -> Vec<Arc<ViewDef>> {
        let mut defs: Vec<Arc<ViewDef>> = self.views.read().unwrap().values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    // ---- triggers ----

    pub fn create_trigger(&self, def: TriggerDef) -> Result<Arc<TriggerDef>> {
        if !self.table_exists(&def.table_name) {
            return Err(Error::TableNotFound(def.table_name.clone()));
        }
        let mut triggers = self.triggers.write().unwrap();
        if triggers.contains_key(&def.name) {
            return Err(Error::TriggerAlreadyExists(def.name.clone()));
        }
        let def = Arc::new(def);
        triggers.insert(def.name.clone(), def.clone());
        Ok(def)
    }

    pub fn drop_trigger(&self, name: &str) -> Result<()> {
        if self.triggers.write().unwrap().remove(name).is_none() {
            return Err(Error::TriggerNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Triggers of one table for a given hook point, in name order.
    pub fn matching_triggers(
        &self,
        table_name: &str,
        timing: TriggerTiming,
        event: TriggerEvent,
    ) -> Vec<Arc<TriggerDef>> {
        let mut defs: Vec<Arc<TriggerDef>> = self
            .triggers
            .read()
            .unwrap()
            .values()
            .filter(|t| t.table_name == table_name && t.timing == timing && t.event == event)
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn list_triggers(&self) -> Vec<Arc<TriggerDef>> {
        let mut defs: Vec<Arc<TriggerDef>> =
            self.triggers.read().unwrap().values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    // ---- persistence ----

    pub fn catalog_path(dir: &Path) -> PathBuf {
        dir.join("catalog.json")
    }

    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        let data = CatalogData {
            tables: self
                .tables
                .read()
                .unwrap()
                .values()
                .map(|t| (**t).clone())
                .collect(),
            indexes: self
                .indexes
                .read()
                .unwrap()
                .values()
                .map(|i| (**i).clone())
                .collect(),
            views: self
                .views
                .read()
                .unwrap()
                .values()
                .map(|v| (**v).clone())
                .collect(),
            triggers: self
                .triggers
                .read()
                .unwrap()
                .values()
                .map(|t| (**t).clone())
                .collect(),
            next_file_id: *self.next_file_id.read().unwrap(),
        };
        let json =
            serde_json::to_string_pretty(&data).map_err(|e| Error::Internal(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_from_disk(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let data: CatalogData =
            serde_json::from_str(&json).map_err(|e| Error::Corrupted(e.to_string()))?;

        let catalog = Self::new();
        {
            let mut tables = catalog.tables.write().unwrap();
            for table in data.tables {
                tables.insert(table.name.clone(), Arc::new(table));
            }
            let mut indexes = catalog.indexes.write().unwrap();
            for index in data.indexes {
                indexes.insert(index.name.clone(), Arc::new(index));
            }
            let mut views = catalog.views.write().unwrap();
            for view in data.views {
                views.insert(view.name.clone(), Arc::new(view));
            }
            let mut triggers = catalog.triggers.write().unwrap();
            for trigger in data.triggers {
                triggers.insert(trigger.name.clone(), Arc::new(trigger));
            }
            *catalog.next_file_id.write().unwrap() = data.next_file_id;
        }
        Ok(catalog)
    }

    /// Load the catalog of a database directory, or start empty.
    pub fn open_dir(dir: &Path) -> Result<Self> {
        let path = Self::catalog_path(dir);
        if path.exists() {
            Self::load_from_disk(&path)
        } else {
            Ok(Self::new())
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable proxy for Catalog
#[derive(serde::Serialize, serde::Deserialize)]
struct CatalogData {
    tables: Vec<TableDef>,
    indexes: Vec<IndexDef>,
    views: Vec<ViewDef>,
    triggers: Vec<TriggerDef>,
    next_file_id: u32,
}

/// Convenience constructor used by tests and the engine's DDL path.
pub fn table_def(name: &str, schema: Schema) -> TableDef {
    TableDef::new(name, schema, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::schema::{TriggerAction, TriggerDef, TriggerEvent, TriggerTiming};
    use crate::catalog::types::DataType;
    use crate::catalog::Column;

    fn students_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add_column(Column::new("student_id", DataType::Int, 0).primary_key(true));
        schema.add_column(Column::new("name", DataType::Varchar(100), 1).nullable(false));
        schema
    }

    #[test]
    fn test_create_and_get_table() {
        let catalog = Catalog::new();
        let table = catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        assert_eq!(table.name(), "students");
        assert!(table.id > 0);

        let retrieved = catalog.get_table("students").unwrap();
        assert_eq!(retrieved.schema().column_count(), 2);
    }

    #[test]
    fn test_table_already_exists() {
        let catalog = Catalog::new();
        catalog
            .create_table(table_def("t", Schema::new()))
            .unwrap();
        let result = catalog.create_table(table_def("t", Schema::new()));
        assert!(matches!(result, Err(Error::TableAlreadyExists(_))));
    }

    #[test]
    fn test_drop_table_cascades_indexes_and_triggers() {
        let catalog = Catalog::new();
        catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        catalog
            .create_index("idx_name", "students", vec!["name".to_string()], false, false)
            .unwrap();
        catalog
            .create_trigger(TriggerDef {
                name: "tg".to_string(),
                table_name: "students".to_string(),
                timing: TriggerTiming::Before,
                event: TriggerEvent::Insert,
                condition: None,
                action: TriggerAction::Signal {
                    sqlstate: "45000".to_string(),
                    message: "no".to_string(),
                },
            })
            .unwrap();

        catalog.drop_table("students").unwrap();
        assert!(catalog.list_indexes().is_empty());
        assert!(catalog.list_triggers().is_empty());
    }

    #[test]
    fn test_index_file_ids_disjoint_from_tables() {
        let catalog = Catalog::new();
        let t = catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        let i = catalog
            .create_index("idx_name", "students", vec!["name".to_string()], true, false)
            .unwrap();
        assert_ne!(t.id, i.id);
    }

    #[test]
    fn test_view_name_collides_with_table() {
        let catalog = Catalog::new();
        catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        assert!(catalog
            .create_view("students", "SELECT 1", false)
            .is_err());

        catalog
            .create_view("v", "SELECT name FROM students", false)
            .unwrap();
        assert!(catalog.create_view("v", "SELECT 1", false).is_err());
        // OR REPLACE overwrites.
        catalog.create_view("v", "SELECT 2", true).unwrap();
        assert_eq!(catalog.get_view("v").unwrap().query, "SELECT 2");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = Catalog::catalog_path(dir.path());

        let catalog = Catalog::new();
        catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        catalog
            .create_index(
                "pk_students",
                "students",
                vec!["student_id".to_string()],
                true,
                true,
            )
            .unwrap();
        catalog
            .create_view("names", "SELECT name FROM students", false)
            .unwrap();
        catalog.save_to_disk(&path).unwrap();

        let loaded = Catalog::load_from_disk(&path).unwrap();
        assert!(loaded.table_exists("students"));
        assert!(loaded.get_index("pk_students").unwrap().primary);
        assert!(loaded.get_view("names").is_some());
        // File id allocation continues where it left off.
        let t2 = loaded
            .create_table(table_def("other", Schema::new()))
            .unwrap();
        assert!(t2.id >= 3);
    }

    #[test]
    fn test_cannot_drop_primary_index() {
        let catalog = Catalog::new();
        catalog
            .create_table(table_def("students", students_schema()))
            .unwrap();
        catalog
            .create_index(
                "pk_students",
                "students",
                vec!["student_id".to_string()],
                true,
                true,
            )
            .unwrap();
        assert!(catalog.drop_index("pk_students").is_err());
        assert!(catalog.get_index("pk_students").is_ok());
    }
}
