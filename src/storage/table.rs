//! Table storage for RookDB
//!
//! The schema-aware layer over a heap file: type coercion, NOT NULL
//! enforcement, and index maintenance kept atomic with every heap change.
//! CHECK expressions, DEFAULT substitution and foreign keys are evaluated
//! one level up, in the execution engine, which owns the expression
//! evaluator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::btree::BTreeIndex;
use super::buffer_pool::BufferPoolManager;
use super::heap::{HeapFile, HeapScan, Rid};
use super::page::{Lsn, PageId};
use super::tuple::{Tuple, Value};
use crate::catalog::{IndexDef, Schema, TableDef};
use crate::error::{Error, Result};
use crate::storage::IndexKey;

/// One index attached to a table: its metadata, the positions of the key
/// columns in the table schema, and the tree itself.
#[derive(Debug, Clone)]
pub struct TableIndex {
    pub def: Arc<IndexDef>,
    pub key_positions: Vec<usize>,
    pub tree: BTreeIndex,
}

impl TableIndex {
    /// Extract this index's key from a full tuple.
    pub fn key_of(&self, tuple: &Tuple) -> IndexKey {
        IndexKey::composite(
            self.key_positions
                .iter()
                .map(|&i| tuple.get(i).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    fn key_has_null(key: &IndexKey) -> bool {
        key.0.iter().any(|v| v.is_null())
    }
}

/// A table: definition, heap storage, and attached indexes.
#[derive(Debug)]
pub struct Table {
    def: Arc<TableDef>,
    heap: HeapFile,
    indexes: HashMap<String, TableIndex>,
}

impl Table {
    /// Open (or create) the table's heap file. The file is registered with
    /// the disk manager under the table's file id.
    pub fn open(def: Arc<TableDef>, pool: Arc<Mutex<BufferPoolManager>>) -> Self {
        {
            let guard = pool.lock().unwrap();
            guard
                .disk_manager()
                .register_file(def.id, format!("table_{}.tbl", def.id));
        }
        let heap = HeapFile::new(def.id, pool);
        Self {
            def,
            heap,
            indexes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.def.name()
    }

    pub fn schema(&self) -> &Schema {
        self.def.schema()
    }

    pub fn definition(&self) -> &Arc<TableDef> {
        &self.def
    }

    pub fn heap(&self) -> &HeapFile {
        &self.heap
    }

    /// Attach an opened index and return it. Key positions are resolved
    /// against the table schema.
    pub fn attach_index(&mut self, def: Arc<IndexDef>, tree: BTreeIndex) -> Result<&TableIndex> {
        let mut key_positions = Vec::with_capacity(def.columns.len());
        for col in &def.columns {
            let pos = self
                .def
                .schema()
                .get_column_index(col)
                .ok_or_else(|| Error::ColumnNotFound(col.clone(), self.name().to_string()))?;
            key_positions.push(pos);
        }
        let name = def.name.clone();
        self.indexes.insert(
            name.clone(),
            TableIndex {
                def,
                key_positions,
                tree,
            },
        );
        Ok(&self.indexes[&name])
    }

    pub fn detach_index(&mut self, name: &str) -> Option<TableIndex> {
        self.indexes.remove(name)
    }

    pub fn index(&self, name: &str) -> Option<&TableIndex> {
        self.indexes.get(name)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &TableIndex> {
        self.indexes.values()
    }

    /// Backfill an index from the current table contents (CREATE INDEX on a
    /// populated table).
    pub fn build_index(&self, index: &TableIndex) -> Result<()> {
        for row in self.heap.scan() {
            let (rid, tuple) = row?;
            let key = index.key_of(&tuple);
            if index.def.unique && TableIndex::key_has_null(&key) {
                continue;
            }
            index.tree.insert(key, rid).map_err(|e| match e {
                Error::UniqueViolation(_) if index.def.primary => {
                    Error::PrimaryKeyViolation(self.name().to_string())
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Coerce a tuple to the schema and enforce arity and NOT NULL.
    pub fn validate(&self, tuple: Tuple) -> Result<Tuple> {
        let schema = self.def.schema();
        if tuple.len() != schema.column_count() {
            return Err(Error::ExecutionError(format!(
                "table '{}' expects {} columns, got {}",
                self.name(),
                schema.column_count(),
                tuple.len()
            )));
        }
        let mut values = Vec::with_capacity(tuple.len());
        for (value, col) in tuple.into_values().into_iter().zip(schema.columns()) {
            let value = value.coerce_to(&col.data_type, &col.name)?;
            if value.is_null() && !col.nullable {
                return Err(Error::NullNotAllowed(col.name.clone()));
            }
            values.push(value);
        }
        Ok(Tuple::new(values))
    }

    /// Probe unique indexes for a conflicting key. `exclude` skips the row
    /// being updated.
    fn check_unique(&self, tuple: &Tuple, exclude: Option<Rid>) -> Result<()> {
        for index in self.indexes.values() {
            if !index.def.unique {
                continue;
            }
            let key = index.key_of(tuple);
            if TableIndex::key_has_null(&key) {
                continue;
            }
            if let Some(found) = index.tree.search(&key)? {
                if Some(found) != exclude {
                    return Err(if index.def.primary {
                        Error::PrimaryKeyViolation(self.name().to_string())
                    } else {
                        Error::UniqueViolation(index.def.name.clone())
                    });
                }
            }
        }
        Ok(())
    }

    /// Insert a tuple; maintains every index atomically with the heap
    /// change. Returns the RID and the coerced tuple.
    pub fn insert(&self, tuple: Tuple) -> Result<(Rid, Tuple)> {
        let tuple = self.validate(tuple)?;
        self.check_unique(&tuple, None)?;

        let rid = self.heap.insert(&tuple)?;
        let mut inserted: Vec<(&TableIndex, IndexKey)> = Vec::new();
        for index in self.indexes.values() {
            let key = index.key_of(&tuple);
            if index.def.unique && TableIndex::key_has_null(&key) {
                continue;
            }
            if let Err(e) = index.tree.insert(key.clone(), rid) {
                // Undo the partial work before surfacing the error.
                for (ix, k) in inserted {
                    ix.tree.delete(&k, rid).ok();
                }
                self.heap.delete(rid).ok();
                return Err(e);
            }
            inserted.push((index, key));
        }
        Ok((rid, tuple))
    }

    /// Update a row in place; index entries follow key changes.
    /// Returns the before and after images.
    pub fn update(&self, rid: Rid, tuple: Tuple) -> Result<(Tuple, Tuple)> {
        let tuple = self.validate(tuple)?;
        let old = self
            .heap
            .get(rid)?
            .ok_or_else(|| Error::ExecutionError("row vanished during update".to_string()))?;
        self.check_unique(&tuple, Some(rid))?;

        self.heap.update(rid, &tuple)?;
        for index in self.indexes.values() {
            let old_key = index.key_of(&old);
            let new_key = index.key_of(&tuple);
            if old_key == new_key {
                continue;
            }
            let skip_old = index.def.unique && TableIndex::key_has_null(&old_key);
            let skip_new = index.def.unique && TableIndex::key_has_null(&new_key);
            if !skip_old {
                index.tree.delete(&old_key, rid)?;
            }
            if !skip_new {
                index.tree.insert(new_key, rid)?;
            }
        }
        Ok((old, tuple))
    }

    /// Delete a row and its index entries. Returns the before image.
    pub fn delete(&self, rid: Rid) -> Result<Tuple> {
        let old = self
            .heap
            .get(rid)?
            .ok_or_else(|| Error::ExecutionError("row vanished during delete".to_string()))?;
        self.heap.delete(rid)?;
        for index in self.indexes.values() {
            let key = index.key_of(&old);
            if index.def.unique && TableIndex::key_has_null(&key) {
                continue;
            }
            index.tree.delete(&key, rid)?;
        }
        Ok(old)
    }

    /// Rollback helper: put a deleted row back at its original RID.
    pub fn restore(&self, rid: Rid, tuple: &Tuple) -> Result<()> {
        self.heap.restore_at(rid, tuple)?;
        for index in self.indexes.values() {
            let key = index.key_of(tuple);
            if index.def.unique && TableIndex::key_has_null(&key) {
                continue;
            }
            index.tree.insert(key, rid)?;
        }
        Ok(())
    }

    pub fn get(&self, rid: Rid) -> Result<Option<Tuple>> {
        self.heap.get(rid)
    }

    pub fn scan(&self) -> HeapScan {
        self.heap.scan()
    }

    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        self.heap.page_lsn(page_id)
    }

    pub fn set_page_lsn(&self, page_id: PageId, lsn: Lsn) -> Result<()> {
        self.heap.set_page_lsn(page_id, lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType, IndexDef};
    use crate::storage::btree;
    use crate::storage::disk::DiskManager;

    fn test_table(with_pk_index: bool) -> (tempfile::TempDir, Table) {
        let mut schema = Schema::new();
        schema.add_column(Column::new("id", DataType::Int, 0).primary_key(true));
        schema.add_column(Column::new("name", DataType::Varchar(100), 1).nullable(false));
        schema.add_column(Column::new("age", DataType::Int, 2));

        let def = Arc::new(TableDef::new("users", schema, 1));
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().to_path_buf()));
        let pool = Arc::new(Mutex::new(BufferPoolManager::new(32, disk)));
        let mut table = Table::open(def, pool.clone());

        if with_pk_index {
            let idx_def = Arc::new(
                IndexDef::new("pk_users", "users", vec!["id".to_string()], 2)
                    .unique(true)
                    .primary(true),
            );
            pool.lock()
                .unwrap()
                .disk_manager()
                .register_file(2, "index_2.idx");
            let order = btree::order_for(&[DataType::Int]);
            let tree = BTreeIndex::create("pk_users", 2, true, order, pool).unwrap();
            table.attach_index(idx_def, tree).unwrap();
        }
        (dir, table)
    }

    fn row(id: i32, name: &str, age: i32) -> Tuple {
        Tuple::new(vec![
            Value::Int(id),
            Value::Str(name.to_string()),
            Value::Int(age),
        ])
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, table) = test_table(true);
        let (rid, tuple) = table.insert(row(1, "Alice", 25)).unwrap();
        assert_eq!(table.get(rid).unwrap(), Some(tuple));
    }

    #[test]
    fn test_not_null_constraint() {
        let (_dir, table) = test_table(false);
        let bad = Tuple::new(vec![Value::Int(1), Value::Null, Value::Int(25)]);
        assert!(matches!(
            table.insert(bad),
            Err(Error::NullNotAllowed(_))
        ));
    }

    #[test]
    fn test_wrong_column_count() {
        let (_dir, table) = test_table(false);
        let bad = Tuple::new(vec![Value::Int(1)]);
        assert!(table.insert(bad).is_err());
    }

    #[test]
    fn test_coercion_on_insert() {
        let (_dir, table) = test_table(false);
        // BigInt literal narrows into the INT column.
        let tuple = Tuple::new(vec![
            Value::BigInt(7),
            Value::Str("Ada".to_string()),
            Value::Null,
        ]);
        let (rid, _) = table.insert(tuple).unwrap();
        let stored = table.get(rid).unwrap().unwrap();
        assert_eq!(stored.get(0), Some(&Value::Int(7)));
    }

    #[test]
    fn test_primary_key_violation_leaves_table_unchanged() {
        let (_dir, table) = test_table(true);
        table.insert(row(1, "Alice", 25)).unwrap();
        let err = table.insert(row(1, "Duplicate", 30));
        assert!(matches!(err, Err(Error::PrimaryKeyViolation(_))));
        let rows: Vec<_> = table.scan().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.get(1), Some(&Value::Str("Alice".to_string())));
    }

    #[test]
    fn test_index_follows_update_and_delete() {
        let (_dir, table) = test_table(true);
        let (rid, _) = table.insert(row(1, "Alice", 25)).unwrap();
        table.insert(row(2, "Bob", 31)).unwrap();

        let index = table.index("pk_users").unwrap();
        assert_eq!(
            index.tree.search(&IndexKey::new(Value::Int(1))).unwrap(),
            Some(rid)
        );

        // Key change moves the index entry.
        table.update(rid, row(9, "Alice", 26)).unwrap();
        let index = table.index("pk_users").unwrap();
        assert_eq!(index.tree.search(&IndexKey::new(Value::Int(1))).unwrap(), None);
        assert_eq!(
            index.tree.search(&IndexKey::new(Value::Int(9))).unwrap(),
            Some(rid)
        );

        table.delete(rid).unwrap();
        let index = table.index("pk_users").unwrap();
        assert_eq!(index.tree.search(&IndexKey::new(Value::Int(9))).unwrap(), None);
    }

    #[test]
    fn test_restore_reinstates_index_entries() {
        let (_dir, table) = test_table(true);
        let (rid, tuple) = table.insert(row(5, "Eve", 40)).unwrap();
        table.delete(rid).unwrap();
        table.restore(rid, &tuple).unwrap();

        assert_eq!(table.get(rid).unwrap(), Some(tuple));
        let index = table.index("pk_users").unwrap();
        assert_eq!(
            index.tree.search(&IndexKey::new(Value::Int(5))).unwrap(),
            Some(rid)
        );
    }

    #[test]
    fn test_build_index_backfills() {
        let (_dir, mut table) = test_table(false);
        for i in 0..20 {
            table.insert(row(i, "user", 20 + i)).unwrap();
        }
        // Attach a non-unique index on age and backfill it.
        let idx_def = Arc::new(IndexDef::new(
            "idx_age",
            "users",
            vec!["age".to_string()],
            3,
        ));
        let shared = table.heap.pool_handle();
        shared
            .lock()
            .unwrap()
            .disk_manager()
            .register_file(3, "index_3.idx");
        let tree = BTreeIndex::create("idx_age", 3, false, 8, shared).unwrap();
        table.attach_index(idx_def, tree).unwrap();
        let index = table.index("idx_age").unwrap().clone();
        table.build_index(&index).unwrap();

        assert_eq!(
            index
                .tree
                .search(&IndexKey::new(Value::Int(25)))
                .unwrap()
                .is_some(),
            true
        );
    }
}
