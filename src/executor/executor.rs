//! Execution engine
//!
//! Owns one database context (catalog, buffer pool, WAL, transaction
//! manager, loaded tables) and executes statements against it. DML runs
//! under an implicit transaction unless an explicit one is open; a failed
//! statement undoes its own effects, and a failure inside an explicit
//! transaction poisons it until ROLLBACK. Triggers fire at the row hook
//! points, views expand during planning, and cursors are suspended operator
//! trees driven by FETCH.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{
    Catalog, Column, ForeignKeyDef, Schema, TableDef, TableStatistics, TriggerAction, TriggerDef,
    TriggerEvent, TriggerTiming,
};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::executor::eval;
use crate::executor::operators::{self, Operator, SourceProvider};
use crate::executor::optimizer::{explain, Optimizer, PhysicalPlan};
use crate::executor::planner::Planner;
use crate::sql::ast::*;
use crate::sql::Parser;
use crate::storage::wal::LogRecordKind;
use crate::storage::{
    btree, BTreeIndex, BufferPoolManager, DiskManager, HeapFile, LogManager, Rid, Table, Tuple,
    Value,
};
use crate::transaction::{recovery, TransactionManager};

/// Maximum nesting for triggers firing triggers and views of views.
const MAX_NESTING: usize = 8;

/// Query result
#[derive(Debug, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Tuple>,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: usize,
    pub message: Option<String>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    pub fn with_affected_rows(count: usize, message: impl Into<String>) -> Self {
        Self {
            affected_rows: count,
            message: Some(message.into()),
            ..Self::empty()
        }
    }
}

/// One open database: catalog, storage stack, and loaded tables.
pub struct Database {
    name: String,
    dir: PathBuf,
    catalog: Arc<Catalog>,
    tables: HashMap<String, Table>,
    pool: Arc<Mutex<BufferPoolManager>>,
    wal: Arc<LogManager>,
    txns: Arc<TransactionManager>,
}

impl Database {
    /// Open (or create) a database directory, run crash recovery, and load
    /// every table.
    pub fn open(data_root: &Path, name: &str, config: &StorageConfig) -> Result<Self> {
        let dir = data_root.join(name);
        std::fs::create_dir_all(&dir)?;

        let catalog = Arc::new(Catalog::open_dir(&dir)?);
        let disk = Arc::new(DiskManager::new(dir.clone()));
        let wal = Arc::new(LogManager::open(dir.join("wal.log"), config.fsync_enabled)?);
        let mut pool = BufferPoolManager::new(config.buffer_pool_pages, disk);
        pool.attach_wal(wal.clone());
        let pool = Arc::new(Mutex::new(pool));
        let txns = Arc::new(TransactionManager::new(wal.clone()));

        let mut db = Self {
            name: name.to_string(),
            dir,
            catalog,
            tables: HashMap::new(),
            pool,
            wal,
            txns,
        };
        for table_name in db.catalog.list_tables() {
            db.load_table(&table_name)?;
        }
        db.recover()?;
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Total buffer pins; zero between statements.
    pub fn pins(&self) -> u32 {
        self.pool.lock().unwrap().total_pins()
    }

    fn load_table(&mut self, name: &str) -> Result<()> {
        let def = self.catalog.get_table(name)?;
        let mut table = Table::open(def.clone(), self.pool.clone());
        for index_def in self.catalog.get_table_indexes(name) {
            let tree = self.open_index_tree(&index_def)?;
            table.attach_index(index_def, tree)?;
        }
        self.tables.insert(name.to_string(), table);
        Ok(())
    }

    fn open_index_tree(&self, index_def: &crate::catalog::IndexDef) -> Result<BTreeIndex> {
        let table_def = self.catalog.get_table(&index_def.table_name)?;
        let key_types: Vec<_> = index_def
            .columns
            .iter()
            .map(|c| {
                table_def
                    .get_column(c)
                    .map(|col| col.data_type.clone())
                    .ok_or_else(|| {
                        Error::ColumnNotFound(c.clone(), index_def.table_name.clone())
                    })
            })
            .collect::<Result<_>>()?;
        let order = btree::order_for(&key_types);
        {
            let pool = self.pool.lock().unwrap();
            pool.disk_manager()
                .register_file(index_def.id, format!("index_{}.idx", index_def.id));
        }
        BTreeIndex::open(
            index_def.name.clone(),
            index_def.id,
            index_def.unique,
            order,
            self.pool.clone(),
        )
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Three-pass crash recovery from the write-ahead log.
    fn recover(&mut self) -> Result<()> {
        let records = self.wal.read_all()?;
        if records.is_empty() {
            return Ok(());
        }
        let analysis = recovery::analyze(&records);
        self.txns.bump_txn_id(analysis.max_txn_id);

        let redone = recovery::redo(&records, &analysis, &self.tables)?;
        let undone = recovery::undo(&records, &analysis, &self.tables)?;

        // Close out the transactions that were in flight at the crash.
        for txn in &analysis.active {
            self.wal
                .append(*txn, LogRecordKind::Abort, None, None, None, None, None)?;
        }
        self.wal.flush()?;
        if redone > 0 || undone > 0 || !analysis.active.is_empty() {
            info!(
                database = %self.name,
                redone,
                undone,
                aborted = analysis.active.len(),
                "recovery finished"
            );
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Flush all dirty pages (WAL first) and write a checkpoint record.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.wal.flush()?;
        self.pool.lock().unwrap().flush_all()?;
        self.wal
            .append(0, LogRecordKind::Checkpoint, None, None, None, None, Some(Vec::new()))?;
        self.wal.flush()?;
        debug!(database = %self.name, "checkpoint written");
        Ok(())
    }

    /// Checkpoint carrying the in-flight transaction list.
    fn checkpoint_with_active(&mut self, active: Vec<u64>) -> Result<()> {
        self.wal.flush()?;
        self.pool.lock().unwrap().flush_all()?;
        self.wal
            .append(0, LogRecordKind::Checkpoint, None, None, None, None, Some(active))?;
        self.wal.flush()?;
        Ok(())
    }

    fn save_catalog(&self) -> Result<()> {
        self.catalog
            .save_to_disk(&Catalog::catalog_path(&self.dir))
    }
}

impl SourceProvider for Database {
    fn heap(&self, table: &str) -> Result<HeapFile> {
        Ok(self.table(table)?.heap().clone())
    }

    fn index_tree(&self, index_name: &str) -> Result<BTreeIndex> {
        let def = self.catalog.get_index(index_name)?;
        let table = self.table(&def.table_name)?;
        table
            .index(index_name)
            .map(|i| i.tree.clone())
            .ok_or_else(|| Error::IndexNotFound(index_name.to_string()))
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let def = self.catalog.get_table(table)?;
        Ok(def
            .schema()
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }
}

/// A suspended query: DECLARE stores the plan, OPEN builds and opens the
/// operator tree, FETCH pulls rows, CLOSE releases it (and its page pins).
struct Cursor {
    plan: PhysicalPlan,
    columns: Vec<String>,
    op: Option<Box<dyn Operator>>,
}

#[derive(Default)]
struct Session {
    txn: Option<u64>,
    txn_failed: bool,
    commits_since_checkpoint: u32,
}

/// The engine: one session over one current database.
pub struct RookEngine {
    config: StorageConfig,
    db: Database,
    session: Session,
    cursors: HashMap<String, Cursor>,
}

impl RookEngine {
    /// Open the engine on its default database.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let db = Database::open(&config.data_dir, "main", &config)?;
        Ok(Self {
            config,
            db,
            session: Session::default(),
            cursors: HashMap::new(),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Flush everything and checkpoint. Call before dropping the engine;
    /// skipping it simulates a crash.
    pub fn close(&mut self) -> Result<()> {
        if let Some(txn) = self.session.txn.take() {
            warn!(txn, "open transaction rolled back at shutdown");
            let undo = self.db.txns.take_undo(txn);
            self.apply_undo_chain(&undo);
            self.db.txns.finish_abort(txn)?;
        }
        self.close_all_cursors();
        self.db.checkpoint()
    }

    /// Parse and execute; returns the result of the last statement.
    pub fn execute_sql(&mut self, sql: &str) -> Result<QueryResult> {
        let statements = Parser::new(sql)?.parse_all()?;
        if statements.is_empty() {
            return Ok(QueryResult::empty());
        }
        let mut last = QueryResult::empty();
        for stmt in statements {
            last = self.execute(stmt)?;
        }
        Ok(last)
    }

    /// Execute one statement.
    pub fn execute(&mut self, stmt: Statement) -> Result<QueryResult> {
        // A poisoned explicit transaction accepts only ROLLBACK.
        if self.session.txn_failed && !matches!(stmt, Statement::Rollback) {
            return Err(Error::TxnAborted);
        }

        let result = match stmt {
            Statement::Select(select) => self.execute_select(&select, 0),
            Statement::Insert(insert) => {
                self.with_statement_txn(|engine, txn| engine.execute_insert(txn, &insert, 0))
            }
            Statement::Update(update) => {
                self.with_statement_txn(|engine, txn| engine.execute_update(txn, &update, 0))
            }
            Statement::Delete(delete) => {
                self.with_statement_txn(|engine, txn| engine.execute_delete(txn, &delete, 0))
            }
            Statement::CreateTable(create) => self.execute_create_table(create),
            Statement::DropTable(drop) => self.execute_drop_table(drop),
            Statement::CreateIndex(create) => self.execute_create_index(create),
            Statement::DropIndex(drop) => self.execute_drop_index(drop),
            Statement::CreateDatabase(name) => self.execute_create_database(&name),
            Statement::UseDatabase(name) => self.execute_use_database(&name),
            Statement::CreateView(view) => self.execute_create_view(view, false),
            Statement::AlterView(view) => self.execute_create_view(view, true),
            Statement::DropView(name) => {
                self.db.catalog.drop_view(&name)?;
                self.db.save_catalog()?;
                Ok(QueryResult::with_message(format!("View '{}' dropped", name)))
            }
            Statement::CreateTrigger(trigger) => self.execute_create_trigger(trigger),
            Statement::DropTrigger(name) => {
                self.db.catalog.drop_trigger(&name)?;
                self.db.save_catalog()?;
                Ok(QueryResult::with_message(format!(
                    "Trigger '{}' dropped",
                    name
                )))
            }
            Statement::BeginTransaction => self.execute_begin(),
            Statement::Commit => self.execute_commit(),
            Statement::Rollback => self.execute_rollback(),
            Statement::Analyze(table) => self.execute_analyze(&table),
            Statement::Show(show) => self.execute_show(&show),
            Statement::Explain(select) => self.execute_explain(&select),
            Statement::DeclareCursor(declare) => self.execute_declare_cursor(declare),
            Statement::OpenCursor(name) => self.execute_open_cursor(&name),
            Statement::FetchCursor { name, count } => self.execute_fetch(&name, count),
            Statement::CloseCursor(name) => self.execute_close_cursor(&name),
        };

        debug_assert_eq!(
            self.db.pins(),
            self.cursor_pins(),
            "page pins leaked by statement"
        );
        result
    }

    /// Pins legitimately held by open cursors (their suspended scans).
    fn cursor_pins(&self) -> u32 {
        // Suspended operators hold no pins between FETCH calls: scans pin
        // only inside next(). Anything nonzero between statements is a leak.
        0
    }

    // ---- transactions ----

    /// Run a DML statement under the session transaction or a fresh implicit
    /// one. On error the statement's effects are undone; an explicit
    /// transaction is additionally poisoned.
    fn with_statement_txn<F>(&mut self, body: F) -> Result<QueryResult>
    where
        F: FnOnce(&mut Self, u64) -> Result<QueryResult>,
    {
        match self.session.txn {
            Some(txn) => {
                let undo_start = self.db.txns.undo_len(txn);
                match body(self, txn) {
                    Ok(result) => Ok(result),
                    Err(e) => {
                        let undo = self.db.txns.take_undo_from(txn, undo_start);
                        self.apply_undo_chain(&undo);
                        self.session.txn_failed = true;
                        Err(e)
                    }
                }
            }
            None => {
                let txn = self.db.txns.begin()?;
                match body(self, txn) {
                    Ok(result) => {
                        self.db.txns.commit(txn)?;
                        self.after_commit()?;
                        Ok(result)
                    }
                    Err(e) => {
                        let undo = self.db.txns.take_undo(txn);
                        self.apply_undo_chain(&undo);
                        if let Err(abort_err) = self.db.txns.finish_abort(txn) {
                            warn!(error = %abort_err, "abort record write failed");
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    fn apply_undo_chain(&mut self, undo: &[crate::storage::LogRecord]) {
        for record in undo.iter().rev() {
            let (table_name, rid) = match (&record.table, record.rid) {
                (Some(t), Some(r)) => (t.clone(), r),
                _ => continue,
            };
            let table = match self.db.tables.get(&table_name) {
                Some(t) => t,
                None => continue,
            };
            if let Err(e) = recovery::apply_undo(table, record, rid) {
                warn!(lsn = record.lsn, error = %e, "undo step failed");
            }
        }
    }

    fn after_commit(&mut self) -> Result<()> {
        self.session.commits_since_checkpoint += 1;
        let interval = self.config.checkpoint_interval_txns;
        if interval > 0 && self.session.commits_since_checkpoint >= interval {
            self.session.commits_since_checkpoint = 0;
            let active: Vec<u64> = self.session.txn.into_iter().collect();
            self.db.checkpoint_with_active(active)?;
        }
        Ok(())
    }

    fn execute_begin(&mut self) -> Result<QueryResult> {
        if self.session.txn.is_some() {
            return Err(Error::TransactionActive);
        }
        let txn = self.db.txns.begin()?;
        self.session.txn = Some(txn);
        self.session.txn_failed = false;
        Ok(QueryResult::with_message(format!(
            "Transaction {} started",
            txn
        )))
    }

    fn execute_commit(&mut self) -> Result<QueryResult> {
        let txn = self.session.txn.take().ok_or(Error::NoActiveTransaction)?;
        self.close_all_cursors();
        self.db.txns.commit(txn)?;
        self.after_commit()?;
        Ok(QueryResult::with_message(format!(
            "Transaction {} committed",
            txn
        )))
    }

    fn execute_rollback(&mut self) -> Result<QueryResult> {
        let txn = self.session.txn.take().ok_or(Error::NoActiveTransaction)?;
        self.close_all_cursors();
        let undo = self.db.txns.take_undo(txn);
        self.apply_undo_chain(&undo);
        self.db.txns.finish_abort(txn)?;
        self.session.txn_failed = false;
        Ok(QueryResult::with_message(format!(
            "Transaction {} rolled back",
            txn
        )))
    }

    // ---- queries ----

    fn execute_select(&mut self, select: &SelectStatement, depth: usize) -> Result<QueryResult> {
        let (columns, rows) = self.run_select(select, depth)?;
        Ok(QueryResult {
            columns: tidy_columns(columns),
            rows,
            affected_rows: 0,
            message: None,
        })
    }

    fn run_select(
        &mut self,
        select: &SelectStatement,
        depth: usize,
    ) -> Result<(Vec<String>, Vec<Tuple>)> {
        let select = self.resolve_subqueries_select(select, depth)?;
        let logical = Planner::new(&self.db.catalog).plan_select(&select)?;
        let physical = Optimizer::new(&self.db.catalog).optimize(&logical)?;
        let (mut op, columns) = operators::build(&self.db, &physical)?;
        let rows = operators::drain(op.as_mut())?;
        Ok((columns, rows))
    }

    fn execute_explain(&mut self, select: &SelectStatement) -> Result<QueryResult> {
        let select = self.resolve_subqueries_select(select, 0)?;
        let logical = Planner::new(&self.db.catalog).plan_select(&select)?;
        let physical = Optimizer::new(&self.db.catalog).optimize(&logical)?;
        let rows = explain(&physical)
            .lines()
            .map(|line| Tuple::new(vec![Value::Str(line.to_string())]))
            .collect();
        Ok(QueryResult {
            columns: vec!["plan".to_string()],
            rows,
            affected_rows: 0,
            message: None,
        })
    }

    // ---- subquery materialization ----

    fn resolve_subqueries_select(
        &mut self,
        select: &SelectStatement,
        depth: usize,
    ) -> Result<SelectStatement> {
        if depth >= MAX_NESTING {
            return Err(Error::SemanticError("subquery nesting too deep".to_string()));
        }
        let mut out = select.clone();
        for item in &mut out.columns {
            if let SelectItem::Expr { expr, .. } = item {
                *expr = self.resolve_subqueries_expr(expr, depth)?;
            }
        }
        if let Some(predicate) = &out.where_clause {
            out.where_clause = Some(self.resolve_subqueries_expr(predicate, depth)?);
        }
        if let Some(having) = &out.having {
            out.having = Some(self.resolve_subqueries_expr(having, depth)?);
        }
        for item in &mut out.order_by {
            item.expr = self.resolve_subqueries_expr(&item.expr, depth)?;
        }
        Ok(out)
    }

    /// Replace scalar subqueries, `IN (subquery)` and EXISTS with their
    /// materialized results (uncorrelated subqueries only).
    fn resolve_subqueries_expr(&mut self, expr: &Expr, depth: usize) -> Result<Expr> {
        let walk = |engine: &mut Self, e: &Expr| engine.resolve_subqueries_expr(e, depth);
        Ok(match expr {
            Expr::Subquery(query) => {
                let (columns, rows) = self.run_select(query, depth + 1)?;
                if columns.len() != 1 {
                    return Err(Error::SemanticError(
                        "scalar subquery must return one column".to_string(),
                    ));
                }
                if rows.len() > 1 {
                    return Err(Error::ExecutionError(
                        "scalar subquery returned more than one row".to_string(),
                    ));
                }
                let value = rows
                    .first()
                    .and_then(|r| r.get(0).cloned())
                    .unwrap_or(Value::Null);
                Expr::Literal(eval::value_to_literal(&value))
            }
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => {
                let inner = self.resolve_subqueries_expr(expr, depth)?;
                let (columns, rows) = self.run_select(query, depth + 1)?;
                if columns.len() != 1 {
                    return Err(Error::SemanticError(
                        "IN subquery must return one column".to_string(),
                    ));
                }
                let list = rows
                    .iter()
                    .map(|r| {
                        Expr::Literal(eval::value_to_literal(
                            r.get(0).unwrap_or(&Value::Null),
                        ))
                    })
                    .collect();
                Expr::InList {
                    expr: Box::new(inner),
                    list,
                    negated: *negated,
                }
            }
            Expr::Exists(query) => {
                let (_, rows) = self.run_select(query, depth + 1)?;
                Expr::Literal(Literal::Boolean(!rows.is_empty()))
            }
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(walk(self, left)?),
                op: *op,
                right: Box::new(walk(self, right)?),
            },
            Expr::UnaryOp { op, expr } => Expr::UnaryOp {
                op: *op,
                expr: Box::new(walk(self, expr)?),
            },
            Expr::Nested(inner) => Expr::Nested(Box::new(walk(self, inner)?)),
            Expr::IsNull(inner) => Expr::IsNull(Box::new(walk(self, inner)?)),
            Expr::IsNotNull(inner) => Expr::IsNotNull(Box::new(walk(self, inner)?)),
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => Expr::Between {
                expr: Box::new(walk(self, expr)?),
                low: Box::new(walk(self, low)?),
                high: Box::new(walk(self, high)?),
                negated: *negated,
            },
            Expr::InList {
                expr,
                list,
                negated,
            } => Expr::InList {
                expr: Box::new(walk(self, expr)?),
                list: list
                    .iter()
                    .map(|e| walk(self, e))
                    .collect::<Result<_>>()?,
                negated: *negated,
            },
            Expr::Like {
                expr,
                pattern,
                negated,
            } => Expr::Like {
                expr: Box::new(walk(self, expr)?),
                pattern: Box::new(walk(self, pattern)?),
                negated: *negated,
            },
            Expr::Function {
                name,
                args,
                distinct,
            } => Expr::Function {
                name: name.clone(),
                args: args
                    .iter()
                    .map(|e| walk(self, e))
                    .collect::<Result<_>>()?,
                distinct: *distinct,
            },
            Expr::Case {
                operand,
                when_clauses,
                else_clause,
            } => Expr::Case {
                operand: operand
                    .as_deref()
                    .map(|e| walk(self, e).map(Box::new))
                    .transpose()?,
                when_clauses: when_clauses
                    .iter()
                    .map(|(w, t)| Ok((walk(self, w)?, walk(self, t)?)))
                    .collect::<Result<_>>()?,
                else_clause: else_clause
                    .as_deref()
                    .map(|e| walk(self, e).map(Box::new))
                    .transpose()?,
            },
            other => other.clone(),
        })
    }

    // ---- DML ----

    fn execute_insert(
        &mut self,
        txn: u64,
        insert: &InsertStatement,
        depth: usize,
    ) -> Result<QueryResult> {
        let def = self.db.catalog.get_table(&insert.table_name)?;
        let schema = def.schema().clone();
        let checks = parse_checks(&def)?;

        // Evaluate every row up front.
        let mut tuples = Vec::new();
        for row_exprs in &insert.values {
            let mut values = match &insert.columns {
                Some(cols) => {
                    // Named columns; the rest take their DEFAULT (or NULL).
                    let mut values = default_row(&schema)?;
                    if cols.len() != row_exprs.len() {
                        return Err(Error::ExecutionError(format!(
                            "{} columns named but {} values given",
                            cols.len(),
                            row_exprs.len()
                        )));
                    }
                    for (name, expr) in cols.iter().zip(row_exprs) {
                        let idx = schema.get_column_index(name).ok_or_else(|| {
                            Error::ColumnNotFound(name.clone(), insert.table_name.clone())
                        })?;
                        let expr = self.resolve_subqueries_expr(expr, depth)?;
                        values[idx] = eval::evaluate(&expr, &[], &[])?;
                    }
                    values
                }
                None => {
                    let mut values = Vec::with_capacity(row_exprs.len());
                    for expr in row_exprs {
                        let expr = self.resolve_subqueries_expr(expr, depth)?;
                        values.push(eval::evaluate(&expr, &[], &[])?);
                    }
                    values
                }
            };
            // Bare DEFAULT-able gaps when the row is shorter than the schema.
            while values.len() < schema.column_count() {
                let idx = values.len();
                values.push(default_value(&schema.columns()[idx])?);
            }
            tuples.push(Tuple::new(values));
        }

        let mut inserted = 0;
        for tuple in tuples {
            let tuple = self.db.table(&insert.table_name)?.validate(tuple)?;
            self.fire_triggers(
                &def,
                TriggerTiming::Before,
                TriggerEvent::Insert,
                None,
                Some(&tuple),
                txn,
                depth,
            )?;
            self.enforce_checks(&checks, &def, &tuple)?;
            self.enforce_fk_parents(&def, &tuple)?;

            let table = self.db.table(&insert.table_name)?;
            let (rid, tuple) = table.insert(tuple)?;
            let record = self.db.txns.log_mutation(
                txn,
                LogRecordKind::Insert,
                insert.table_name.clone(),
                rid,
                None,
                Some(tuple.clone()),
            )?;
            self.db
                .table(&insert.table_name)?
                .set_page_lsn(rid.page_id, record.lsn)?;
            inserted += 1;

            self.fire_triggers(
                &def,
                TriggerTiming::After,
                TriggerEvent::Insert,
                None,
                Some(&tuple),
                txn,
                depth,
            )?;
        }

        Ok(QueryResult::with_affected_rows(
            inserted,
            format!("{} row(s) inserted", inserted),
        ))
    }

    fn execute_update(
        &mut self,
        txn: u64,
        update: &UpdateStatement,
        depth: usize,
    ) -> Result<QueryResult> {
        let def = self.db.catalog.get_table(&update.table_name)?;
        let schema = def.schema().clone();
        let columns: Vec<String> = schema.columns().iter().map(|c| c.name.clone()).collect();
        let checks = parse_checks(&def)?;

        let predicate = update
            .where_clause
            .as_ref()
            .map(|p| self.resolve_subqueries_expr(p, depth))
            .transpose()?;
        let assignments: Vec<(usize, Expr)> = update
            .assignments
            .iter()
            .map(|a| {
                let idx = schema.get_column_index(&a.column).ok_or_else(|| {
                    Error::ColumnNotFound(a.column.clone(), update.table_name.clone())
                })?;
                Ok((idx, self.resolve_subqueries_expr(&a.value, depth)?))
            })
            .collect::<Result<_>>()?;

        // Collect targets first; mutating under the scan would revisit rows.
        let mut targets: Vec<(Rid, Tuple)> = Vec::new();
        for row in self.db.table(&update.table_name)?.scan() {
            let (rid, tuple) = row?;
            let hit = match &predicate {
                Some(p) => eval::evaluate(p, tuple.values(), &columns)?
                    .as_bool()
                    .unwrap_or(false),
                None => true,
            };
            if hit {
                targets.push((rid, tuple));
            }
        }

        let mut updated = 0;
        for (rid, old) in targets {
            let mut new = old.clone();
            for (idx, expr) in &assignments {
                new.set(*idx, eval::evaluate(expr, old.values(), &columns)?);
            }
            let new = self.db.table(&update.table_name)?.validate(new)?;

            self.fire_triggers(
                &def,
                TriggerTiming::Before,
                TriggerEvent::Update,
                Some(&old),
                Some(&new),
                txn,
                depth,
            )?;
            self.enforce_checks(&checks, &def, &new)?;
            self.enforce_fk_parents(&def, &new)?;
            self.enforce_fk_dependents(&def, &old, Some(&new))?;

            let table = self.db.table(&update.table_name)?;
            let (before, after) = table.update(rid, new)?;
            let record = self.db.txns.log_mutation(
                txn,
                LogRecordKind::Update,
                update.table_name.clone(),
                rid,
                Some(before.clone()),
                Some(after.clone()),
            )?;
            self.db
                .table(&update.table_name)?
                .set_page_lsn(rid.page_id, record.lsn)?;
            updated += 1;

            self.fire_triggers(
                &def,
                TriggerTiming::After,
                TriggerEvent::Update,
                Some(&before),
                Some(&after),
                txn,
                depth,
            )?;
        }

        Ok(QueryResult::with_affected_rows(
            updated,
            format!("{} row(s) updated", updated),
        ))
    }

    fn execute_delete(
        &mut self,
        txn: u64,
        delete: &DeleteStatement,
        depth: usize,
    ) -> Result<QueryResult> {
        let def = self.db.catalog.get_table(&delete.table_name)?;
        let columns: Vec<String> = def
            .schema()
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let predicate = delete
            .where_clause
            .as_ref()
            .map(|p| self.resolve_subqueries_expr(p, depth))
            .transpose()?;

        let mut targets: Vec<(Rid, Tuple)> = Vec::new();
        for row in self.db.table(&delete.table_name)?.scan() {
            let (rid, tuple) = row?;
            let hit = match &predicate {
                Some(p) => eval::evaluate(p, tuple.values(), &columns)?
                    .as_bool()
                    .unwrap_or(false),
                None => true,
            };
            if hit {
                targets.push((rid, tuple));
            }
        }

        let mut deleted = 0;
        for (rid, old) in targets {
            self.fire_triggers(
                &def,
                TriggerTiming::Before,
                TriggerEvent::Delete,
                Some(&old),
                None,
                txn,
                depth,
            )?;
            self.enforce_fk_dependents(&def, &old, None)?;

            let table = self.db.table(&delete.table_name)?;
            let before = table.delete(rid)?;
            let record = self.db.txns.log_mutation(
                txn,
                LogRecordKind::Delete,
                delete.table_name.clone(),
                rid,
                Some(before.clone()),
                None,
            )?;
            self.db
                .table(&delete.table_name)?
                .set_page_lsn(rid.page_id, record.lsn)?;
            deleted += 1;

            self.fire_triggers(
                &def,
                TriggerTiming::After,
                TriggerEvent::Delete,
                Some(&before),
                None,
                txn,
                depth,
            )?;
        }

        Ok(QueryResult::with_affected_rows(
            deleted,
            format!("{} row(s) deleted", deleted),
        ))
    }

    // ---- constraints ----

    fn enforce_checks(
        &self,
        checks: &[(String, Expr)],
        def: &TableDef,
        tuple: &Tuple,
    ) -> Result<()> {
        let columns: Vec<String> = def
            .schema()
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        for (name, expr) in checks {
            let passed = eval::evaluate(expr, tuple.values(), &columns)?;
            // NULL check results pass, per SQL.
            if passed.as_bool() == Some(false) {
                return Err(Error::ConstraintViolation(format!(
                    "CHECK constraint failed: {}",
                    name
                )));
            }
        }
        Ok(())
    }

    /// INSERT/UPDATE side of RESTRICT: every non-null foreign key must have
    /// a parent.
    fn enforce_fk_parents(&self, def: &TableDef, tuple: &Tuple) -> Result<()> {
        for fk in &def.foreign_keys {
            let values: Vec<Value> = fk
                .columns
                .iter()
                .map(|c| {
                    def.schema()
                        .get_column_index(c)
                        .and_then(|i| tuple.get(i).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            if !self.key_exists(&fk.ref_table, &fk.ref_columns, &values)? {
                return Err(Error::ForeignKeyViolation(format!(
                    "no row in '{}' matches ({})",
                    fk.ref_table,
                    values
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }
        Ok(())
    }

    /// DELETE/UPDATE side of RESTRICT: reject when dependents reference the
    /// outgoing key value.
    fn enforce_fk_dependents(
        &self,
        def: &TableDef,
        old: &Tuple,
        new: Option<&Tuple>,
    ) -> Result<()> {
        for child in self.db.catalog.referencing_tables(def.name()) {
            for fk in child.foreign_keys.iter().filter(|f| f.ref_table == def.name) {
                let old_key: Vec<Value> = fk
                    .ref_columns
                    .iter()
                    .map(|c| {
                        def.schema()
                            .get_column_index(c)
                            .and_then(|i| old.get(i).cloned())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                if old_key.iter().any(|v| v.is_null()) {
                    continue;
                }
                // An update that keeps the key is always fine.
                if let Some(new) = new {
                    let new_key: Vec<Value> = fk
                        .ref_columns
                        .iter()
                        .map(|c| {
                            def.schema()
                                .get_column_index(c)
                                .and_then(|i| new.get(i).cloned())
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    if new_key == old_key {
                        continue;
                    }
                }
                if self.key_exists(&child.name, &fk.columns, &old_key)? {
                    return Err(Error::ForeignKeyViolation(format!(
                        "rows in '{}' still reference ({})",
                        child.name,
                        old_key
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Does any row of `table` carry `values` in `columns`? Prefers an index
    /// whose leading columns are exactly `columns`; falls back to a scan.
    fn key_exists(&self, table: &str, columns: &[String], values: &[Value]) -> Result<bool> {
        let table_ref = self.db.table(table)?;
        for index in table_ref.indexes() {
            if index.def.columns == columns {
                let key = crate::storage::IndexKey::composite(values.to_vec());
                return index.tree.contains_key(&key);
            }
        }
        // No matching index: scan.
        let def = self.db.catalog.get_table(table)?;
        let positions: Vec<usize> = columns
            .iter()
            .map(|c| {
                def.schema()
                    .get_column_index(c)
                    .ok_or_else(|| Error::ColumnNotFound(c.clone(), table.to_string()))
            })
            .collect::<Result<_>>()?;
        for row in table_ref.scan() {
            let (_, tuple) = row?;
            let hit = positions
                .iter()
                .zip(values)
                .all(|(i, v)| tuple.get(*i).map(|t| t == v).unwrap_or(false));
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- triggers ----

    #[allow(clippy::too_many_arguments)]
    fn fire_triggers(
        &mut self,
        def: &TableDef,
        timing: TriggerTiming,
        event: TriggerEvent,
        old: Option<&Tuple>,
        new: Option<&Tuple>,
        txn: u64,
        depth: usize,
    ) -> Result<()> {
        let triggers = self.db.catalog.matching_triggers(def.name(), timing, event);
        if triggers.is_empty() {
            return Ok(());
        }
        if depth >= MAX_NESTING {
            return Err(Error::ExecutionError(
                "trigger nesting too deep".to_string(),
            ));
        }

        // Row context: bare names bind to NEW (or OLD for deletes), plus
        // explicit OLD./NEW. qualifiers.
        let mut columns = Vec::new();
        let mut row = Vec::new();
        let primary = new.or(old);
        for (i, col) in def.schema().columns().iter().enumerate() {
            columns.push(col.name.clone());
            row.push(
                primary
                    .and_then(|t| t.get(i).cloned())
                    .unwrap_or(Value::Null),
            );
        }
        for (qualifier, tuple) in [("OLD", old), ("NEW", new)] {
            if let Some(tuple) = tuple {
                for (i, col) in def.schema().columns().iter().enumerate() {
                    columns.push(format!("{}.{}", qualifier, col.name));
                    row.push(tuple.get(i).cloned().unwrap_or(Value::Null));
                }
            }
        }

        for trigger in triggers {
            if let Some(condition) = &trigger.condition {
                let expr = Parser::parse_expression(condition)?;
                let fired = eval::evaluate(&expr, &row, &columns)?
                    .as_bool()
                    .unwrap_or(false);
                if !fired {
                    continue;
                }
            }
            debug!(trigger = %trigger.name, table = %def.name, "trigger fired");
            match &trigger.action {
                TriggerAction::Signal { sqlstate, message } => {
                    return Err(Error::ConstraintViolation(if message.is_empty() {
                        format!("SQLSTATE {}", sqlstate)
                    } else {
                        message.clone()
                    }));
                }
                TriggerAction::Statement(sql) => {
                    let stmt = Parser::new(sql)?.parse()?;
                    match stmt {
                        Statement::Insert(insert) => {
                            self.execute_insert(txn, &insert, depth + 1)?;
                        }
                        Statement::Update(update) => {
                            self.execute_update(txn, &update, depth + 1)?;
                        }
                        Statement::Delete(delete) => {
                            self.execute_delete(txn, &delete, depth + 1)?;
                        }
                        _ => {
                            return Err(Error::ExecutionError(
                                "trigger body must be a DML statement".to_string(),
                            ))
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- DDL ----

    fn execute_create_table(&mut self, create: CreateTableStatement) -> Result<QueryResult> {
        if self.db.catalog.table_exists(&create.table_name) {
            if create.if_not_exists {
                return Ok(QueryResult::with_message(format!(
                    "Table '{}' already exists",
                    create.table_name
                )));
            }
            return Err(Error::TableAlreadyExists(create.table_name));
        }

        let mut schema = Schema::new();
        let mut foreign_keys = Vec::new();
        let mut table_checks = Vec::new();
        let mut unique_sets: Vec<Vec<String>> = Vec::new();

        for (i, col_def) in create.columns.iter().enumerate() {
            let mut column = Column::new(col_def.name.clone(), col_def.data_type.clone(), i)
                .nullable(!col_def.not_null)
                .primary_key(col_def.primary_key)
                .unique(col_def.unique);
            if let Some((_, sql)) = &col_def.default {
                column = column.default_expr(sql.clone());
            }
            if let Some((_, sql)) = &col_def.check {
                column = column.check_expr(sql.clone());
            }
            if let Some((ref_table, ref_column)) = &col_def.references {
                foreign_keys.push(ForeignKeyDef {
                    name: None,
                    columns: vec![col_def.name.clone()],
                    ref_table: ref_table.clone(),
                    ref_columns: vec![ref_column.clone()],
                });
            }
            schema.add_column(column);
        }

        for constraint in &create.constraints {
            match constraint {
                TableConstraint::PrimaryKey { columns, .. } => {
                    for name in columns {
                        let idx = schema.get_column_index(name).ok_or_else(|| {
                            Error::ColumnNotFound(name.clone(), create.table_name.clone())
                        })?;
                        let mut cols: Vec<Column> = schema.columns().to_vec();
                        cols[idx].primary_key = true;
                        cols[idx].nullable = false;
                        schema = Schema::from_columns(cols);
                    }
                }
                TableConstraint::Unique { columns, .. } => {
                    unique_sets.push(columns.clone());
                }
                TableConstraint::ForeignKey {
                    name,
                    columns,
                    ref_table,
                    ref_columns,
                } => {
                    foreign_keys.push(ForeignKeyDef {
                        name: name.clone(),
                        columns: columns.clone(),
                        ref_table: ref_table.clone(),
                        ref_columns: ref_columns.clone(),
                    });
                }
                TableConstraint::Check { name, sql, .. } => {
                    table_checks.push((name.clone(), sql.clone()));
                }
            }
        }

        // Referenced tables must exist up front.
        for fk in &foreign_keys {
            if fk.ref_table != create.table_name {
                self.db.catalog.get_table(&fk.ref_table)?;
            }
        }

        let mut def = TableDef::new(&create.table_name, schema, 0);
        def.foreign_keys = foreign_keys;
        def.checks = table_checks;
        let def = self.db.catalog.create_table(def)?;
        self.db
            .pool
            .lock()
            .unwrap()
            .disk_manager()
            .register_file(def.id, format!("table_{}.tbl", def.id));
        self.db
            .tables
            .insert(create.table_name.clone(), Table::open(def.clone(), self.db.pool.clone()));

        // Primary key and unique constraints materialize as indexes.
        let pk_columns: Vec<String> = def
            .schema()
            .primary_key_columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        if !pk_columns.is_empty() {
            self.create_index_internal(
                &format!("pk_{}", create.table_name),
                &create.table_name,
                pk_columns,
                true,
                true,
            )?;
        }
        for col in def.schema().columns() {
            if col.unique && !col.primary_key {
                self.create_index_internal(
                    &format!("uq_{}_{}", create.table_name, col.name),
                    &create.table_name,
                    vec![col.name.clone()],
                    true,
                    false,
                )?;
            }
        }
        for columns in unique_sets {
            let suffix = columns.join("_");
            self.create_index_internal(
                &format!("uq_{}_{}", create.table_name, suffix),
                &create.table_name,
                columns,
                true,
                false,
            )?;
        }

        self.db.save_catalog()?;
        // New heap and index pages must be durable before any WAL record can
        // reference them.
        self.db.checkpoint()?;
        Ok(QueryResult::with_message(format!(
            "Table '{}' created",
            create.table_name
        )))
    }

    fn execute_drop_table(&mut self, drop: DropTableStatement) -> Result<QueryResult> {
        if !self.db.catalog.table_exists(&drop.table_name) {
            if drop.if_exists {
                return Ok(QueryResult::with_message(format!(
                    "Table '{}' does not exist",
                    drop.table_name
                )));
            }
            return Err(Error::TableNotFound(drop.table_name));
        }

        // RESTRICT: a referenced table cannot be dropped.
        let blockers: Vec<String> = self
            .db
            .catalog
            .referencing_tables(&drop.table_name)
            .iter()
            .map(|t| t.name.clone())
            .filter(|n| *n != drop.table_name)
            .collect();
        if !blockers.is_empty() {
            return Err(Error::ForeignKeyViolation(format!(
                "table '{}' is referenced by {}",
                drop.table_name,
                blockers.join(", ")
            )));
        }

        let def = self.db.catalog.get_table(&drop.table_name)?;
        let index_ids: Vec<u32> = self
            .db
            .catalog
            .get_table_indexes(&drop.table_name)
            .iter()
            .map(|i| i.id)
            .collect();

        self.db.tables.remove(&drop.table_name);
        self.db.catalog.drop_table(&drop.table_name)?;
        {
            let pool = self.db.pool.lock().unwrap();
            let disk = pool.disk_manager();
            disk.remove_file(def.id)?;
            for id in index_ids {
                disk.remove_file(id)?;
            }
        }
        self.db.save_catalog()?;
        Ok(QueryResult::with_message(format!(
            "Table '{}' dropped",
            drop.table_name
        )))
    }

    fn execute_create_index(&mut self, create: CreateIndexStatement) -> Result<QueryResult> {
        if self.db.catalog.get_index(&create.index_name).is_ok() {
            if create.if_not_exists {
                return Ok(QueryResult::with_message(format!(
                    "Index '{}' already exists",
                    create.index_name
                )));
            }
            return Err(Error::IndexAlreadyExists(create.index_name));
        }
        self.create_index_internal(
            &create.index_name,
            &create.table_name,
            create.columns,
            create.unique,
            false,
        )?;
        self.db.save_catalog()?;
        self.db.checkpoint()?;
        Ok(QueryResult::with_message(format!(
            "Index '{}' created on '{}'",
            create.index_name, create.table_name
        )))
    }

    fn create_index_internal(
        &mut self,
        name: &str,
        table_name: &str,
        columns: Vec<String>,
        unique: bool,
        primary: bool,
    ) -> Result<()> {
        let index_def = self
            .db
            .catalog
            .create_index(name, table_name, columns, unique, primary)?;
        let tree = match self.db.open_index_tree(&index_def) {
            Ok(tree) => tree,
            Err(e) => {
                self.rollback_index_creation(name, index_def.id);
                return Err(e);
            }
        };

        let table = self
            .db
            .tables
            .get_mut(table_name)
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;
        let attached = table.attach_index(index_def.clone(), tree)?.clone();

        // Backfill from existing rows; a uniqueness conflict rolls the whole
        // index back.
        let table = self.db.table(table_name)?;
        if let Err(e) = table.build_index(&attached) {
            self.db
                .tables
                .get_mut(table_name)
                .map(|t| t.detach_index(name));
            self.rollback_index_creation(name, index_def.id);
            return Err(e);
        }
        Ok(())
    }

    fn rollback_index_creation(&mut self, name: &str, file_id: u32) {
        self.db.catalog.remove_index_unchecked(name);
        let pool = self.db.pool.lock().unwrap();
        let _ = pool.disk_manager().remove_file(file_id);
    }

    fn execute_drop_index(&mut self, drop: DropIndexStatement) -> Result<QueryResult> {
        let def = match self.db.catalog.get_index(&drop.index_name) {
            Ok(def) => def,
            Err(_) if drop.if_exists => {
                return Ok(QueryResult::with_message(format!(
                    "Index '{}' does not exist",
                    drop.index_name
                )))
            }
            Err(e) => return Err(e),
        };
        self.db.catalog.drop_index(&drop.index_name)?;
        if let Some(table) = self.db.tables.get_mut(&def.table_name) {
            table.detach_index(&drop.index_name);
        }
        self.db
            .pool
            .lock()
            .unwrap()
            .disk_manager()
            .remove_file(def.id)?;
        self.db.save_catalog()?;
        Ok(QueryResult::with_message(format!(
            "Index '{}' dropped",
            drop.index_name
        )))
    }

    fn execute_create_view(
        &mut self,
        view: CreateViewStatement,
        alter: bool,
    ) -> Result<QueryResult> {
        if alter && self.db.catalog.get_view(&view.name).is_none() {
            return Err(Error::ViewNotFound(view.name));
        }
        // Validate the stored SELECT by planning it once.
        Planner::new(&self.db.catalog).plan_select(&view.query)?;
        self.db
            .catalog
            .create_view(&view.name, &view.sql, view.or_replace || alter)?;
        self.db.save_catalog()?;
        Ok(QueryResult::with_message(format!(
            "View '{}' {}",
            view.name,
            if alter { "altered" } else { "created" }
        )))
    }

    fn execute_create_trigger(
        &mut self,
        trigger: CreateTriggerStatement,
    ) -> Result<QueryResult> {
        let action = match &trigger.body {
            TriggerBody::Signal { sqlstate, message } => TriggerAction::Signal {
                sqlstate: sqlstate.clone(),
                message: message.clone().unwrap_or_default(),
            },
            TriggerBody::Statement { sql, .. } => TriggerAction::Statement(sql.clone()),
        };
        self.db.catalog.create_trigger(TriggerDef {
            name: trigger.name.clone(),
            table_name: trigger.table_name,
            timing: trigger.timing,
            event: trigger.event,
            condition: trigger.condition.map(|(_, sql)| sql),
            action,
        })?;
        self.db.save_catalog()?;
        Ok(QueryResult::with_message(format!(
            "Trigger '{}' created",
            trigger.name
        )))
    }

    fn execute_create_database(&mut self, name: &str) -> Result<QueryResult> {
        let dir = self.config.data_dir.join(name);
        if dir.exists() {
            return Err(Error::DatabaseAlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(&dir)?;
        Catalog::new().save_to_disk(&Catalog::catalog_path(&dir))?;
        Ok(QueryResult::with_message(format!(
            "Database '{}' created",
            name
        )))
    }

    fn execute_use_database(&mut self, name: &str) -> Result<QueryResult> {
        if self.session.txn.is_some() {
            return Err(Error::TransactionActive);
        }
        if !self.config.data_dir.join(name).exists() {
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        self.close_all_cursors();
        self.db.checkpoint()?;
        self.db = Database::open(&self.config.data_dir, name, &self.config)?;
        Ok(QueryResult::with_message(format!("Using database '{}'", name)))
    }

    fn execute_analyze(&mut self, table: &str) -> Result<QueryResult> {
        let mut row_count = 0;
        for row in self.db.table(table)?.scan() {
            row?;
            row_count += 1;
        }
        self.db
            .catalog
            .update_table_stats(table, TableStatistics { row_count })?;
        self.db.save_catalog()?;
        Ok(QueryResult::with_message(format!(
            "Analyzed table {}, found {} rows",
            table, row_count
        )))
    }

    // ---- introspection ----

    fn execute_show(&mut self, show: &ShowStatement) -> Result<QueryResult> {
        let result = match show {
            ShowStatement::Tables => QueryResult {
                columns: vec!["table_name".to_string()],
                rows: self
                    .db
                    .catalog
                    .list_tables()
                    .into_iter()
                    .map(|name| Tuple::new(vec![Value::Str(name)]))
                    .collect(),
                affected_rows: 0,
                message: None,
            },
            ShowStatement::Columns { table } => {
                let def = self.db.catalog.get_table(table)?;
                QueryResult {
                    columns: vec![
                        "column_name".to_string(),
                        "type".to_string(),
                        "nullable".to_string(),
                        "default".to_string(),
                        "key".to_string(),
                    ],
                    rows: def
                        .schema()
                        .columns()
                        .iter()
                        .map(|c| {
                            Tuple::new(vec![
                                Value::Str(c.name.clone()),
                                Value::Str(c.data_type.to_string()),
                                Value::Bool(c.nullable),
                                c.default
                                    .clone()
                                    .map(Value::Str)
                                    .unwrap_or(Value::Null),
                                Value::Str(
                                    if c.primary_key {
                                        "PRI"
                                    } else if c.unique {
                                        "UNI"
                                    } else {
                                        ""
                                    }
                                    .to_string(),
                                ),
                            ])
                        })
                        .collect(),
                    affected_rows: 0,
                    message: None,
                }
            }
            ShowStatement::Index { table } => {
                self.db.catalog.get_table(table)?;
                QueryResult {
                    columns: vec![
                        "index_name".to_string(),
                        "columns".to_string(),
                        "unique".to_string(),
                        "primary".to_string(),
                        "root_page".to_string(),
                    ],
                    rows: self
                        .db
                        .catalog
                        .get_table_indexes(table)
                        .iter()
                        .map(|idx| {
                            let root = self
                                .db
                                .table(table)
                                .ok()
                                .and_then(|t| t.index(&idx.name))
                                .map(|i| i.tree.root_page_id());
                            Tuple::new(vec![
                                Value::Str(idx.name.clone()),
                                Value::Str(idx.columns.join(", ")),
                                Value::Bool(idx.unique),
                                Value::Bool(idx.primary),
                                root.map(|r| Value::BigInt(r as i64)).unwrap_or(Value::Null),
                            ])
                        })
                        .collect(),
                    affected_rows: 0,
                    message: None,
                }
            }
            ShowStatement::Triggers => QueryResult {
                columns: vec![
                    "trigger_name".to_string(),
                    "table_name".to_string(),
                    "timing".to_string(),
                    "event".to_string(),
                ],
                rows: self
                    .db
                    .catalog
                    .list_triggers()
                    .iter()
                    .map(|t| {
                        Tuple::new(vec![
                            Value::Str(t.name.clone()),
                            Value::Str(t.table_name.clone()),
                            Value::Str(format!("{:?}", t.timing).to_uppercase()),
                            Value::Str(format!("{:?}", t.event).to_uppercase()),
                        ])
                    })
                    .collect(),
                affected_rows: 0,
                message: None,
            },
            ShowStatement::Views => QueryResult {
                columns: vec!["view_name".to_string(), "definition".to_string()],
                rows: self
                    .db
                    .catalog
                    .list_views()
                    .iter()
                    .map(|v| {
                        Tuple::new(vec![
                            Value::Str(v.name.clone()),
                            Value::Str(v.query.clone()),
                        ])
                    })
                    .collect(),
                affected_rows: 0,
                message: None,
            },
        };
        Ok(result)
    }

    // ---- cursors ----

    fn execute_declare_cursor(&mut self, declare: DeclareCursorStatement) -> Result<QueryResult> {
        if self.cursors.contains_key(&declare.name) {
            return Err(Error::ExecutionError(format!(
                "cursor '{}' already declared",
                declare.name
            )));
        }
        let select = self.resolve_subqueries_select(&declare.query, 0)?;
        let logical = Planner::new(&self.db.catalog).plan_select(&select)?;
        let physical = Optimizer::new(&self.db.catalog).optimize(&logical)?;
        let (_, columns) = operators::build(&self.db, &physical)?;
        self.cursors.insert(
            declare.name.clone(),
            Cursor {
                plan: physical,
                columns,
                op: None,
            },
        );
        Ok(QueryResult::with_message(format!(
            "Cursor '{}' declared",
            declare.name
        )))
    }

    fn execute_open_cursor(&mut self, name: &str) -> Result<QueryResult> {
        let cursor = self
            .cursors
            .get_mut(name)
            .ok_or_else(|| Error::CursorNotFound(name.to_string()))?;
        if cursor.op.is_some() {
            return Err(Error::ExecutionError(format!(
                "cursor '{}' is already open",
                name
            )));
        }
        let plan = cursor.plan.clone();
        let (mut op, _) = operators::build(&self.db, &plan)?;
        op.open()?;
        self.cursors.get_mut(name).expect("checked above").op = Some(op);
        Ok(QueryResult::with_message(format!("Cursor '{}' opened", name)))
    }

    fn execute_fetch(&mut self, name: &str, count: Option<u64>) -> Result<QueryResult> {
        let cursor = self
            .cursors
            .get_mut(name)
            .ok_or_else(|| Error::CursorNotFound(name.to_string()))?;
        let op = cursor.op.as_mut().ok_or_else(|| {
            Error::ExecutionError(format!("cursor '{}' is not open", name))
        })?;

        let want = count.unwrap_or(1);
        let mut rows = Vec::new();
        for _ in 0..want {
            match op.next()? {
                Some(tuple) => rows.push(tuple),
                None => break,
            }
        }
        Ok(QueryResult {
            columns: tidy_columns(cursor.columns.clone()),
            rows,
            affected_rows: 0,
            message: None,
        })
    }

    fn execute_close_cursor(&mut self, name: &str) -> Result<QueryResult> {
        let mut cursor = self
            .cursors
            .remove(name)
            .ok_or_else(|| Error::CursorNotFound(name.to_string()))?;
        if let Some(op) = cursor.op.as_mut() {
            op.close()?;
        }
        Ok(QueryResult::with_message(format!("Cursor '{}' closed", name)))
    }

    fn close_all_cursors(&mut self) {
        for (_, mut cursor) in self.cursors.drain() {
            if let Some(op) = cursor.op.as_mut() {
                let _ = op.close();
            }
        }
    }
}

/// Strip qualifiers from result headers where the bare name is unambiguous.
fn tidy_columns(columns: Vec<String>) -> Vec<String> {
    let bare: Vec<String> = columns
        .iter()
        .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
        .collect();
    columns
        .iter()
        .zip(&bare)
        .map(|(full, short)| {
            if bare.iter().filter(|b| *b == short).count() == 1 {
                short.clone()
            } else {
                full.clone()
            }
        })
        .collect()
}

/// Pre-parse column and table CHECK expressions once per statement.
fn parse_checks(def: &TableDef) -> Result<Vec<(String, Expr)>> {
    let mut checks = Vec::new();
    for col in def.schema().columns() {
        if let Some(sql) = &col.check {
            checks.push((format!("{}.{}", def.name, col.name), Parser::parse_expression(sql)?));
        }
    }
    for (name, sql) in &def.checks {
        let label = name.clone().unwrap_or_else(|| def.name.clone());
        checks.push((label, Parser::parse_expression(sql)?));
    }
    Ok(checks)
}

/// A full row of DEFAULT (or NULL) values.
fn default_row(schema: &Schema) -> Result<Vec<Value>> {
    schema.columns().iter().map(default_value).collect()
}

fn default_value(column: &Column) -> Result<Value> {
    match &column.default {
        Some(sql) => {
            let expr = Parser::parse_expression(sql)?;
            eval::evaluate(&expr, &[], &[])
        }
        None => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (tempfile::TempDir, RookEngine) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            buffer_pool_pages: 64,
            checkpoint_interval_txns: 0,
            fsync_enabled: true,
        };
        (dir, RookEngine::open(config).unwrap())
    }

    fn setup_students(engine: &mut RookEngine) {
        engine
            .execute_sql(
                "CREATE TABLE students (\
                   student_id INT PRIMARY KEY, \
                   name VARCHAR(100) NOT NULL, \
                   gpa DECIMAL(4, 2) DEFAULT 0.0, \
                   dept_id INT)",
            )
            .unwrap();
    }

    #[test]
    fn test_create_insert_select() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1), (2, 'Bob', 3.1, 2)")
            .unwrap();

        let result = engine
            .execute_sql("SELECT name FROM students WHERE student_id = 2")
            .unwrap();
        assert_eq!(result.columns, vec!["name"]);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Str("Bob".into())));
        assert_eq!(engine.db.pins(), 0);
    }

    #[test]
    fn test_insert_with_column_list_uses_defaults() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students (student_id, name) VALUES (7, 'Grace')")
            .unwrap();
        let result = engine
            .execute_sql("SELECT gpa, dept_id FROM students WHERE student_id = 7")
            .unwrap();
        assert_eq!(
            result.rows[0].get(0),
            Some(&Value::Decimal { raw: 0, scale: 2 })
        );
        assert_eq!(result.rows[0].get(1), Some(&Value::Null));
    }

    #[test]
    fn test_primary_key_violation_leaves_table_unchanged() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1)")
            .unwrap();
        let err = engine.execute_sql("INSERT INTO students VALUES (1, 'Duplicate', 2.0, 1)");
        assert!(matches!(err, Err(Error::PrimaryKeyViolation(_))));

        let result = engine.execute_sql("SELECT * FROM students").unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get(1), Some(&Value::Str("Alice".into())));
    }

    #[test]
    fn test_explain_shows_index_scan() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        let result = engine
            .execute_sql("EXPLAIN SELECT * FROM students WHERE student_id = 60")
            .unwrap();
        let plan: Vec<String> = result
            .rows
            .iter()
            .map(|r| r.get(0).unwrap().to_string())
            .collect();
        assert!(plan.iter().any(|l| l.contains("IndexScan")), "{:?}", plan);
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1), (2, 'Bob', 3.1, 2)")
            .unwrap();

        let result = engine
            .execute_sql("UPDATE students SET gpa = 4.0 WHERE name = 'Alice'")
            .unwrap();
        assert_eq!(result.affected_rows, 1);

        let result = engine
            .execute_sql("SELECT gpa FROM students WHERE student_id = 1")
            .unwrap();
        assert_eq!(
            result.rows[0].get(0),
            Some(&Value::Decimal { raw: 400, scale: 2 })
        );

        engine
            .execute_sql("DELETE FROM students WHERE student_id = 2")
            .unwrap();
        let result = engine.execute_sql("SELECT * FROM students").unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_transaction_rollback_restores_state() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1)")
            .unwrap();

        engine.execute_sql("BEGIN").unwrap();
        engine
            .execute_sql("INSERT INTO students VALUES (11, 'Temp', 2.0, 1)")
            .unwrap();
        engine
            .execute_sql("UPDATE students SET name = 'Changed' WHERE student_id = 11")
            .unwrap();
        engine.execute_sql("ROLLBACK").unwrap();

        let result = engine
            .execute_sql("SELECT * FROM students WHERE student_id = 11")
            .unwrap();
        assert_eq!(result.rows.len(), 0);

        // The index agrees with the heap.
        let result = engine
            .execute_sql("SELECT * FROM students WHERE student_id = 1")
            .unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_failed_statement_poisons_explicit_txn() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1)")
            .unwrap();

        engine.execute_sql("BEGIN").unwrap();
        engine
            .execute_sql("INSERT INTO students VALUES (2, 'Bob', 3.0, 1)")
            .unwrap();
        // Duplicate key fails the statement.
        assert!(engine
            .execute_sql("INSERT INTO students VALUES (1, 'Dup', 1.0, 1)")
            .is_err());
        // Everything but ROLLBACK now fails.
        assert!(matches!(
            engine.execute_sql("SELECT * FROM students"),
            Err(Error::TxnAborted)
        ));
        assert!(matches!(
            engine.execute_sql("COMMIT"),
            Err(Error::TxnAborted)
        ));
        engine.execute_sql("ROLLBACK").unwrap();

        // Bob is gone with the transaction.
        let result = engine.execute_sql("SELECT * FROM students").unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_left_join_group_by_counts_include_zero() {
        let (_dir, mut engine) = test_engine();
        engine
            .execute_sql(
                "CREATE TABLE departments (dept_id INT PRIMARY KEY, dept_name VARCHAR(50))",
            )
            .unwrap();
        setup_students(&mut engine);
        engine
            .execute_sql(
                "INSERT INTO departments VALUES (1, 'CS'), (2, 'Math'), (3, 'Philosophy')",
            )
            .unwrap();
        engine
            .execute_sql(
                "INSERT INTO students VALUES \
                 (1, 'Alice', 3.9, 1), (2, 'Bob', 3.1, 1), (3, 'Cleo', 3.5, 2)",
            )
            .unwrap();

        let result = engine
            .execute_sql(
                "SELECT d.dept_name, COUNT(s.student_id) \
                 FROM departments d LEFT JOIN students s ON d.dept_id = s.dept_id \
                 GROUP BY d.dept_name \
                 ORDER BY d.dept_name",
            )
            .unwrap();
        assert_eq!(result.rows.len(), 3);
        let counts: Vec<(String, i64)> = result
            .rows
            .iter()
            .map(|r| {
                (
                    r.get(0).unwrap().to_string(),
                    r.get(1).unwrap().as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            counts,
            vec![
                ("CS".to_string(), 2),
                ("Math".to_string(), 1),
                ("Philosophy".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_foreign_key_restrict() {
        let (_dir, mut engine) = test_engine();
        engine
            .execute_sql(
                "CREATE TABLE departments (dept_id INT PRIMARY KEY, dept_name VARCHAR(50))",
            )
            .unwrap();
        engine
            .execute_sql(
                "CREATE TABLE students (\
                   student_id INT PRIMARY KEY, \
                   dept_id INT, \
                   FOREIGN KEY (dept_id) REFERENCES departments(dept_id))",
            )
            .unwrap();
        engine
            .execute_sql("INSERT INTO departments VALUES (1, 'CS')")
            .unwrap();

        // Parent must exist.
        assert!(matches!(
            engine.execute_sql("INSERT INTO students VALUES (1, 99)"),
            Err(Error::ForeignKeyViolation(_))
        ));
        // NULL foreign keys are allowed.
        engine
            .execute_sql("INSERT INTO students VALUES (2, NULL)")
            .unwrap();
        engine
            .execute_sql("INSERT INTO students VALUES (3, 1)")
            .unwrap();

        // Deleting a referenced parent is rejected.
        assert!(matches!(
            engine.execute_sql("DELETE FROM departments WHERE dept_id = 1"),
            Err(Error::ForeignKeyViolation(_))
        ));
        // Dropping the referenced table is rejected too.
        assert!(matches!(
            engine.execute_sql("DROP TABLE departments"),
            Err(Error::ForeignKeyViolation(_))
        ));

        // After the dependent row goes away the parent can go.
        engine
            .execute_sql("DELETE FROM students WHERE student_id = 3")
            .unwrap();
        engine
            .execute_sql("DELETE FROM departments WHERE dept_id = 1")
            .unwrap();
    }

    #[test]
    fn test_check_constraint() {
        let (_dir, mut engine) = test_engine();
        engine
            .execute_sql(
                "CREATE TABLE grades (id INT PRIMARY KEY, score INT CHECK (score BETWEEN 0 AND 100))",
            )
            .unwrap();
        engine
            .execute_sql("INSERT INTO grades VALUES (1, 88)")
            .unwrap();
        assert!(matches!(
            engine.execute_sql("INSERT INTO grades VALUES (2, 300)"),
            Err(Error::ConstraintViolation(_))
        ));
        assert!(matches!(
            engine.execute_sql("UPDATE grades SET score = -1 WHERE id = 1"),
            Err(Error::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_trigger_signal_aborts_statement() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql(
                "CREATE TRIGGER gpa_cap BEFORE INSERT ON students \
                 FOR EACH ROW WHEN (gpa > 4.0) \
                 SIGNAL SQLSTATE '45000' SET MESSAGE_TEXT = 'gpa out of range'",
            )
            .unwrap();

        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Fine', 3.0, 1)")
            .unwrap();
        let err = engine.execute_sql("INSERT INTO students VALUES (2, 'Bad', 4.5, 1)");
        match err {
            Err(Error::ConstraintViolation(msg)) => assert_eq!(msg, "gpa out of range"),
            other => panic!("expected ConstraintViolation, got {:?}", other),
        }
        let result = engine.execute_sql("SELECT * FROM students").unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_trigger_dml_body() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("CREATE TABLE audit_log (entry_id INT, what VARCHAR(50))")
            .unwrap();
        engine
            .execute_sql(
                "CREATE TRIGGER log_insert AFTER INSERT ON students \
                 INSERT INTO audit_log VALUES (1, 'student added')",
            )
            .unwrap();
        engine
            .execute_sql("INSERT INTO students VALUES (1, 'Alice', 3.9, 1)")
            .unwrap();
        let result = engine.execute_sql("SELECT * FROM audit_log").unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[test]
    fn test_views() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql(
                "INSERT INTO students VALUES (1, 'Alice', 3.9, 1), (2, 'Bob', 2.1, 1)",
            )
            .unwrap();
        engine
            .execute_sql("CREATE VIEW honors AS SELECT name FROM students WHERE gpa >= 3.5")
            .unwrap();

        let result = engine.execute_sql("SELECT * FROM honors").unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Str("Alice".into())));

        engine
            .execute_sql("ALTER VIEW honors AS SELECT name FROM students WHERE gpa >= 2.0")
            .unwrap();
        let result = engine.execute_sql("SELECT * FROM honors").unwrap();
        assert_eq!(result.rows.len(), 2);

        engine.execute_sql("DROP VIEW honors").unwrap();
        assert!(engine.execute_sql("SELECT * FROM honors").is_err());
    }

    #[test]
    fn test_cursors() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        for i in 1..=5 {
            engine
                .execute_sql(&format!(
                    "INSERT INTO students VALUES ({}, 'S{}', 3.0, 1)",
                    i, i
                ))
                .unwrap();
        }
        engine
            .execute_sql("DECLARE c1 CURSOR FOR SELECT name FROM students ORDER BY student_id")
            .unwrap();
        engine.execute_sql("OPEN c1").unwrap();

        let first = engine.execute_sql("FETCH c1").unwrap();
        assert_eq!(first.rows.len(), 1);
        assert_eq!(first.rows[0].get(0), Some(&Value::Str("S1".into())));

        let three = engine.execute_sql("FETCH 3 FROM c1").unwrap();
        assert_eq!(three.rows.len(), 3);

        // Only one row left.
        let rest = engine.execute_sql("FETCH 10 FROM c1").unwrap();
        assert_eq!(rest.rows.len(), 1);

        engine.execute_sql("CLOSE c1").unwrap();
        assert!(engine.execute_sql("FETCH c1").is_err());
        assert_eq!(engine.db.pins(), 0);
    }

    #[test]
    fn test_show_statements() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql("CREATE VIEW v AS SELECT name FROM students")
            .unwrap();

        let tables = engine.execute_sql("SHOW TABLES").unwrap();
        assert_eq!(tables.rows.len(), 1);

        let columns = engine.execute_sql("SHOW COLUMNS FROM students").unwrap();
        assert_eq!(columns.rows.len(), 4);

        let index = engine.execute_sql("SHOW INDEX FROM students").unwrap();
        assert_eq!(index.rows.len(), 1);
        assert_eq!(
            index.rows[0].get(0),
            Some(&Value::Str("pk_students".into()))
        );

        let views = engine.execute_sql("SHOW VIEWS").unwrap();
        assert_eq!(views.rows.len(), 1);
    }

    #[test]
    fn test_scalar_and_in_subqueries() {
        let (_dir, mut engine) = test_engine();
        engine
            .execute_sql(
                "CREATE TABLE departments (dept_id INT PRIMARY KEY, dept_name VARCHAR(50))",
            )
            .unwrap();
        setup_students(&mut engine);
        engine
            .execute_sql("INSERT INTO departments VALUES (1, 'CS'), (2, 'Math')")
            .unwrap();
        engine
            .execute_sql(
                "INSERT INTO students VALUES \
                 (1, 'Alice', 3.9, 1), (2, 'Bob', 3.1, 2), (3, 'Cleo', 3.5, 1)",
            )
            .unwrap();

        let result = engine
            .execute_sql(
                "SELECT name FROM students \
                 WHERE dept_id IN (SELECT dept_id FROM departments WHERE dept_name = 'CS')",
            )
            .unwrap();
        assert_eq!(result.rows.len(), 2);

        let result = engine
            .execute_sql("SELECT (SELECT MAX(gpa) FROM students)")
            .unwrap();
        assert_eq!(
            result.rows[0].get(0),
            Some(&Value::Decimal { raw: 390, scale: 2 })
        );
    }

    #[test]
    fn test_use_and_create_database() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine.execute_sql("CREATE DATABASE school").unwrap();
        engine.execute_sql("USE school").unwrap();
        // Fresh database: no tables.
        let tables = engine.execute_sql("SHOW TABLES").unwrap();
        assert_eq!(tables.rows.len(), 0);
        // Original database still has its data.
        engine.execute_sql("USE main").unwrap();
        let tables = engine.execute_sql("SHOW TABLES").unwrap();
        assert_eq!(tables.rows.len(), 1);
    }

    #[test]
    fn test_order_by_limit_like() {
        let (_dir, mut engine) = test_engine();
        setup_students(&mut engine);
        engine
            .execute_sql(
                "INSERT INTO students VALUES \
                 (1, 'Alice', 3.9, 1), (2, 'Aaron', 3.1, 1), (3, 'Bob', 3.5, 1)",
            )
            .unwrap();

        let result = engine
            .execute_sql(
                "SELECT name FROM students WHERE name LIKE 'A%' ORDER BY name DESC LIMIT 1",
            )
            .unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Str("Alice".into())));

        let result = engine
            .execute_sql("SELECT name FROM students LIMIT 0")
            .unwrap();
        assert_eq!(result.rows.len(), 0);
    }
}
