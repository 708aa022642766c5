//! Physical operators
//!
//! Pull-based (volcano) iterators: every operator exposes `open`, `next` and
//! `close`. Operators own cheap storage handles (heap files, index trees)
//! rather than borrowing the engine, so a suspended tree - a cursor - can
//! outlive the statement that built it.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::executor::eval;
use crate::executor::optimizer::PhysicalPlan;
use crate::sql::ast::{Expr, JoinType, OrderByItem, SelectItem};
use crate::storage::btree::BTreeRangeIter;
use crate::storage::heap::HeapScan;
use crate::storage::{BTreeIndex, HeapFile, Tuple, Value};

/// The volcano iterator contract.
pub trait Operator {
    fn open(&mut self) -> Result<()>;
    fn next(&mut self) -> Result<Option<Tuple>>;
    fn close(&mut self) -> Result<()>;
}

/// Storage handles the builder needs; implemented by the engine's database
/// context.
pub trait SourceProvider {
    fn heap(&self, table: &str) -> Result<HeapFile>;
    fn index_tree(&self, index_name: &str) -> Result<BTreeIndex>;
    /// Bare column names of a table, in schema order.
    fn table_columns(&self, table: &str) -> Result<Vec<String>>;
}

/// Build an operator tree and its output column names from a physical plan.
pub fn build(
    provider: &dyn SourceProvider,
    plan: &PhysicalPlan,
) -> Result<(Box<dyn Operator>, Vec<String>)> {
    match plan {
        PhysicalPlan::SeqScan { table, alias } => {
            if table.is_empty() {
                return Ok((Box::new(EmptyRowExec { emitted: false }), Vec::new()));
            }
            let heap = provider.heap(table)?;
            let qualifier = alias.clone().unwrap_or_else(|| table.clone());
            let columns = provider
                .table_columns(table)?
                .into_iter()
                .map(|c| format!("{}.{}", qualifier, c))
                .collect();
            Ok((Box::new(SeqScanExec { heap, iter: None }), columns))
        }

        PhysicalPlan::IndexScan {
            table,
            alias,
            index_name,
            low,
            high,
            ..
        } => {
            let heap = provider.heap(table)?;
            let tree = provider.index_tree(index_name)?;
            let qualifier = alias.clone().unwrap_or_else(|| table.clone());
            let columns = provider
                .table_columns(table)?
                .into_iter()
                .map(|c| format!("{}.{}", qualifier, c))
                .collect();
            Ok((
                Box::new(IndexScanExec {
                    heap,
                    tree,
                    low: low.clone(),
                    high: high.clone(),
                    iter: None,
                }),
                columns,
            ))
        }

        PhysicalPlan::Alias { input, name } => {
            let (child, child_cols) = build(provider, input)?;
            let columns = child_cols
                .iter()
                .map(|c| {
                    let bare = c.rsplit('.').next().unwrap_or(c);
                    format!("{}.{}", name, bare)
                })
                .collect();
            Ok((child, columns))
        }

        PhysicalPlan::Filter { input, predicate } => {
            let (child, columns) = build(provider, input)?;
            Ok((
                Box::new(FilterExec {
                    child,
                    predicate: predicate.clone(),
                    columns: columns.clone(),
                }),
                columns,
            ))
        }

        PhysicalPlan::Project {
            input,
            items,
            distinct,
        } => {
            let (child, in_columns) = build(provider, input)?;
            let mut proj_items = Vec::new();
            let mut out_columns = Vec::new();
            for item in items {
                match item {
                    SelectItem::Wildcard => {
                        for (i, name) in in_columns.iter().enumerate() {
                            proj_items.push(ProjItem::Passthrough(i));
                            out_columns.push(name.clone());
                        }
                    }
                    SelectItem::QualifiedWildcard(qualifier) => {
                        let prefix = format!("{}.", qualifier);
                        let before = out_columns.len();
                        for (i, name) in in_columns.iter().enumerate() {
                            if name.starts_with(&prefix) {
                                proj_items.push(ProjItem::Passthrough(i));
                                out_columns.push(name.clone());
                            }
                        }
                        if out_columns.len() == before {
                            return Err(Error::SemanticError(format!(
                                "unknown table or alias '{}' in select list",
                                qualifier
                            )));
                        }
                    }
                    SelectItem::Expr { expr, alias } => {
                        proj_items.push(ProjItem::Expr(expr.clone()));
                        out_columns
                            .push(alias.clone().unwrap_or_else(|| expr.to_string()));
                    }
                }
            }
            Ok((
                Box::new(ProjectExec {
                    child,
                    items: proj_items,
                    in_columns,
                    distinct: *distinct,
                    seen: HashSet::new(),
                }),
                out_columns,
            ))
        }

        PhysicalPlan::NestedLoopJoin {
            left,
            right,
            join_type,
            condition,
        } => {
            let (left_op, left_cols) = build(provider, left)?;
            let (right_op, right_cols) = build(provider, right)?;
            let mut columns = left_cols.clone();
            columns.extend(right_cols.clone());
            Ok((
                Box::new(NestedLoopJoinExec {
                    left: left_op,
                    right: right_op,
                    join_type: *join_type,
                    condition: condition.clone(),
                    columns: columns.clone(),
                    left_width: left_cols.len(),
                    right_width: right_cols.len(),
                    right_rows: Vec::new(),
                    right_matched: Vec::new(),
                    current_left: None,
                    right_pos: 0,
                    left_matched: false,
                    drain_pos: 0,
                    phase: JoinPhase::Stream,
                }),
                columns,
            ))
        }

        PhysicalPlan::HashJoin {
            left,
            right,
            join_type,
            left_key,
            right_key,
            build_left,
        } => {
            let (left_op, left_cols) = build(provider, left)?;
            let (right_op, right_cols) = build(provider, right)?;
            let mut columns = left_cols.clone();
            columns.extend(right_cols.clone());
            Ok((
                Box::new(HashJoinExec {
                    left: left_op,
                    right: right_op,
                    join_type: *join_type,
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                    build_left: *build_left,
                    left_cols,
                    right_cols,
                    columns: columns.clone(),
                    build_rows: Vec::new(),
                    build_matched: Vec::new(),
                    table: HashMap::new(),
                    pending: VecDeque::new(),
                    drain_pos: 0,
                    phase: JoinPhase::Stream,
                }),
                columns,
            ))
        }

        PhysicalPlan::HashAggregate {
            input,
            group_by,
            aggregates,
            having,
        } => {
            let (child, in_columns) = build(provider, input)?;
            // Group keys and aggregate results first, then the input columns
            // (served from a representative row per group) so select lists
            // may name columns functionally dependent on the group key.
            let out_columns: Vec<String> = group_by
                .iter()
                .chain(aggregates.iter())
                .map(|e| e.to_string())
                .chain(in_columns.iter().cloned())
                .collect();
            Ok((
                Box::new(HashAggregateExec {
                    child,
                    group_by: group_by.clone(),
                    aggregates: aggregates.clone(),
                    having: having.clone(),
                    in_columns,
                    out_columns: out_columns.clone(),
                    results: Vec::new(),
                    pos: 0,
                }),
                out_columns,
            ))
        }

        PhysicalPlan::Sort { input, order_by } => {
            let (child, columns) = build(provider, input)?;
            Ok((
                Box::new(SortExec {
                    child,
                    order_by: order_by.clone(),
                    columns: columns.clone(),
                    rows: Vec::new(),
                    pos: 0,
                }),
                columns,
            ))
        }

        PhysicalPlan::Limit {
            input,
            limit,
            offset,
        } => {
            let (child, columns) = build(provider, input)?;
            Ok((
                Box::new(LimitExec {
                    child,
                    limit: *limit,
                    offset: *offset,
                    skipped: 0,
                    returned: 0,
                }),
                columns,
            ))
        }
    }
}

/// Run an operator tree to completion, collecting every row. Pins are
/// released by `close` even on error.
pub fn drain(op: &mut dyn Operator) -> Result<Vec<Tuple>> {
    op.open()?;
    let mut rows = Vec::new();
    let outcome = loop {
        match op.next() {
            Ok(Some(tuple)) => rows.push(tuple),
            Ok(None) => break Ok(rows),
            Err(e) => break Err(e),
        }
    };
    op.close()?;
    outcome
}

// ---- scans ----

/// Full-table scan over a heap file.
pub struct SeqScanExec {
    heap: HeapFile,
    iter: Option<HeapScan>,
}

impl Operator for SeqScanExec {
    fn open(&mut self) -> Result<()> {
        self.iter = Some(self.heap.scan());
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let iter = self
            .iter
            .as_mut()
            .ok_or_else(|| Error::Internal("next before open".to_string()))?;
        match iter.next() {
            Some(Ok((_, tuple))) => Ok(Some(tuple)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.iter = None;
        Ok(())
    }
}

/// Ordered scan over a key range of a B+ tree, fetching rows from the heap.
pub struct IndexScanExec {
    heap: HeapFile,
    tree: BTreeIndex,
    low: Option<(crate::storage::IndexKey, bool)>,
    high: Option<(crate::storage::IndexKey, bool)>,
    iter: Option<BTreeRangeIter>,
}

impl Operator for IndexScanExec {
    fn open(&mut self) -> Result<()> {
        self.iter = Some(self.tree.range(self.low.clone(), self.high.clone())?);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let iter = self
            .iter
            .as_mut()
            .ok_or_else(|| Error::Internal("next before open".to_string()))?;
        match iter.next() {
            Some(Ok((_, rid))) => match self.heap.get(rid)? {
                Some(tuple) => Ok(Some(tuple)),
                None => Err(Error::Corrupted(format!(
                    "index '{}' references a missing row",
                    self.tree.name()
                ))),
            },
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.iter = None;
        Ok(())
    }
}

/// One empty row: SELECT without FROM.
struct EmptyRowExec {
    emitted: bool,
}

impl Operator for EmptyRowExec {
    fn open(&mut self) -> Result<()> {
        self.emitted = false;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        Ok(Some(Tuple::empty()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ---- filter / project ----

pub struct FilterExec {
    child: Box<dyn Operator>,
    predicate: Expr,
    columns: Vec<String>,
}

impl Operator for FilterExec {
    fn open(&mut self) -> Result<()> {
        self.child.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(tuple) = self.child.next()? {
            let keep = eval::evaluate(&self.predicate, tuple.values(), &self.columns)?
                .as_bool()
                .unwrap_or(false);
            if keep {
                return Ok(Some(tuple));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }
}

enum ProjItem {
    Passthrough(usize),
    Expr(Expr),
}

pub struct ProjectExec {
    child: Box<dyn Operator>,
    items: Vec<ProjItem>,
    in_columns: Vec<String>,
    distinct: bool,
    seen: HashSet<Vec<Value>>,
}

impl Operator for ProjectExec {
    fn open(&mut self) -> Result<()> {
        self.seen.clear();
        self.child.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(tuple) = self.child.next()? {
            let mut values = Vec::with_capacity(self.items.len());
            for item in &self.items {
                let value = match item {
                    ProjItem::Passthrough(i) => {
                        tuple.get(*i).cloned().unwrap_or(Value::Null)
                    }
                    ProjItem::Expr(expr) => {
                        eval::evaluate(expr, tuple.values(), &self.in_columns)?
                    }
                };
                values.push(value);
            }
            if self.distinct && !self.seen.insert(values.clone()) {
                continue;
            }
            return Ok(Some(Tuple::new(values)));
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }
}

// ---- joins ----

#[derive(Debug, Clone, Copy, PartialEq)]
enum JoinPhase {
    Stream,
    DrainOther,
    Done,
}

pub struct NestedLoopJoinExec {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    join_type: JoinType,
    condition: Option<Expr>,
    columns: Vec<String>,
    left_width: usize,
    right_width: usize,
    right_rows: Vec<Tuple>,
    right_matched: Vec<bool>,
    current_left: Option<Tuple>,
    right_pos: usize,
    left_matched: bool,
    drain_pos: usize,
    phase: JoinPhase,
}

impl NestedLoopJoinExec {
    fn pad(width: usize) -> Vec<Value> {
        vec![Value::Null; width]
    }

    fn preserves_left(&self) -> bool {
        matches!(self.join_type, JoinType::Left | JoinType::Full)
    }

    fn preserves_right(&self) -> bool {
        matches!(self.join_type, JoinType::Right | JoinType::Full)
    }
}

impl Operator for NestedLoopJoinExec {
    fn open(&mut self) -> Result<()> {
        self.left.open()?;
        self.right.open()?;
        // The inner input is materialized once; rescanning a volcano tree
        // would re-run it per outer row.
        self.right_rows.clear();
        while let Some(tuple) = self.right.next()? {
            self.right_rows.push(tuple);
        }
        self.right.close()?;
        self.right_matched = vec![false; self.right_rows.len()];
        self.current_left = None;
        self.right_pos = 0;
        self.left_matched = false;
        self.drain_pos = 0;
        self.phase = JoinPhase::Stream;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            match self.phase {
                JoinPhase::Stream => {
                    if self.current_left.is_none() {
                        match self.left.next()? {
                            Some(tuple) => {
                                self.current_left = Some(tuple);
                                self.right_pos = 0;
                                self.left_matched = false;
                            }
                            None => {
                                self.phase = if self.preserves_right() {
                                    JoinPhase::DrainOther
                                } else {
                                    JoinPhase::Done
                                };
                                continue;
                            }
                        }
                    }
                    let left_row = self.current_left.as_ref().expect("set above").clone();
                    while self.right_pos < self.right_rows.len() {
                        let idx = self.right_pos;
                        self.right_pos += 1;
                        let combined = left_row.concat(&self.right_rows[idx]);
                        let hit = match &self.condition {
                            Some(cond) => {
                                eval::evaluate(cond, combined.values(), &self.columns)?
                                    .as_bool()
                                    .unwrap_or(false)
                            }
                            None => true,
                        };
                        if hit {
                            self.left_matched = true;
                            self.right_matched[idx] = true;
                            return Ok(Some(combined));
                        }
                    }
                    // Inner side exhausted for this outer row.
                    let unmatched = !self.left_matched && self.preserves_left();
                    self.current_left = None;
                    if unmatched {
                        let mut values = left_row.into_values();
                        values.extend(Self::pad(self.right_width));
                        return Ok(Some(Tuple::new(values)));
                    }
                }
                JoinPhase::DrainOther => {
                    while self.drain_pos < self.right_rows.len() {
                        let idx = self.drain_pos;
                        self.drain_pos += 1;
                        if !self.right_matched[idx] {
                            let mut values = Self::pad(self.left_width);
                            values.extend(self.right_rows[idx].values().iter().cloned());
                            return Ok(Some(Tuple::new(values)));
                        }
                    }
                    self.phase = JoinPhase::Done;
                }
                JoinPhase::Done => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.left.close()?;
        self.right_rows.clear();
        self.phase = JoinPhase::Done;
        Ok(())
    }
}

pub struct HashJoinExec {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    join_type: JoinType,
    left_key: Expr,
    right_key: Expr,
    build_left: bool,
    left_cols: Vec<String>,
    right_cols: Vec<String>,
    columns: Vec<String>,
    build_rows: Vec<Tuple>,
    build_matched: Vec<bool>,
    table: HashMap<Value, Vec<usize>>,
    pending: VecDeque<Tuple>,
    drain_pos: usize,
    phase: JoinPhase,
}

impl HashJoinExec {
    fn probe_preserved(&self) -> bool {
        if self.build_left {
            matches!(self.join_type, JoinType::Right | JoinType::Full)
        } else {
            matches!(self.join_type, JoinType::Left | JoinType::Full)
        }
    }

    fn build_preserved(&self) -> bool {
        if self.build_left {
            matches!(self.join_type, JoinType::Left | JoinType::Full)
        } else {
            matches!(self.join_type, JoinType::Right | JoinType::Full)
        }
    }

    /// Combine a build row and a probe row in left-then-right column order.
    fn combine(&self, build: &Tuple, probe: &Tuple) -> Tuple {
        if self.build_left {
            build.concat(probe)
        } else {
            probe.concat(build)
        }
    }

    fn pad_probe(&self, probe: &Tuple) -> Tuple {
        let nulls = vec![Value::Null; if self.build_left {
            self.left_cols.len()
        } else {
            self.right_cols.len()
        }];
        self.combine(&Tuple::new(nulls), probe)
    }

    fn pad_build(&self, build: &Tuple) -> Tuple {
        let nulls = vec![Value::Null; if self.build_left {
            self.right_cols.len()
        } else {
            self.left_cols.len()
        }];
        self.combine(build, &Tuple::new(nulls))
    }
}

impl Operator for HashJoinExec {
    fn open(&mut self) -> Result<()> {
        self.left.open()?;
        self.right.open()?;

        let (build_op, build_key, build_cols) = if self.build_left {
            (&mut self.left, &self.left_key, &self.left_cols)
        } else {
            (&mut self.right, &self.right_key, &self.right_cols)
        };

        self.build_rows.clear();
        self.table.clear();
        while let Some(tuple) = build_op.next()? {
            let key = eval::evaluate(build_key, tuple.values(), build_cols)?;
            let idx = self.build_rows.len();
            // NULL keys never match anything.
            if !key.is_null() {
                self.table.entry(key).or_default().push(idx);
            }
            self.build_rows.push(tuple);
        }
        build_op.close()?;
        self.build_matched = vec![false; self.build_rows.len()];
        self.pending.clear();
        self.drain_pos = 0;
        self.phase = JoinPhase::Stream;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            match self.phase {
                JoinPhase::Stream => {
                    let (probe_op, probe_key, probe_cols) = if self.build_left {
                        (&mut self.right, &self.right_key, &self.right_cols)
                    } else {
                        (&mut self.left, &self.left_key, &self.left_cols)
                    };
                    let probe_row = match probe_op.next()? {
                        Some(tuple) => tuple,
                        None => {
                            self.phase = if self.build_preserved() {
                                JoinPhase::DrainOther
                            } else {
                                JoinPhase::Done
                            };
                            continue;
                        }
                    };
                    let key = eval::evaluate(probe_key, probe_row.values(), probe_cols)?;
                    let indices: Vec<usize> = if key.is_null() {
                        Vec::new()
                    } else {
                        self.table.get(&key).cloned().unwrap_or_default()
                    };
                    if indices.is_empty() {
                        if self.probe_preserved() {
                            let padded = self.pad_probe(&probe_row);
                            self.pending.push_back(padded);
                        }
                    } else {
                        for idx in indices {
                            self.build_matched[idx] = true;
                            let combined = self.combine(&self.build_rows[idx], &probe_row);
                            self.pending.push_back(combined);
                        }
                    }
                }
                JoinPhase::DrainOther => {
                    while self.drain_pos < self.build_rows.len() {
                        let idx = self.drain_pos;
                        self.drain_pos += 1;
                        if !self.build_matched[idx] {
                            return Ok(Some(self.pad_build(&self.build_rows[idx])));
                        }
                    }
                    self.phase = JoinPhase::Done;
                }
                JoinPhase::Done => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.build_left {
            self.right.close()?;
        } else {
            self.left.close()?;
        }
        self.build_rows.clear();
        self.table.clear();
        self.phase = JoinPhase::Done;
        Ok(())
    }
}

// ---- aggregation ----

#[derive(Debug, Clone, Copy, PartialEq)]
enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

struct AggState {
    func: AggFunc,
    count: i64,
    sum: Option<Value>,
    extreme: Option<Value>,
    distinct_seen: Option<HashSet<Value>>,
}

impl AggState {
    fn new(func: AggFunc, distinct: bool) -> Self {
        Self {
            func,
            count: 0,
            sum: None,
            extreme: None,
            distinct_seen: distinct.then(HashSet::new),
        }
    }

    fn update(&mut self, value: Option<Value>) -> Result<()> {
        // COUNT(*) counts rows; everything else skips NULL arguments.
        let value = match (&self.func, value) {
            (AggFunc::Count, None) => {
                self.count += 1;
                return Ok(());
            }
            (_, None) => {
                return Err(Error::SemanticError(
                    "aggregate function requires an argument".to_string(),
                ))
            }
            (_, Some(v)) if v.is_null() => return Ok(()),
            (_, Some(v)) => v,
        };

        if let Some(seen) = &mut self.distinct_seen {
            if !seen.insert(value.clone()) {
                return Ok(());
            }
        }

        self.count += 1;
        match self.func {
            AggFunc::Count => {}
            AggFunc::Sum | AggFunc::Avg => {
                self.sum = Some(match self.sum.take() {
                    None => value,
                    Some(acc) => acc.add(&value).ok_or_else(|| Error::TypeMismatch {
                        from: value.type_name().to_string(),
                        to: "numeric".to_string(),
                    })?,
                });
            }
            AggFunc::Min => {
                let replace = match &self.extreme {
                    None => true,
                    Some(cur) => value.compare(cur) == Some(std::cmp::Ordering::Less),
                };
                if replace {
                    self.extreme = Some(value);
                }
            }
            AggFunc::Max => {
                let replace = match &self.extreme {
                    None => true,
                    Some(cur) => value.compare(cur) == Some(std::cmp::Ordering::Greater),
                };
                if replace {
                    self.extreme = Some(value);
                }
            }
        }
        Ok(())
    }

    fn finalize(self) -> Value {
        match self.func {
            AggFunc::Count => Value::BigInt(self.count),
            AggFunc::Sum => self.sum.unwrap_or(Value::Null),
            AggFunc::Avg => match self.sum {
                None => Value::Null,
                Some(sum) => average(&sum, self.count),
            },
            AggFunc::Min | AggFunc::Max => self.extreme.unwrap_or(Value::Null),
        }
    }
}

/// AVG with at least 4 fractional digits.
fn average(sum: &Value, count: i64) -> Value {
    let (raw, scale) = match sum {
        Value::Int(i) => (*i as i128, 0u8),
        Value::BigInt(i) => (*i as i128, 0),
        Value::Decimal { raw, scale } => (*raw as i128, *scale),
        _ => return Value::Null,
    };
    let target = scale.max(4);
    let scaled = raw * 10i128.pow((target - scale) as u32);
    let avg = scaled / count as i128;
    match i64::try_from(avg) {
        Ok(raw) => Value::Decimal { raw, scale: target },
        Err(_) => Value::Null,
    }
}

fn agg_func(name: &str) -> Result<AggFunc> {
    match name.to_uppercase().as_str() {
        "COUNT" => Ok(AggFunc::Count),
        "SUM" => Ok(AggFunc::Sum),
        "AVG" => Ok(AggFunc::Avg),
        "MIN" => Ok(AggFunc::Min),
        "MAX" => Ok(AggFunc::Max),
        other => Err(Error::SemanticError(format!(
            "'{}' is not an aggregate function",
            other
        ))),
    }
}

pub struct HashAggregateExec {
    child: Box<dyn Operator>,
    group_by: Vec<Expr>,
    aggregates: Vec<Expr>,
    having: Option<Expr>,
    in_columns: Vec<String>,
    out_columns: Vec<String>,
    results: Vec<Tuple>,
    pos: usize,
}

impl Operator for HashAggregateExec {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;

        let mut specs = Vec::new();
        for agg in &self.aggregates {
            match agg {
                Expr::Function {
                    name,
                    args,
                    distinct,
                } => specs.push((agg_func(name)?, args.first().cloned(), *distinct)),
                other => {
                    return Err(Error::Internal(format!(
                        "non-aggregate '{}' in aggregation list",
                        other
                    )))
                }
            }
        }

        // Each group carries its aggregate states plus a representative
        // input row, so downstream expressions may reference columns that
        // are functionally dependent on the group key.
        let mut groups: HashMap<Vec<Value>, (Vec<AggState>, Tuple)> = HashMap::new();
        let mut order: Vec<Vec<Value>> = Vec::new();

        let outcome = (|| -> Result<()> {
            while let Some(tuple) = self.child.next()? {
                let mut key = Vec::with_capacity(self.group_by.len());
                for expr in &self.group_by {
                    key.push(eval::evaluate(expr, tuple.values(), &self.in_columns)?);
                }
                let (states, _) = match groups.get_mut(&key) {
                    Some(entry) => entry,
                    None => {
                        order.push(key.clone());
                        groups.entry(key.clone()).or_insert_with(|| {
                            (
                                specs
                                    .iter()
                                    .map(|(f, _, d)| AggState::new(*f, *d))
                                    .collect(),
                                tuple.clone(),
                            )
                        })
                    }
                };
                for (state, (_, arg, _)) in states.iter_mut().zip(&specs) {
                    let value = arg
                        .as_ref()
                        .map(|e| eval::evaluate(e, tuple.values(), &self.in_columns))
                        .transpose()?;
                    state.update(value)?;
                }
            }
            Ok(())
        })();
        self.child.close()?;
        outcome?;

        // A global aggregate over an empty input still yields one row.
        if groups.is_empty() && self.group_by.is_empty() {
            order.push(Vec::new());
            let empty_row = Tuple::new(vec![Value::Null; self.in_columns.len()]);
            groups.insert(
                Vec::new(),
                (
                    specs
                        .iter()
                        .map(|(f, _, d)| AggState::new(*f, *d))
                        .collect(),
                    empty_row,
                ),
            );
        }

        self.results.clear();
        for key in order {
            let (states, representative) = groups.remove(&key).expect("group exists");
            let mut values = key;
            for state in states {
                values.push(state.finalize());
            }
            values.extend(representative.into_values());
            let row = Tuple::new(values);
            if let Some(having) = &self.having {
                let keep = eval::evaluate(having, row.values(), &self.out_columns)?
                    .as_bool()
                    .unwrap_or(false);
                if !keep {
                    continue;
                }
            }
            self.results.push(row);
        }
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.pos >= self.results.len() {
            return Ok(None);
        }
        let row = self.results[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn close(&mut self) -> Result<()> {
        self.results.clear();
        Ok(())
    }
}

// ---- sort / limit ----

pub struct SortExec {
    child: Box<dyn Operator>,
    order_by: Vec<OrderByItem>,
    columns: Vec<String>,
    rows: Vec<Tuple>,
    pos: usize,
}

impl Operator for SortExec {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        let mut keyed: Vec<(Vec<Value>, Tuple)> = Vec::new();
        let outcome = (|| -> Result<()> {
            while let Some(tuple) = self.child.next()? {
                let mut key = Vec::with_capacity(self.order_by.len());
                for item in &self.order_by {
                    key.push(eval::evaluate(&item.expr, tuple.values(), &self.columns)?);
                }
                keyed.push((key, tuple));
            }
            Ok(())
        })();
        self.child.close()?;
        outcome?;

        let directions: Vec<bool> = self.order_by.iter().map(|o| o.ascending).collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for ((x, y), asc) in a.iter().zip(b.iter()).zip(&directions) {
                let ord = x.compare(y).unwrap_or(std::cmp::Ordering::Equal);
                if ord != std::cmp::Ordering::Equal {
                    return if *asc { ord } else { ord.reverse() };
                }
            }
            std::cmp::Ordering::Equal
        });
        self.rows = keyed.into_iter().map(|(_, t)| t).collect();
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let row = self.rows[self.pos].clone();
        self.pos += 1;
        Ok(Some(row))
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

pub struct LimitExec {
    child: Box<dyn Operator>,
    limit: Option<u64>,
    offset: u64,
    skipped: u64,
    returned: u64,
}

impl Operator for LimitExec {
    fn open(&mut self) -> Result<()> {
        self.skipped = 0;
        self.returned = 0;
        self.child.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if let Some(limit) = self.limit {
            if self.returned >= limit {
                return Ok(None);
            }
        }
        while self.skipped < self.offset {
            if self.child.next()?.is_none() {
                return Ok(None);
            }
            self.skipped += 1;
        }
        match self.child.next()? {
            Some(tuple) => {
                self.returned += 1;
                Ok(Some(tuple))
            }
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::{BinaryOperator, ColumnRef};

    /// Test source yielding a fixed set of rows.
    struct VecExec {
        rows: Vec<Tuple>,
        pos: usize,
    }

    impl VecExec {
        fn boxed(rows: Vec<Vec<Value>>) -> Box<dyn Operator> {
            Box::new(Self {
                rows: rows.into_iter().map(Tuple::new).collect(),
                pos: 0,
            })
        }
    }

    impl Operator for VecExec {
        fn open(&mut self) -> Result<()> {
            self.pos = 0;
            Ok(())
        }

        fn next(&mut self) -> Result<Option<Tuple>> {
            if self.pos >= self.rows.len() {
                return Ok(None);
            }
            let row = self.rows[self.pos].clone();
            self.pos += 1;
            Ok(Some(row))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn col(table: &str, name: &str) -> Expr {
        Expr::Column(ColumnRef {
            table: Some(table.to_string()),
            column: name.to_string(),
        })
    }

    fn departments() -> Box<dyn Operator> {
        VecExec::boxed(vec![
            vec![Value::Int(1), Value::Str("CS".into())],
            vec![Value::Int(2), Value::Str("Math".into())],
            vec![Value::Int(3), Value::Str("Empty".into())],
        ])
    }

    fn students() -> Box<dyn Operator> {
        VecExec::boxed(vec![
            vec![Value::Int(10), Value::Int(1)],
            vec![Value::Int(11), Value::Int(1)],
            vec![Value::Int(12), Value::Int(2)],
        ])
    }

    fn dept_cols() -> Vec<String> {
        vec!["d.dept_id".to_string(), "d.dept_name".to_string()]
    }

    fn student_cols() -> Vec<String> {
        vec!["s.student_id".to_string(), "s.dept_id".to_string()]
    }

    #[test]
    fn test_hash_join_left_outer_pads_empty_group() {
        let mut columns = dept_cols();
        columns.extend(student_cols());
        let mut join = HashJoinExec {
            left: departments(),
            right: students(),
            join_type: JoinType::Left,
            left_key: col("d", "dept_id"),
            right_key: col("s", "dept_id"),
            build_left: false,
            left_cols: dept_cols(),
            right_cols: student_cols(),
            columns,
            build_rows: Vec::new(),
            build_matched: Vec::new(),
            table: HashMap::new(),
            pending: VecDeque::new(),
            drain_pos: 0,
            phase: JoinPhase::Stream,
        };
        let rows = drain(&mut join).unwrap();
        // CS matches two students, Math one, Empty padded.
        assert_eq!(rows.len(), 4);
        let padded: Vec<&Tuple> = rows
            .iter()
            .filter(|t| t.get(2) == Some(&Value::Null))
            .collect();
        assert_eq!(padded.len(), 1);
        assert_eq!(padded[0].get(1), Some(&Value::Str("Empty".into())));
    }

    #[test]
    fn test_hash_join_build_left_same_result() {
        let mut columns = dept_cols();
        columns.extend(student_cols());
        let mut join = HashJoinExec {
            left: departments(),
            right: students(),
            join_type: JoinType::Left,
            left_key: col("d", "dept_id"),
            right_key: col("s", "dept_id"),
            build_left: true,
            left_cols: dept_cols(),
            right_cols: student_cols(),
            columns,
            build_rows: Vec::new(),
            build_matched: Vec::new(),
            table: HashMap::new(),
            pending: VecDeque::new(),
            drain_pos: 0,
            phase: JoinPhase::Stream,
        };
        let rows = drain(&mut join).unwrap();
        assert_eq!(rows.len(), 4);
        // Left columns still come first.
        assert!(rows.iter().all(|t| t.len() == 4));
        assert!(rows
            .iter()
            .any(|t| t.get(1) == Some(&Value::Str("Empty".into()))
                && t.get(2) == Some(&Value::Null)));
    }

    #[test]
    fn test_nested_loop_full_join() {
        let mut columns = dept_cols();
        columns.extend(student_cols());
        let condition = Expr::BinaryOp {
            left: Box::new(col("d", "dept_id")),
            op: BinaryOperator::Eq,
            right: Box::new(col("s", "dept_id")),
        };
        let mut join = NestedLoopJoinExec {
            left: departments(),
            right: VecExec::boxed(vec![
                vec![Value::Int(10), Value::Int(1)],
                vec![Value::Int(99), Value::Int(42)],
            ]),
            join_type: JoinType::Full,
            condition: Some(condition),
            columns,
            left_width: 2,
            right_width: 2,
            right_rows: Vec::new(),
            right_matched: Vec::new(),
            current_left: None,
            right_pos: 0,
            left_matched: false,
            drain_pos: 0,
            phase: JoinPhase::Stream,
        };
        let rows = drain(&mut join).unwrap();
        // 1 match + 2 unmatched departments + 1 unmatched student.
        assert_eq!(rows.len(), 4);
        assert!(rows
            .iter()
            .any(|t| t.get(0) == Some(&Value::Null) && t.get(2) == Some(&Value::Int(99))));
    }

    #[test]
    fn test_aggregate_counts_per_group() {
        let mut agg = HashAggregateExec {
            child: students(),
            group_by: vec![col("s", "dept_id")],
            aggregates: vec![Expr::Function {
                name: "COUNT".to_string(),
                args: vec![col("s", "student_id")],
                distinct: false,
            }],
            having: None,
            in_columns: student_cols(),
            out_columns: vec!["s.dept_id".to_string(), "COUNT(s.student_id)".to_string()],
            results: Vec::new(),
            pos: 0,
        };
        let rows = drain(&mut agg).unwrap();
        assert_eq!(rows.len(), 2);
        let cs = rows
            .iter()
            .find(|t| t.get(0) == Some(&Value::Int(1)))
            .unwrap();
        assert_eq!(cs.get(1), Some(&Value::BigInt(2)));
    }

    #[test]
    fn test_aggregate_empty_input_yields_zero_count() {
        let mut agg = HashAggregateExec {
            child: VecExec::boxed(vec![]),
            group_by: vec![],
            aggregates: vec![
                Expr::Function {
                    name: "COUNT".to_string(),
                    args: vec![],
                    distinct: false,
                },
                Expr::Function {
                    name: "SUM".to_string(),
                    args: vec![col("s", "student_id")],
                    distinct: false,
                },
            ],
            having: None,
            in_columns: student_cols(),
            out_columns: vec!["COUNT()".to_string(), "SUM(s.student_id)".to_string()],
            results: Vec::new(),
            pos: 0,
        };
        let rows = drain(&mut agg).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(0)));
        assert_eq!(rows[0].get(1), Some(&Value::Null));
    }

    #[test]
    fn test_aggregate_avg_and_nulls() {
        let child = VecExec::boxed(vec![
            vec![Value::Int(10)],
            vec![Value::Null],
            vec![Value::Int(5)],
        ]);
        let mut agg = HashAggregateExec {
            child,
            group_by: vec![],
            aggregates: vec![Expr::Function {
                name: "AVG".to_string(),
                args: vec![Expr::Column(ColumnRef::bare("x"))],
                distinct: false,
            }],
            having: None,
            in_columns: vec!["x".to_string()],
            out_columns: vec!["AVG(x)".to_string()],
            results: Vec::new(),
            pos: 0,
        };
        let rows = drain(&mut agg).unwrap();
        // NULL skipped: (10 + 5) / 2 = 7.5
        assert_eq!(
            rows[0].get(0),
            Some(&Value::Decimal {
                raw: 75000,
                scale: 4
            })
        );
    }

    #[test]
    fn test_sort_multi_key() {
        let child = VecExec::boxed(vec![
            vec![Value::Int(2), Value::Str("b".into())],
            vec![Value::Int(1), Value::Str("z".into())],
            vec![Value::Int(1), Value::Str("a".into())],
        ]);
        let mut sort = SortExec {
            child,
            order_by: vec![
                OrderByItem {
                    expr: Expr::Column(ColumnRef::bare("n")),
                    ascending: true,
                },
                OrderByItem {
                    expr: Expr::Column(ColumnRef::bare("s")),
                    ascending: false,
                },
            ],
            columns: vec!["n".to_string(), "s".to_string()],
            rows: Vec::new(),
            pos: 0,
        };
        let rows = drain(&mut sort).unwrap();
        assert_eq!(rows[0].get(1), Some(&Value::Str("z".into())));
        assert_eq!(rows[1].get(1), Some(&Value::Str("a".into())));
        assert_eq!(rows[2].get(0), Some(&Value::Int(2)));
    }

    #[test]
    fn test_limit_zero_and_offset() {
        let make = || {
            VecExec::boxed(vec![
                vec![Value::Int(1)],
                vec![Value::Int(2)],
                vec![Value::Int(3)],
            ])
        };
        let mut limit = LimitExec {
            child: make(),
            limit: Some(0),
            offset: 0,
            skipped: 0,
            returned: 0,
        };
        assert_eq!(drain(&mut limit).unwrap().len(), 0);

        let mut limit = LimitExec {
            child: make(),
            limit: Some(5),
            offset: 2,
            skipped: 0,
            returned: 0,
        };
        let rows = drain(&mut limit).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::Int(3)));
    }

    #[test]
    fn test_distinct_project() {
        let child = VecExec::boxed(vec![
            vec![Value::Int(1)],
            vec![Value::Int(1)],
            vec![Value::Int(2)],
        ]);
        let mut project = ProjectExec {
            child,
            items: vec![ProjItem::Passthrough(0)],
            in_columns: vec!["x".to_string()],
            distinct: true,
            seen: HashSet::new(),
        };
        assert_eq!(drain(&mut project).unwrap().len(), 2);
    }
}
