//! Physical plan selection
//!
//! Turns the logical plan into a physical operator tree:
//! - a Filter over a Scan becomes an IndexScan when the predicate constrains
//!   the leading column(s) of an index, with the unconsumed conjuncts left
//!   as a residual filter;
//! - filters over inner joins push down to the side they reference;
//! - joins with an equi-key become hash joins, the build side chosen by
//!   catalog statistics (defaulting to the right child);
//! - a Sort is dropped when an index scan already delivers the order.

use std::fmt::Write as _;

use crate::catalog::{Catalog, DataType, IndexDef};
use crate::error::{Error, Result};
use crate::executor::eval;
use crate::executor::planner::LogicalPlan;
use crate::sql::ast::{BinaryOperator, Expr, JoinType, OrderByItem, SelectItem};
use crate::storage::{IndexKey, Value};
use std::sync::Arc;

/// Physical plan node
#[derive(Debug, Clone)]
pub enum PhysicalPlan {
    SeqScan {
        table: String,
        alias: Option<String>,
    },
    IndexScan {
        table: String,
        alias: Option<String>,
        index_name: String,
        /// Key columns of the index, leading first (order information).
        key_columns: Vec<String>,
        low: Option<(IndexKey, bool)>,
        high: Option<(IndexKey, bool)>,
    },
    Alias {
        input: Box<PhysicalPlan>,
        name: String,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<PhysicalPlan>,
        items: Vec<SelectItem>,
        distinct: bool,
    },
    NestedLoopJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        join_type: JoinType,
        condition: Option<Expr>,
    },
    HashJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        join_type: JoinType,
        left_key: Expr,
        right_key: Expr,
        build_left: bool,
    },
    HashAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<Expr>,
        having: Option<Expr>,
    },
    Sort {
        input: Box<PhysicalPlan>,
        order_by: Vec<OrderByItem>,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
}

/// Heuristic physical planner
pub struct Optimizer<'a> {
    catalog: &'a Catalog,
}

impl<'a> Optimizer<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn optimize(&self, plan: &LogicalPlan) -> Result<PhysicalPlan> {
        match plan {
            LogicalPlan::Scan { table, alias } => Ok(PhysicalPlan::SeqScan {
                table: table.clone(),
                alias: alias.clone(),
            }),

            LogicalPlan::Alias { input, name } => Ok(PhysicalPlan::Alias {
                input: Box::new(self.optimize(input)?),
                name: name.clone(),
            }),

            LogicalPlan::Filter { input, predicate } => self.optimize_filter(input, predicate),

            LogicalPlan::Project {
                input,
                items,
                distinct,
            } => Ok(PhysicalPlan::Project {
                input: Box::new(self.optimize(input)?),
                items: items.clone(),
                distinct: *distinct,
            }),

            LogicalPlan::Join {
                left,
                right,
                join_type,
                condition,
            } => self.optimize_join(left, right, *join_type, condition.as_ref()),

            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                having,
            } => Ok(PhysicalPlan::HashAggregate {
                input: Box::new(self.optimize(input)?),
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
                having: having.clone(),
            }),

            LogicalPlan::Sort { input, order_by } => {
                let input = self.optimize(input)?;
                if sort_satisfied_by_index(&input, order_by) {
                    return Ok(input);
                }
                Ok(PhysicalPlan::Sort {
                    input: Box::new(input),
                    order_by: order_by.clone(),
                })
            }

            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => {
                let limit = limit.as_ref().map(|e| const_u64(e, "LIMIT")).transpose()?;
                let offset = offset
                    .as_ref()
                    .map(|e| const_u64(e, "OFFSET"))
                    .transpose()?
                    .unwrap_or(0);
                Ok(PhysicalPlan::Limit {
                    input: Box::new(self.optimize(input)?),
                    limit,
                    offset,
                })
            }
        }
    }

    /// Filter: push conjuncts into the sides of an inner join, and turn a
    /// filtered scan into an index scan where possible.
    fn optimize_filter(&self, input: &LogicalPlan, predicate: &Expr) -> Result<PhysicalPlan> {
        // Pushdown below an inner join.
        if let LogicalPlan::Join {
            left,
            right,
            join_type: JoinType::Inner,
            condition,
        } = input
        {
            let left_cols = self.logical_columns(left)?;
            let right_cols = self.logical_columns(right)?;
            let mut left_push = Vec::new();
            let mut right_push = Vec::new();
            let mut keep = Vec::new();
            for conjunct in split_conjuncts(predicate) {
                if refs_resolve(&conjunct, &left_cols) {
                    left_push.push(conjunct);
                } else if refs_resolve(&conjunct, &right_cols) {
                    right_push.push(conjunct);
                } else {
                    keep.push(conjunct);
                }
            }
            if !left_push.is_empty() || !right_push.is_empty() {
                let wrap = |side: &LogicalPlan, conjuncts: Vec<Expr>| match join_conjuncts(
                    conjuncts,
                ) {
                    Some(predicate) => LogicalPlan::Filter {
                        input: Box::new(side.clone()),
                        predicate,
                    },
                    None => side.clone(),
                };
                let pushed = LogicalPlan::Join {
                    left: Box::new(wrap(left, left_push)),
                    right: Box::new(wrap(right, right_push)),
                    join_type: JoinType::Inner,
                    condition: condition.clone(),
                };
                return match join_conjuncts(keep) {
                    Some(residual) => Ok(PhysicalPlan::Filter {
                        input: Box::new(self.optimize(&pushed)?),
                        predicate: residual,
                    }),
                    None => self.optimize(&pushed),
                };
            }
        }

        // Index selection on a base-table scan.
        if let LogicalPlan::Scan { table, alias } = input {
            if !table.is_empty() {
                if let Some(plan) = self.try_index_scan(table, alias.as_deref(), predicate)? {
                    return Ok(plan);
                }
            }
        }

        Ok(PhysicalPlan::Filter {
            input: Box::new(self.optimize(input)?),
            predicate: predicate.clone(),
        })
    }

    /// Try to satisfy part of `predicate` with an index on `table`.
    fn try_index_scan(
        &self,
        table: &str,
        alias: Option<&str>,
        predicate: &Expr,
    ) -> Result<Option<PhysicalPlan>> {
        let table_def = self.catalog.get_table(table)?;
        let conjuncts = split_conjuncts(predicate);

        struct Candidate {
            index: Arc<IndexDef>,
            eq_cols: usize,
            has_range: bool,
            low: Option<(IndexKey, bool)>,
            high: Option<(IndexKey, bool)>,
            consumed: Vec<usize>,
        }

        let mut best: Option<Candidate> = None;
        for index in self.catalog.get_table_indexes(table) {
            // Fold an equality prefix, then at most one range column.
            let mut prefix: Vec<Value> = Vec::new();
            let mut consumed: Vec<usize> = Vec::new();
            let mut low: Option<(Vec<Value>, bool)> = None;
            let mut high: Option<(Vec<Value>, bool)> = None;
            let mut has_range = false;

            for col in &index.columns {
                let col_type = &table_def.get_column(col).expect("indexed column").data_type;
                let mut eq_here = None;
                let mut range_here: Vec<(usize, BinaryOperator, Value)> = Vec::new();
                for (i, conjunct) in conjuncts.iter().enumerate() {
                    if consumed.contains(&i) {
                        continue;
                    }
                    if let Some((op, lit)) = sargable(conjunct, table, alias, col) {
                        let value = match eval::literal_to_value(&lit)
                            .and_then(|v| v.coerce_to(col_type, col))
                        {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if op == BinaryOperator::Eq {
                            eq_here = Some((i, value));
                            break;
                        }
                        range_here.push((i, op, value));
                    }
                }

                if let Some((i, value)) = eq_here {
                    prefix.push(value);
                    consumed.push(i);
                    continue;
                }
                // No equality on this column: a trailing range closes the key.
                for (i, op, value) in range_here {
                    let mut key = prefix.clone();
                    key.push(value);
                    match op {
                        BinaryOperator::Gt => low = tighten_low(low, key, false),
                        BinaryOperator::Gte => low = tighten_low(low, key, true),
                        BinaryOperator::Lt => high = tighten_high(high, key, false),
                        BinaryOperator::Lte => high = tighten_high(high, key, true),
                        _ => continue,
                    }
                    consumed.push(i);
                    has_range = true;
                }
                break;
            }

            let eq_cols = prefix.len();
            if eq_cols == 0 && !has_range {
                continue;
            }
            // An equality prefix bounds the range on both sides.
            if !prefix.is_empty() {
                if low.is_none() {
                    low = Some((prefix.clone(), true));
                }
                if high.is_none() {
                    high = Some((prefix.clone(), true));
                }
            }
            let candidate = Candidate {
                index: index.clone(),
                eq_cols,
                has_range,
                low: low.map(|(k, inc)| (IndexKey::composite(k), inc)),
                high: high.map(|(k, inc)| (IndexKey::composite(k), inc)),
                consumed,
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    // Unique first, then longer equality prefix, then name.
                    (
                        candidate.index.unique,
                        candidate.eq_cols,
                        candidate.has_range,
                        std::cmp::Reverse(candidate.index.name.clone()),
                    ) > (
                        current.index.unique,
                        current.eq_cols,
                        current.has_range,
                        std::cmp::Reverse(current.index.name.clone()),
                    )
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let best = match best {
            Some(c) => c,
            None => return Ok(None),
        };

        let residual: Vec<Expr> = conjuncts
            .iter()
            .enumerate()
            .filter(|(i, _)| !best.consumed.contains(i))
            .map(|(_, c)| c.clone())
            .collect();

        let scan = PhysicalPlan::IndexScan {
            table: table.to_string(),
            alias: alias.map(|a| a.to_string()),
            index_name: best.index.name.clone(),
            key_columns: best.index.columns.clone(),
            low: best.low,
            high: best.high,
        };
        Ok(Some(match join_conjuncts(residual) {
            Some(predicate) => PhysicalPlan::Filter {
                input: Box::new(scan),
                predicate,
            },
            None => scan,
        }))
    }

    fn optimize_join(
        &self,
        left: &LogicalPlan,
        right: &LogicalPlan,
        join_type: JoinType,
        condition: Option<&Expr>,
    ) -> Result<PhysicalPlan> {
        let left_phys = self.optimize(left)?;
        let right_phys = self.optimize(right)?;

        let condition = match condition {
            Some(c) if join_type != JoinType::Cross => c,
            _ => {
                return Ok(PhysicalPlan::NestedLoopJoin {
                    left: Box::new(left_phys),
                    right: Box::new(right_phys),
                    join_type,
                    condition: condition.cloned(),
                })
            }
        };

        let left_fields = self.logical_fields(left)?;
        let right_fields = self.logical_fields(right)?;
        let conjuncts = split_conjuncts(condition);

        let equi = conjuncts.iter().position(|c| {
            equi_keys(c, &left_fields, &right_fields).is_some()
        });

        let equi_idx = match equi {
            Some(i) => i,
            None => {
                return Ok(PhysicalPlan::NestedLoopJoin {
                    left: Box::new(left_phys),
                    right: Box::new(right_phys),
                    join_type,
                    condition: Some(condition.clone()),
                })
            }
        };

        let residual: Vec<Expr> = conjuncts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != equi_idx)
            .map(|(_, c)| c.clone())
            .collect();

        // For outer joins a residual above the join would change semantics;
        // fall back to a nested loop evaluating the whole condition.
        if join_type != JoinType::Inner && !residual.is_empty() {
            return Ok(PhysicalPlan::NestedLoopJoin {
                left: Box::new(left_phys),
                right: Box::new(right_phys),
                join_type,
                condition: Some(condition.clone()),
            });
        }

        let (left_key, right_key) =
            equi_keys(&conjuncts[equi_idx], &left_fields, &right_fields).expect("checked above");

        // Build on the smaller side when statistics say so; default right.
        let build_left = match (self.estimate_rows(left), self.estimate_rows(right)) {
            (Some(l), Some(r)) => l < r,
            _ => false,
        };

        let join = PhysicalPlan::HashJoin {
            left: Box::new(left_phys),
            right: Box::new(right_phys),
            join_type,
            left_key,
            right_key,
            build_left,
        };
        Ok(match join_conjuncts(residual) {
            Some(predicate) => PhysicalPlan::Filter {
                input: Box::new(join),
                predicate,
            },
            None => join,
        })
    }

    /// Estimated row count of a logical subtree, from ANALYZE statistics.
    fn estimate_rows(&self, plan: &LogicalPlan) -> Option<usize> {
        match plan {
            LogicalPlan::Scan { table, .. } => self
                .catalog
                .get_table(table)
                .ok()
                .and_then(|t| t.stats.as_ref().map(|s| s.row_count)),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Alias { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => self.estimate_rows(input),
            LogicalPlan::Join { left, right, .. } => {
                Some(self.estimate_rows(left)? * self.estimate_rows(right)?)
            }
            LogicalPlan::Aggregate { input, .. } => self.estimate_rows(input),
        }
    }

    /// Output column names of a logical subtree (qualified where a source
    /// name or alias is known).
    pub fn logical_columns(&self, plan: &LogicalPlan) -> Result<Vec<String>> {
        Ok(self
            .logical_fields(plan)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// Output columns of a logical subtree with their types, where a type is
    /// still derivable (base-table columns and plain column projections;
    /// computed expressions and aggregate results carry None).
    pub fn logical_fields(&self, plan: &LogicalPlan) -> Result<Vec<(String, Option<DataType>)>> {
        match plan {
            LogicalPlan::Scan { table, alias } => {
                if table.is_empty() {
                    return Ok(Vec::new());
                }
                let def = self.catalog.get_table(table)?;
                let qualifier = alias.clone().unwrap_or_else(|| table.clone());
                Ok(def
                    .schema()
                    .columns()
                    .iter()
                    .map(|c| {
                        (
                            format!("{}.{}", qualifier, c.name),
                            Some(c.data_type.clone()),
                        )
                    })
                    .collect())
            }
            LogicalPlan::Alias { input, name } => Ok(self
                .logical_fields(input)?
                .into_iter()
                .map(|(c, ty)| {
                    let bare = c.rsplit('.').next().unwrap_or(c.as_str()).to_string();
                    (format!("{}.{}", name, bare), ty)
                })
                .collect()),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => self.logical_fields(input),
            LogicalPlan::Join { left, right, .. } => {
                let mut fields = self.logical_fields(left)?;
                fields.extend(self.logical_fields(right)?);
                Ok(fields)
            }
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => {
                let mut fields: Vec<(String, Option<DataType>)> = group_by
                    .iter()
                    .chain(aggregates.iter())
                    .map(|e| (e.to_string(), None))
                    .collect();
                fields.extend(self.logical_fields(input)?);
                Ok(fields)
            }
            LogicalPlan::Project { input, items, .. } => {
                let input_fields = self.logical_fields(input)?;
                let input_names: Vec<String> =
                    input_fields.iter().map(|(n, _)| n.clone()).collect();
                let mut fields = Vec::new();
                for item in items {
                    match item {
                        SelectItem::Wildcard => fields.extend(input_fields.clone()),
                        SelectItem::QualifiedWildcard(t) => {
                            let prefix = format!("{}.", t);
                            fields.extend(
                                input_fields
                                    .iter()
                                    .filter(|(c, _)| c.starts_with(&prefix))
                                    .cloned(),
                            );
                        }
                        SelectItem::Expr { expr, alias } => {
                            let name =
                                alias.clone().unwrap_or_else(|| expr.to_string());
                            let ty = match expr {
                                Expr::Column(c) => eval::resolve_column(
                                    &input_names,
                                    c.table.as_deref(),
                                    &c.column,
                                )
                                .ok()
                                .and_then(|idx| input_fields[idx].1.clone()),
                                _ => None,
                            };
                            fields.push((name, ty));
                        }
                    }
                }
                Ok(fields)
            }
        }
    }
}

fn tighten_low(
    current: Option<(Vec<Value>, bool)>,
    key: Vec<Value>,
    inclusive: bool,
) -> Option<(Vec<Value>, bool)> {
    match current {
        None => Some((key, inclusive)),
        Some((cur, cur_inc)) => {
            let cur_key = IndexKey::composite(cur.clone());
            let new_key = IndexKey::composite(key.clone());
            match new_key.compare(&cur_key) {
                std::cmp::Ordering::Greater => Some((key, inclusive)),
                std::cmp::Ordering::Equal if !inclusive => Some((key, false)),
                _ => Some((cur, cur_inc)),
            }
        }
    }
}

fn tighten_high(
    current: Option<(Vec<Value>, bool)>,
    key: Vec<Value>,
    inclusive: bool,
) -> Option<(Vec<Value>, bool)> {
    match current {
        None => Some((key, inclusive)),
        Some((cur, cur_inc)) => {
            let cur_key = IndexKey::composite(cur.clone());
            let new_key = IndexKey::composite(key.clone());
            match new_key.compare(&cur_key) {
                std::cmp::Ordering::Less => Some((key, inclusive)),
                std::cmp::Ordering::Equal if !inclusive => Some((key, false)),
                _ => Some((cur, cur_inc)),
            }
        }
    }
}

/// Split an expression on top-level ANDs.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(inner),
        other => vec![other.clone()],
    }
}

/// Reassemble conjuncts with AND.
pub fn join_conjuncts(mut conjuncts: Vec<Expr>) -> Option<Expr> {
    let mut expr = conjuncts.pop()?;
    while let Some(next) = conjuncts.pop() {
        expr = Expr::BinaryOp {
            left: Box::new(next),
            op: BinaryOperator::And,
            right: Box::new(expr),
        };
    }
    Some(expr)
}

/// `column op literal` (or flipped) on the given table column.
fn sargable(
    expr: &Expr,
    table: &str,
    alias: Option<&str>,
    column: &str,
) -> Option<(BinaryOperator, crate::sql::ast::Literal)> {
    let (left, op, right) = match expr {
        Expr::BinaryOp { left, op, right } => (left.as_ref(), *op, right.as_ref()),
        _ => return None,
    };
    if !matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::Lt
            | BinaryOperator::Lte
            | BinaryOperator::Gt
            | BinaryOperator::Gte
    ) {
        return None;
    }

    let names_this = |col_ref: &crate::sql::ast::ColumnRef| {
        col_ref.column == column
            && match col_ref.table.as_deref() {
                None => true,
                Some(q) => q == table || Some(q) == alias,
            }
    };

    match (left, right) {
        (Expr::Column(c), Expr::Literal(lit)) if names_this(c) => Some((op, lit.clone())),
        (Expr::Literal(lit), Expr::Column(c)) if names_this(c) => {
            let flipped = match op {
                BinaryOperator::Lt => BinaryOperator::Gt,
                BinaryOperator::Lte => BinaryOperator::Gte,
                BinaryOperator::Gt => BinaryOperator::Lt,
                BinaryOperator::Gte => BinaryOperator::Lte,
                other => other,
            };
            Some((flipped, lit.clone()))
        }
        _ => None,
    }
}

/// Does every column reference in `expr` resolve against `columns`?
fn refs_resolve(expr: &Expr, columns: &[String]) -> bool {
    let mut refs = Vec::new();
    collect_column_refs(expr, &mut refs);
    refs.iter().all(|c| {
        eval::resolve_column(columns, c.table.as_deref(), &c.column).is_ok()
    })
}

fn collect_column_refs(expr: &Expr, out: &mut Vec<crate::sql::ast::ColumnRef>) {
    match expr {
        Expr::Column(c) => out.push(c.clone()),
        Expr::BinaryOp { left, right, .. } => {
            collect_column_refs(left, out);
            collect_column_refs(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => collect_column_refs(expr, out),
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_column_refs(expr, out);
            collect_column_refs(low, out);
            collect_column_refs(high, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_column_refs(expr, out);
            for item in list {
                collect_column_refs(item, out);
            }
        }
        Expr::Like { expr, pattern, .. } => {
            collect_column_refs(expr, out);
            collect_column_refs(pattern, out);
        }
        Expr::Function { args, .. } => {
            for arg in args {
                collect_column_refs(arg, out);
            }
        }
        Expr::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            if let Some(op) = operand {
                collect_column_refs(op, out);
            }
            for (w, t) in when_clauses {
                collect_column_refs(w, out);
                collect_column_refs(t, out);
            }
            if let Some(e) = else_clause {
                collect_column_refs(e, out);
            }
        }
        _ => {}
    }
}

/// `left.col = right.col` with the sides resolving to different inputs and
/// carrying compatible column types. Hashing incomparable types (INT against
/// VARCHAR, say) would silently match nothing, so such conjuncts stay with
/// the nested loop join.
fn equi_keys(
    expr: &Expr,
    left_fields: &[(String, Option<DataType>)],
    right_fields: &[(String, Option<DataType>)],
) -> Option<(Expr, Expr)> {
    let (lhs, rhs) = match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => (left.as_ref(), right.as_ref()),
        _ => return None,
    };
    if !matches!(lhs, Expr::Column(_)) || !matches!(rhs, Expr::Column(_)) {
        return None;
    }

    // Resolve a column expression against one side, yielding its type slot.
    let resolve = |fields: &[(String, Option<DataType>)],
                   e: &Expr|
     -> Option<Option<DataType>> {
        let names: Vec<String> = fields.iter().map(|(n, _)| n.clone()).collect();
        match e {
            Expr::Column(c) => eval::resolve_column(&names, c.table.as_deref(), &c.column)
                .ok()
                .map(|idx| fields[idx].1.clone()),
            _ => None,
        }
    };

    let (left_key, right_key, left_type, right_type) =
        match (resolve(left_fields, lhs), resolve(right_fields, rhs)) {
            (Some(lt), Some(rt)) => (lhs, rhs, lt, rt),
            _ => match (resolve(left_fields, rhs), resolve(right_fields, lhs)) {
                (Some(lt), Some(rt)) => (rhs, lhs, lt, rt),
                _ => return None,
            },
        };

    // Unknown types (computed columns) are accepted; known but incompatible
    // ones are not.
    if let (Some(a), Some(b)) = (&left_type, &right_type) {
        if !a.is_comparable_with(b) {
            return None;
        }
    }
    Some((left_key.clone(), right_key.clone()))
}

/// Is the requested order already produced by an index scan under the plan?
fn sort_satisfied_by_index(plan: &PhysicalPlan, order_by: &[OrderByItem]) -> bool {
    if order_by.len() != 1 || !order_by[0].ascending {
        return false;
    }
    let column = match &order_by[0].expr {
        Expr::Column(c) => &c.column,
        _ => return false,
    };
    index_scan_leading_column(plan)
        .map(|leading| leading == *column)
        .unwrap_or(false)
}

/// The leading sorted column delivered by the subtree: walks through
/// order-preserving nodes down to an index scan.
fn index_scan_leading_column(plan: &PhysicalPlan) -> Option<String> {
    match plan {
        PhysicalPlan::IndexScan { key_columns, .. } => key_columns.first().cloned(),
        PhysicalPlan::Alias { input, .. } | PhysicalPlan::Filter { input, .. } => {
            index_scan_leading_column(input)
        }
        // A wildcard projection keeps the column and the order.
        PhysicalPlan::Project { input, items, .. }
            if items.iter().all(|i| matches!(i, SelectItem::Wildcard)) =>
        {
            index_scan_leading_column(input)
        }
        _ => None,
    }
}

/// Render a physical plan for EXPLAIN.
pub fn explain(plan: &PhysicalPlan) -> String {
    let mut out = String::new();
    render(plan, 0, &mut out);
    out
}

fn render(plan: &PhysicalPlan, depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    match plan {
        PhysicalPlan::SeqScan { table, alias } => {
            let _ = writeln!(out, "{}SeqScan on {}{}", pad, table, alias_suffix(alias));
        }
        PhysicalPlan::IndexScan {
            table,
            alias,
            index_name,
            low,
            high,
            ..
        } => {
            let _ = writeln!(
                out,
                "{}IndexScan on {}{} using {} [{}]",
                pad,
                table,
                alias_suffix(alias),
                index_name,
                render_bounds(low, high)
            );
        }
        PhysicalPlan::Alias { input, name } => {
            let _ = writeln!(out, "{}Alias {}", pad, name);
            render(input, depth + 1, out);
        }
        PhysicalPlan::Filter { input, predicate } => {
            let _ = writeln!(out, "{}Filter [{}]", pad, predicate);
            render(input, depth + 1, out);
        }
        PhysicalPlan::Project { input, items, distinct } => {
            let rendered: Vec<String> = items
                .iter()
                .map(|item| match item {
                    SelectItem::Wildcard => "*".to_string(),
                    SelectItem::QualifiedWildcard(t) => format!("{}.*", t),
                    SelectItem::Expr { expr, alias } => match alias {
                        Some(a) => format!("{} AS {}", expr, a),
                        None => expr.to_string(),
                    },
                })
                .collect();
            let _ = writeln!(
                out,
                "{}Project{} [{}]",
                pad,
                if *distinct { " DISTINCT" } else { "" },
                rendered.join(", ")
            );
            render(input, depth + 1, out);
        }
        PhysicalPlan::NestedLoopJoin {
            left,
            right,
            join_type,
            condition,
        } => {
            let _ = writeln!(
                out,
                "{}NestedLoopJoin ({:?}){}",
                pad,
                join_type,
                condition
                    .as_ref()
                    .map(|c| format!(" [{}]", c))
                    .unwrap_or_default()
            );
            render(left, depth + 1, out);
            render(right, depth + 1, out);
        }
        PhysicalPlan::HashJoin {
            left,
            right,
            join_type,
            left_key,
            right_key,
            build_left,
        } => {
            let _ = writeln!(
                out,
                "{}HashJoin ({:?}) [{} = {}] build={}",
                pad,
                join_type,
                left_key,
                right_key,
                if *build_left { "left" } else { "right" }
            );
            render(left, depth + 1, out);
            render(right, depth + 1, out);
        }
        PhysicalPlan::HashAggregate {
            input,
            group_by,
            aggregates,
            ..
        } => {
            let groups: Vec<String> = group_by.iter().map(|e| e.to_string()).collect();
            let aggs: Vec<String> = aggregates.iter().map(|e| e.to_string()).collect();
            let _ = writeln!(
                out,
                "{}HashAggregate group=[{}] aggs=[{}]",
                pad,
                groups.join(", "),
                aggs.join(", ")
            );
            render(input, depth + 1, out);
        }
        PhysicalPlan::Sort { input, order_by } => {
            let keys: Vec<String> = order_by
                .iter()
                .map(|o| {
                    format!("{} {}", o.expr, if o.ascending { "ASC" } else { "DESC" })
                })
                .collect();
            let _ = writeln!(out, "{}Sort [{}]", pad, keys.join(", "));
            render(input, depth + 1, out);
        }
        PhysicalPlan::Limit {
            input,
            limit,
            offset,
        } => {
            let _ = writeln!(
                out,
                "{}Limit {}{}",
                pad,
                limit.map(|l| l.to_string()).unwrap_or_else(|| "ALL".into()),
                if *offset > 0 {
                    format!(" OFFSET {}", offset)
                } else {
                    String::new()
                }
            );
            render(input, depth + 1, out);
        }
    }
}

fn alias_suffix(alias: &Option<String>) -> String {
    alias
        .as_ref()
        .map(|a| format!(" {}", a))
        .unwrap_or_default()
}

fn render_bounds(low: &Option<(IndexKey, bool)>, high: &Option<(IndexKey, bool)>) -> String {
    let fmt = |key: &IndexKey| -> String {
        key.0
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match (low, high) {
        (Some((l, _)), Some((h, _))) if l == h => format!("= ({})", fmt(l)),
        (Some((l, li)), Some((h, hi))) => format!(
            "{} ({}) .. {} ({})",
            if *li { ">=" } else { ">" },
            fmt(l),
            if *hi { "<=" } else { "<" },
            fmt(h)
        ),
        (Some((l, li)), None) => format!("{} ({})", if *li { ">=" } else { ">" }, fmt(l)),
        (None, Some((h, hi))) => format!("{} ({})", if *hi { "<=" } else { "<" }, fmt(h)),
        (None, None) => "full".to_string(),
    }
}

fn const_u64(expr: &Expr, what: &str) -> Result<u64> {
    let value = eval::evaluate(expr, &[], &[])?;
    value
        .as_i64()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| Error::SemanticError(format!("{} must be a non-negative integer", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog::table_def;
    use crate::catalog::{Column, DataType, Schema, TableStatistics};
    use crate::executor::planner::Planner;
    use crate::sql::ast::Statement;
    use crate::sql::Parser;

    fn school_catalog() -> Catalog {
        let catalog = Catalog::new();

        let mut students = Schema::new();
        students.add_column(Column::new("student_id", DataType::Int, 0).primary_key(true));
        students.add_column(Column::new("name", DataType::Varchar(100), 1));
        students.add_column(Column::new("dept_id", DataType::Int, 2));
        catalog.create_table(table_def("students", students)).unwrap();
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
            .create_index(
                "idx_students_dept",
                "students",
                vec!["dept_id".to_string()],
                false,
                false,
            )
            .unwrap();

        let mut departments = Schema::new();
        departments.add_column(Column::new("dept_id", DataType::Int, 0).primary_key(true));
        departments.add_column(Column::new("dept_name", DataType::Varchar(100), 1));
        catalog
            .create_table(table_def("departments", departments))
            .unwrap();
        catalog
    }

    fn physical(catalog: &Catalog, sql: &str) -> PhysicalPlan {
        let stmt = Parser::new(sql).unwrap().parse().unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => panic!("expected SELECT"),
        };
        let logical = Planner::new(catalog).plan_select(&select).unwrap();
        Optimizer::new(catalog).optimize(&logical).unwrap()
    }

    fn find_index_scan(plan: &PhysicalPlan) -> Option<&PhysicalPlan> {
        match plan {
            PhysicalPlan::IndexScan { .. } => Some(plan),
            PhysicalPlan::Alias { input, .. }
            | PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::HashAggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. } => find_index_scan(input),
            PhysicalPlan::NestedLoopJoin { left, right, .. }
            | PhysicalPlan::HashJoin { left, right, .. } => {
                find_index_scan(left).or_else(|| find_index_scan(right))
            }
            PhysicalPlan::SeqScan { .. } => None,
        }
    }

    #[test]
    fn test_point_predicate_uses_unique_index() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM students WHERE student_id = 60",
        );
        let scan = find_index_scan(&plan).expect("index scan selected");
        match scan {
            PhysicalPlan::IndexScan {
                index_name,
                low,
                high,
                ..
            } => {
                assert_eq!(index_name, "pk_students");
                assert_eq!(low, high);
                assert!(low.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_range_predicate_uses_index_with_residual() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM students WHERE student_id > 10 AND name LIKE 'A%'",
        );
        // LIKE stays as a residual filter above the scan.
        match &plan {
            PhysicalPlan::Project { input, .. } => match input.as_ref() {
                PhysicalPlan::Filter { input, predicate } => {
                    assert!(predicate.to_string().contains("LIKE"));
                    assert!(matches!(input.as_ref(), PhysicalPlan::IndexScan { .. }));
                }
                other => panic!("expected residual Filter, got {:?}", other),
            },
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_unique_index_beats_non_unique() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM students WHERE dept_id = 3 AND student_id = 60",
        );
        match find_index_scan(&plan).expect("index scan") {
            PhysicalPlan::IndexScan { index_name, .. } => {
                assert_eq!(index_name, "pk_students");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_no_index_means_seq_scan() {
        let catalog = school_catalog();
        let plan = physical(&catalog, "SELECT * FROM students WHERE name = 'Ada'");
        assert!(find_index_scan(&plan).is_none());
        assert!(explain(&plan).contains("SeqScan"));
    }

    #[test]
    fn test_equi_join_becomes_hash_join() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM departments d LEFT JOIN students s ON d.dept_id = s.dept_id",
        );
        let rendered = explain(&plan);
        assert!(rendered.contains("HashJoin"), "{}", rendered);
    }

    #[test]
    fn test_non_equi_join_stays_nested_loop() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM departments d JOIN students s ON s.student_id > d.dept_id",
        );
        assert!(explain(&plan).contains("NestedLoopJoin"));
    }

    #[test]
    fn test_incompatible_equi_key_stays_nested_loop() {
        let catalog = school_catalog();
        // INT = VARCHAR: equality between incomparable column types must not
        // become a hash join.
        let plan = physical(
            &catalog,
            "SELECT * FROM students s JOIN departments d ON s.student_id = d.dept_name",
        );
        let rendered = explain(&plan);
        assert!(rendered.contains("NestedLoopJoin"), "{}", rendered);
        assert!(!rendered.contains("HashJoin"), "{}", rendered);
    }

    #[test]
    fn test_compatible_numeric_equi_key_still_hashes() {
        let catalog = school_catalog();
        // INT = INT across tables keeps the hash join.
        let plan = physical(
            &catalog,
            "SELECT * FROM students s JOIN departments d ON s.dept_id = d.dept_id",
        );
        assert!(explain(&plan).contains("HashJoin"));
    }

    #[test]
    fn test_build_side_follows_statistics() {
        let catalog = school_catalog();
        catalog
            .update_table_stats("departments", TableStatistics { row_count: 5 })
            .unwrap();
        catalog
            .update_table_stats("students", TableStatistics { row_count: 5000 })
            .unwrap();
        let plan = physical(
            &catalog,
            "SELECT * FROM departments d JOIN students s ON d.dept_id = s.dept_id",
        );
        let rendered = explain(&plan);
        assert!(rendered.contains("build=left"), "{}", rendered);
    }

    #[test]
    fn test_filter_pushdown_through_inner_join() {
        let catalog = school_catalog();
        let plan = physical(
            &catalog,
            "SELECT * FROM departments d JOIN students s ON d.dept_id = s.dept_id \
             WHERE s.student_id = 7",
        );
        // The pushed-down predicate reaches the students side and finds the
        // primary key index.
        match find_index_scan(&plan).expect("pushed predicate uses index") {
            PhysicalPlan::IndexScan { table, .. } => assert_eq!(table, "students"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_limit_constants_folded() {
        let catalog = school_catalog();
        let plan = physical(&catalog, "SELECT * FROM students LIMIT 2 + 3 OFFSET 1");
        match plan {
            PhysicalPlan::Limit { limit, offset, .. } => {
                assert_eq!(limit, Some(5));
                assert_eq!(offset, 1);
            }
            other => panic!("expected Limit, got {:?}", other),
        }
    }
}
