//! Query planner
//!
//! Lowers a parsed SELECT into a logical plan tree. View references in the
//! FROM clause expand to the view's stored SELECT, planned recursively.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::sql::ast::*;
use crate::sql::Parser;

/// Logical plan node (queries only; DDL and DML are dispatched directly by
/// the engine).
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// Scan a base table
    Scan {
        table: String,
        alias: Option<String>,
    },
    /// Rename the output columns' qualifier (view expansion)
    Alias {
        input: Box<LogicalPlan>,
        name: String,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<LogicalPlan>,
        items: Vec<SelectItem>,
        distinct: bool,
    },
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        join_type: JoinType,
        condition: Option<Expr>,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<Expr>,
        having: Option<Expr>,
    },
    Sort {
        input: Box<LogicalPlan>,
        order_by: Vec<OrderByItem>,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: Option<Expr>,
        offset: Option<Expr>,
    },
}

/// Query planner
pub struct Planner<'a> {
    catalog: &'a Catalog,
    /// Guards against mutually recursive view definitions.
    view_depth: usize,
}

const MAX_VIEW_DEPTH: usize = 16;

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            view_depth: 0,
        }
    }

    /// Plan a SELECT statement.
    pub fn plan_select(&mut self, select: &SelectStatement) -> Result<LogicalPlan> {
        let mut plan = match &select.from {
            Some(from) => {
                let mut left = self.plan_table_ref(&from.table)?;
                for join in &from.joins {
                    let right = self.plan_table_ref(&join.table)?;
                    left = LogicalPlan::Join {
                        left: Box::new(left),
                        right: Box::new(right),
                        join_type: join.join_type,
                        condition: join.condition.clone(),
                    };
                }
                left
            }
            // SELECT without FROM: a single empty row to project over.
            None => LogicalPlan::Scan {
                table: String::new(),
                alias: None,
            },
        };

        if let Some(predicate) = &select.where_clause {
            if predicate.contains_aggregate() {
                return Err(Error::SemanticError(
                    "aggregate functions are not allowed in WHERE".to_string(),
                ));
            }
            plan = LogicalPlan::Filter {
                input: Box::new(plan),
                predicate: predicate.clone(),
            };
        }

        // Aggregation: triggered by GROUP BY or by aggregates anywhere in the
        // select list, HAVING, or ORDER BY.
        let aggregates = collect_aggregates(select);
        if !select.group_by.is_empty() || !aggregates.is_empty() {
            plan = LogicalPlan::Aggregate {
                input: Box::new(plan),
                group_by: select.group_by.clone(),
                aggregates,
                having: select.having.clone(),
            };
        } else if select.having.is_some() {
            return Err(Error::SemanticError(
                "HAVING requires GROUP BY or aggregation".to_string(),
            ));
        }

        plan = LogicalPlan::Project {
            input: Box::new(plan),
            items: select.columns.clone(),
            distinct: select.distinct,
        };

        if !select.order_by.is_empty() {
            plan = LogicalPlan::Sort {
                input: Box::new(plan),
                order_by: select.order_by.clone(),
            };
        }

        if select.limit.is_some() || select.offset.is_some() {
            plan = LogicalPlan::Limit {
                input: Box::new(plan),
                limit: select.limit.clone(),
                offset: select.offset.clone(),
            };
        }

        Ok(plan)
    }

    /// A FROM item: a base table, or a view expanded to its stored SELECT.
    fn plan_table_ref(&mut self, table_ref: &TableRef) -> Result<LogicalPlan> {
        if let Some(view) = self.catalog.get_view(&table_ref.name) {
            if self.view_depth >= MAX_VIEW_DEPTH {
                return Err(Error::SemanticError(format!(
                    "view nesting too deep at '{}'",
                    view.name
                )));
            }
            let query = match Parser::new(&view.query)?.parse()? {
                Statement::Select(s) => s,
                _ => {
                    return Err(Error::Corrupted(format!(
                        "view '{}' does not store a SELECT",
                        view.name
                    )))
                }
            };
            self.view_depth += 1;
            let plan = self.plan_select(&query)?;
            self.view_depth -= 1;
            let name = table_ref
                .alias
                .clone()
                .unwrap_or_else(|| table_ref.name.clone());
            return Ok(LogicalPlan::Alias {
                input: Box::new(plan),
                name,
            });
        }

        // Not a view: must be a base table.
        self.catalog.get_table(&table_ref.name)?;
        Ok(LogicalPlan::Scan {
            table: table_ref.name.clone(),
            alias: table_ref.alias.clone(),
        })
    }
}

/// Collect the distinct aggregate calls appearing in the select list,
/// HAVING, and ORDER BY; these become the HashAggregate's outputs.
fn collect_aggregates(select: &SelectStatement) -> Vec<Expr> {
    let mut found = Vec::new();
    for item in &select.columns {
        if let SelectItem::Expr { expr, .. } = item {
            collect_aggregates_from(expr, &mut found);
        }
    }
    if let Some(having) = &select.having {
        collect_aggregates_from(having, &mut found);
    }
    for item in &select.order_by {
        collect_aggregates_from(&item.expr, &mut found);
    }
    found
}

fn collect_aggregates_from(expr: &Expr, found: &mut Vec<Expr>) {
    match expr {
        Expr::Function { name, args, .. } => {
            if matches!(
                name.to_uppercase().as_str(),
                "COUNT" | "SUM" | "AVG" | "MIN" | "MAX"
            ) {
                if !found.contains(expr) {
                    found.push(expr.clone());
                }
            } else {
                // A scalar function may wrap an aggregate, e.g. ABS(SUM(x)).
                for arg in args {
                    collect_aggregates_from(arg, found);
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_aggregates_from(left, found);
            collect_aggregates_from(right, found);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_aggregates_from(expr, found),
        Expr::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            if let Some(op) = operand {
                collect_aggregates_from(op, found);
            }
            for (w, t) in when_clauses {
                collect_aggregates_from(w, found);
                collect_aggregates_from(t, found);
            }
            if let Some(e) = else_clause {
                collect_aggregates_from(e, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog::table_def;
    use crate::catalog::{Column, DataType, Schema};

    fn catalog_with_students() -> Catalog {
        let catalog = Catalog::new();
        let mut schema = Schema::new();
        schema.add_column(Column::new("student_id", DataType::Int, 0).primary_key(true));
        schema.add_column(Column::new("name", DataType::Varchar(100), 1));
        catalog
            .create_table(table_def("students", schema))
            .unwrap();
        catalog
    }

    fn plan(catalog: &Catalog, sql: &str) -> Result<LogicalPlan> {
        let stmt = Parser::new(sql).unwrap().parse().unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => panic!("expected SELECT"),
        };
        Planner::new(catalog).plan_select(&select)
    }

    #[test]
    fn test_plan_shape_scan_filter_project() {
        let catalog = catalog_with_students();
        let plan = plan(&catalog, "SELECT name FROM students WHERE student_id = 1").unwrap();
        match plan {
            LogicalPlan::Project { input, .. } => match *input {
                LogicalPlan::Filter { input, .. } => {
                    assert!(matches!(*input, LogicalPlan::Scan { .. }));
                }
                other => panic!("expected Filter, got {:?}", other),
            },
            other => panic!("expected Project, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_aggregate_without_group_by() {
        let catalog = catalog_with_students();
        let plan = plan(&catalog, "SELECT COUNT(*) FROM students").unwrap();
        match plan {
            LogicalPlan::Project { input, .. } => {
                assert!(matches!(*input, LogicalPlan::Aggregate { .. }));
            }
            other => panic!("expected Project over Aggregate, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_view_expansion() {
        let catalog = catalog_with_students();
        catalog
            .create_view("all_names", "SELECT name FROM students", false)
            .unwrap();
        let plan = plan(&catalog, "SELECT * FROM all_names").unwrap();
        match plan {
            LogicalPlan::Project { input, .. } => {
                assert!(matches!(*input, LogicalPlan::Alias { .. }));
            }
            other => panic!("expected Project over Alias, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_unknown_table() {
        let catalog = catalog_with_students();
        assert!(matches!(
            plan(&catalog, "SELECT * FROM missing"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn test_aggregate_in_where_rejected() {
        let catalog = catalog_with_students();
        assert!(matches!(
            plan(&catalog, "SELECT name FROM students WHERE COUNT(*) > 1"),
            Err(Error::SemanticError(_))
        ));
    }
}
