//! Expression evaluator
//!
//! Evaluates AST expressions against a row of tagged values. Columns resolve
//! by qualified or bare name; expressions whose rendered form matches an
//! output column name short-circuit to that column, which is how aggregate
//! results flow from HashAggregate into projections, HAVING and ORDER BY.
//!
//! Subqueries must be materialized into literals by the engine before
//! evaluation; an unresolved subquery here is a semantic error.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::sql::ast::{BinaryOperator, Expr, Literal, UnaryOperator};
use crate::storage::Value;

/// Resolve a column reference against an output column list.
/// Qualified names match exactly; bare names match a bare column or a
/// unique ".column" suffix.
pub fn resolve_column(columns: &[String], table: Option<&str>, name: &str) -> Result<usize> {
    if let Some(table) = table {
        let qualified = format!("{}.{}", table, name);
        if let Some(idx) = columns.iter().position(|c| *c == qualified) {
            return Ok(idx);
        }
        return Err(Error::ColumnNotFound(qualified, String::new()));
    }

    if let Some(idx) = columns.iter().position(|c| c == name) {
        return Ok(idx);
    }
    let suffix = format!(".{}", name);
    let mut matches = columns.iter().enumerate().filter(|(_, c)| c.ends_with(&suffix));
    match (matches.next(), matches.next()) {
        (Some((idx, _)), None) => Ok(idx),
        (Some(_), Some(_)) => Err(Error::SemanticError(format!(
            "column reference '{}' is ambiguous",
            name
        ))),
        _ => Err(Error::ColumnNotFound(name.to_string(), String::new())),
    }
}

/// Convert a literal to a runtime value.
pub fn literal_to_value(lit: &Literal) -> Result<Value> {
    Ok(match lit {
        Literal::Null => Value::Null,
        Literal::Boolean(b) => Value::Bool(*b),
        Literal::Integer(i) => {
            if let Ok(small) = i32::try_from(*i) {
                Value::Int(small)
            } else {
                Value::BigInt(*i)
            }
        }
        Literal::Decimal(text) => parse_decimal(text)?,
        Literal::String(s) => Value::Str(s.clone()),
    })
}

/// Parse a textual decimal literal into a scaled value.
pub fn parse_decimal(text: &str) -> Result<Value> {
    let bad = || Error::ParseError(format!("invalid decimal literal '{}'", text));
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i, f),
        None => (text, ""),
    };
    if frac_part.len() > 18 {
        return Err(bad());
    }
    let negative = int_part.starts_with('-');
    let digits: String = format!(
        "{}{}",
        int_part.trim_start_matches(['-', '+']),
        frac_part
    );
    let raw: i64 = digits.parse().map_err(|_| bad())?;
    Ok(Value::Decimal {
        raw: if negative { -raw } else { raw },
        scale: frac_part.len() as u8,
    })
}

/// Convert a runtime value back into a literal (subquery materialization).
pub fn value_to_literal(value: &Value) -> Literal {
    match value {
        Value::Null => Literal::Null,
        Value::Bool(b) => Literal::Boolean(*b),
        Value::Int(i) => Literal::Integer(*i as i64),
        Value::BigInt(i) => Literal::Integer(*i),
        Value::Decimal { .. } => Literal::Decimal(value.to_string()),
        Value::Str(s) => Literal::String(s.clone()),
        Value::Date(_) => Literal::String(value.to_string()),
    }
}

/// SQL LIKE with `%` (any run) and `_` (any one character).
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Let the last % absorb one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

/// Evaluate an expression against one row.
pub fn evaluate(expr: &Expr, row: &[Value], columns: &[String]) -> Result<Value> {
    // Aggregate results surface as named columns of the aggregation output.
    if expr.contains_aggregate() {
        let rendered = expr.to_string();
        if let Some(idx) = columns.iter().position(|c| *c == rendered) {
            return Ok(row[idx].clone());
        }
    }

    match expr {
        Expr::Literal(lit) => literal_to_value(lit),

        Expr::Column(col_ref) => {
            let idx = resolve_column(columns, col_ref.table.as_deref(), &col_ref.column)?;
            row.get(idx).cloned().ok_or_else(|| {
                Error::ExecutionError(format!("column index {} out of bounds", idx))
            })
        }

        Expr::BinaryOp { left, op, right } => {
            let left = evaluate(left, row, columns)?;
            let right = evaluate(right, row, columns)?;
            evaluate_binary_op(&left, *op, &right)
        }

        Expr::UnaryOp { op, expr } => {
            let value = evaluate(expr, row, columns)?;
            evaluate_unary_op(*op, &value)
        }

        Expr::IsNull(inner) => Ok(Value::Bool(evaluate(inner, row, columns)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Value::Bool(!evaluate(inner, row, columns)?.is_null())),

        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let value = evaluate(expr, row, columns)?;
            let low = evaluate(low, row, columns)?;
            let high = evaluate(high, row, columns)?;
            if value.is_null() || low.is_null() || high.is_null() {
                return Ok(Value::Null);
            }
            let inside = value.compare(&low) != Some(Ordering::Less)
                && value.compare(&high) != Some(Ordering::Greater);
            Ok(Value::Bool(inside != *negated))
        }

        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let value = evaluate(expr, row, columns)?;
            if value.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let item = evaluate(item, row, columns)?;
                if item.is_null() {
                    saw_null = true;
                    continue;
                }
                if value.compare(&item) == Some(Ordering::Equal) {
                    return Ok(Value::Bool(!*negated));
                }
            }
            if saw_null {
                // Unknown membership.
                return Ok(Value::Null);
            }
            Ok(Value::Bool(*negated))
        }

        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let value = evaluate(expr, row, columns)?;
            let pattern = evaluate(pattern, row, columns)?;
            match (&value, &pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Str(s), Value::Str(p)) => Ok(Value::Bool(like_match(s, p) != *negated)),
                _ => Err(Error::TypeMismatch {
                    from: value.type_name().to_string(),
                    to: "STRING".to_string(),
                }),
            }
        }

        Expr::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            let operand_value = operand
                .as_deref()
                .map(|e| evaluate(e, row, columns))
                .transpose()?;
            for (when, then) in when_clauses {
                let hit = match &operand_value {
                    Some(op_val) => {
                        let when_val = evaluate(when, row, columns)?;
                        op_val.compare(&when_val) == Some(Ordering::Equal)
                    }
                    None => evaluate(when, row, columns)?.as_bool().unwrap_or(false),
                };
                if hit {
                    return evaluate(then, row, columns);
                }
            }
            match else_clause {
                Some(e) => evaluate(e, row, columns),
                None => Ok(Value::Null),
            }
        }

        Expr::Nested(inner) => evaluate(inner, row, columns),

        Expr::Function { name, args, .. } => evaluate_function(name, args, row, columns),

        Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists(_) => Err(
            Error::SemanticError("subquery was not materialized before evaluation".to_string()),
        ),
    }
}

fn evaluate_binary_op(left: &Value, op: BinaryOperator, right: &Value) -> Result<Value> {
    use BinaryOperator::*;

    match op {
        Eq | Neq | Lt | Gt | Lte | Gte => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let cmp = left.compare(right).ok_or_else(|| Error::TypeMismatch {
                from: left.type_name().to_string(),
                to: right.type_name().to_string(),
            })?;
            let result = match op {
                Eq => cmp == Ordering::Equal,
                Neq => cmp != Ordering::Equal,
                Lt => cmp == Ordering::Less,
                Gt => cmp == Ordering::Greater,
                Lte => cmp != Ordering::Greater,
                Gte => cmp != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        // Three-valued AND/OR.
        And => Ok(match (left.as_bool(), right.as_bool()) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        }),
        Or => Ok(match (left.as_bool(), right.as_bool()) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        }),

        Add => left.add(right).ok_or_else(|| type_error(left, right)),
        Sub => left.sub(right).ok_or_else(|| type_error(left, right)),
        Mul => left.mul(right).ok_or_else(|| type_error(left, right)),
        Div => {
            if !left.is_null() && !right.is_null() && is_zero(right) {
                return Err(Error::DivisionByZero);
            }
            left.div(right).ok_or_else(|| type_error(left, right))
        }
        Mod => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            _ => {
                let (a, b) = (
                    left.as_i64().ok_or_else(|| type_error(left, right))?,
                    right.as_i64().ok_or_else(|| type_error(left, right))?,
                );
                if b == 0 {
                    return Err(Error::DivisionByZero);
                }
                Ok(Value::BigInt(a % b))
            }
        },
        Concat => match (left, right) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            _ => Ok(Value::Str(format!("{}{}", left, right))),
        },
    }
}

fn is_zero(value: &Value) -> bool {
    matches!(
        value,
        Value::Int(0) | Value::BigInt(0) | Value::Decimal { raw: 0, .. }
    )
}

fn type_error(left: &Value, right: &Value) -> Error {
    Error::TypeMismatch {
        from: left.type_name().to_string(),
        to: right.type_name().to_string(),
    }
}

fn evaluate_unary_op(op: UnaryOperator, value: &Value) -> Result<Value> {
    match op {
        UnaryOperator::Not => match value.as_bool() {
            Some(b) => Ok(Value::Bool(!b)),
            None if value.is_null() => Ok(Value::Null),
            None => Err(Error::TypeMismatch {
                from: value.type_name().to_string(),
                to: "BOOL".to_string(),
            }),
        },
        UnaryOperator::Minus => match value {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => Ok(Value::Int(-i)),
            Value::BigInt(i) => Ok(Value::BigInt(-i)),
            Value::Decimal { raw, scale } => Ok(Value::Decimal {
                raw: -raw,
                scale: *scale,
            }),
            _ => Err(Error::TypeMismatch {
                from: value.type_name().to_string(),
                to: "numeric".to_string(),
            }),
        },
        UnaryOperator::Plus => Ok(value.clone()),
    }
}

fn evaluate_function(
    name: &str,
    args: &[Expr],
    row: &[Value],
    columns: &[String],
) -> Result<Value> {
    let arg = |i: usize| -> Result<Value> {
        args.get(i)
            .map(|e| evaluate(e, row, columns))
            .unwrap_or(Ok(Value::Null))
    };

    match name.to_uppercase().as_str() {
        "UPPER" => match arg(0)? {
            Value::Str(s) => Ok(Value::Str(s.to_uppercase())),
            other => Ok(other),
        },
        "LOWER" => match arg(0)? {
            Value::Str(s) => Ok(Value::Str(s.to_lowercase())),
            other => Ok(other),
        },
        "LENGTH" => match arg(0)? {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i32)),
            Value::Null => Ok(Value::Null),
            other => Err(Error::TypeMismatch {
                from: other.type_name().to_string(),
                to: "STRING".to_string(),
            }),
        },
        "ABS" => match arg(0)? {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::BigInt(i) => Ok(Value::BigInt(i.abs())),
            Value::Decimal { raw, scale } => Ok(Value::Decimal {
                raw: raw.abs(),
                scale,
            }),
            Value::Null => Ok(Value::Null),
            other => Err(Error::TypeMismatch {
                from: other.type_name().to_string(),
                to: "numeric".to_string(),
            }),
        },
        "COALESCE" => {
            for e in args {
                let v = evaluate(e, row, columns)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" => Err(Error::SemanticError(format!(
            "aggregate function {} is not allowed here",
            name.to_uppercase()
        ))),
        other => Err(Error::ExecutionError(format!("unknown function: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::ColumnRef;
    use crate::sql::Parser;

    fn eval_str(sql: &str, row: &[Value], columns: &[String]) -> Result<Value> {
        let expr = Parser::parse_expression(sql).unwrap();
        evaluate(&expr, row, columns)
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval_str("1 + 2 * 3", &[], &[]).unwrap(), Value::Int(7));
        assert_eq!(
            eval_str("10 / 4", &[], &[]).unwrap(),
            Value::Int(2)
        );
        assert_eq!(eval_str("5 > 3", &[], &[]).unwrap(), Value::Bool(true));
        assert!(matches!(
            eval_str("1 / 0", &[], &[]),
            Err(Error::DivisionByZero)
        ));
    }

    #[test]
    fn test_column_resolution() {
        let columns = cols(&["s.id", "s.name", "d.id"]);
        let row = vec![Value::Int(1), Value::Str("Ada".into()), Value::Int(2)];

        // Qualified reference.
        assert_eq!(
            eval_str("s.id", &row, &columns).unwrap(),
            Value::Int(1)
        );
        // Unique suffix match.
        assert_eq!(
            eval_str("name", &row, &columns).unwrap(),
            Value::Str("Ada".into())
        );
        // Ambiguous bare name.
        assert!(matches!(
            eval_str("id", &row, &columns),
            Err(Error::SemanticError(_))
        ));
    }

    #[test]
    fn test_null_propagation() {
        let columns = cols(&["x"]);
        let row = vec![Value::Null];
        assert_eq!(eval_str("x = 1", &row, &columns).unwrap(), Value::Null);
        assert_eq!(eval_str("x + 1", &row, &columns).unwrap(), Value::Null);
        assert_eq!(
            eval_str("x IS NULL", &row, &columns).unwrap(),
            Value::Bool(true)
        );
        // FALSE AND NULL is FALSE, TRUE OR NULL is TRUE.
        assert_eq!(
            eval_str("1 = 2 AND x = 1", &row, &columns).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_str("1 = 1 OR x = 1", &row, &columns).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_like_patterns() {
        assert!(like_match("Alice", "A%"));
        assert!(like_match("Alice", "%ice"));
        assert!(like_match("Alice", "A_ice"));
        assert!(like_match("Alice", "%"));
        assert!(!like_match("Alice", "B%"));
        assert!(!like_match("Alice", "A_ce"));
        assert!(like_match("", "%"));
        assert!(!like_match("", "_"));
        assert!(like_match("a%b", "a%b"));
    }

    #[test]
    fn test_between_and_in() {
        assert_eq!(
            eval_str("5 BETWEEN 1 AND 10", &[], &[]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("5 NOT BETWEEN 1 AND 10", &[], &[]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_str("3 IN (1, 2, 3)", &[], &[]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("9 IN (1, NULL)", &[], &[]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_case_expression() {
        let columns = cols(&["gpa"]);
        let row = vec![Value::Decimal { raw: 380, scale: 2 }];
        let result = eval_str(
            "CASE WHEN gpa >= 3.5 THEN 'honors' ELSE 'regular' END",
            &row,
            &columns,
        )
        .unwrap();
        assert_eq!(result, Value::Str("honors".into()));
    }

    #[test]
    fn test_decimal_literal_parsing() {
        assert_eq!(
            parse_decimal("3.14").unwrap(),
            Value::Decimal { raw: 314, scale: 2 }
        );
        assert_eq!(
            parse_decimal("-0.5").unwrap(),
            Value::Decimal { raw: -5, scale: 1 }
        );
        assert!(parse_decimal("abc").is_err());
    }

    #[test]
    fn test_aggregate_column_passthrough() {
        // HashAggregate produced a column literally named COUNT(student_id).
        let columns = cols(&["dept_id", "COUNT(student_id)"]);
        let row = vec![Value::Int(1), Value::BigInt(12)];
        let expr = Expr::Function {
            name: "COUNT".to_string(),
            args: vec![Expr::Column(ColumnRef::bare("student_id"))],
            distinct: false,
        };
        assert_eq!(evaluate(&expr, &row, &columns).unwrap(), Value::BigInt(12));
    }

    #[test]
    fn test_scalar_functions() {
        assert_eq!(
            eval_str("UPPER('ada')", &[], &[]).unwrap(),
            Value::Str("ADA".into())
        );
        assert_eq!(eval_str("LENGTH('ada')", &[], &[]).unwrap(), Value::Int(3));
        assert_eq!(
            eval_str("COALESCE(NULL, 7)", &[], &[]).unwrap(),
            Value::Int(7)
        );
    }
}
