// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Interpreter for the restricted expression AST.
//!
//! Expressions evaluate against one of three scopes:
//!
//! * [`Scope::Row`] — column references resolve to the cell in the current
//!   row; reductions see the whole column.
//! * [`Scope::Table`] — only `row_count` / `column_count` and reductions
//!   over columns are available; a bare column reference is an error.
//! * [`Scope::Cell`] — a single value bound to `x`, used for element-wise
//!   function application.
//!
//! Comparison semantics follow the source system's evaluator: equality
//! treats nulls as equal, ordering comparisons involving null are false,
//! and numbers compare across integer/float.

use std::cmp::Ordering;

use super::{BinaryOp, Expr, UnaryOp};
use crate::table::{CellValue, Column, Table};

/// Evaluation scope for one expression run.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Row { table: &'a Table, row: usize },
    Table { table: &'a Table },
    Cell { value: &'a CellValue },
}

/// Evaluate an expression in the given scope.
pub fn eval(expr: &Expr, scope: Scope<'_>) -> Result<CellValue, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Column(name) => resolve_name(name, scope),
        Expr::Unary { op, operand } => {
            let value = eval(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(CellValue::Boolean(!value.truthy())),
                UnaryOp::Neg => match value {
                    CellValue::Integer(v) => Ok(CellValue::Integer(-v)),
                    CellValue::Float(v) => Ok(CellValue::Float(-v)),
                    CellValue::Null => Ok(CellValue::Null),
                    other => Err(format!("cannot negate {}", kind_name(&other))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, scope),
        Expr::Call { function, args } => eval_call(function, args, scope),
    }
}

fn resolve_name(name: &str, scope: Scope<'_>) -> Result<CellValue, String> {
    match scope {
        Scope::Row { table, row } => {
            if let Some(cell) = table.cell(row, name) {
                return Ok(cell.clone());
            }
            builtin_scalar(name, table)
                .ok_or_else(|| format!("unknown column '{name}'"))
        }
        Scope::Table { table } => builtin_scalar(name, table).ok_or_else(|| {
            format!("column '{name}' can only appear inside an aggregate here")
        }),
        Scope::Cell { value } => {
            if name == "x" {
                Ok((*value).clone())
            } else {
                Err(format!("unknown name '{name}' (only 'x' is bound)"))
            }
        }
    }
}

fn builtin_scalar(name: &str, table: &Table) -> Option<CellValue> {
    match name {
        "row_count" => Some(CellValue::Integer(table.row_count() as i64)),
        "column_count" => Some(CellValue::Integer(table.column_count() as i64)),
        _ => None,
    }
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, scope: Scope<'_>) -> Result<CellValue, String> {
    // Boolean connectives short-circuit.
    match op {
        BinaryOp::And => {
            let lhs = eval(left, scope)?;
            if !lhs.truthy() {
                return Ok(CellValue::Boolean(false));
            }
            return Ok(CellValue::Boolean(eval(right, scope)?.truthy()));
        }
        BinaryOp::Or => {
            let lhs = eval(left, scope)?;
            if lhs.truthy() {
                return Ok(CellValue::Boolean(true));
            }
            return Ok(CellValue::Boolean(eval(right, scope)?.truthy()));
        }
        _ => {}
    }

    let lhs = eval(left, scope)?;
    let rhs = eval(right, scope)?;
    match op {
        BinaryOp::Add => add_cells(&lhs, &rhs),
        BinaryOp::Sub => numeric_op(&lhs, &rhs, "-", |a, b| a - b),
        BinaryOp::Mul => numeric_op(&lhs, &rhs, "*", |a, b| a * b),
        BinaryOp::Div => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(CellValue::Float(a / b)),
            _ => Err(binop_type_error(&lhs, &rhs, "/")),
        },
        BinaryOp::Mod => match (&lhs, &rhs) {
            (CellValue::Integer(a), CellValue::Integer(b)) if *b != 0 => {
                Ok(CellValue::Integer(a.rem_euclid(*b)))
            }
            (CellValue::Integer(_), CellValue::Integer(0)) => {
                Err("modulo by zero".to_string())
            }
            _ => match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => Ok(CellValue::Float(a % b)),
                _ => Err(binop_type_error(&lhs, &rhs, "%")),
            },
        },
        BinaryOp::Eq => Ok(CellValue::Boolean(cells_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(CellValue::Boolean(!cells_equal(&lhs, &rhs))),
        BinaryOp::Lt => ordered(&lhs, &rhs, |o| o == Ordering::Less),
        BinaryOp::Le => ordered(&lhs, &rhs, |o| o != Ordering::Greater),
        BinaryOp::Gt => ordered(&lhs, &rhs, |o| o == Ordering::Greater),
        BinaryOp::Ge => ordered(&lhs, &rhs, |o| o != Ordering::Less),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn add_cells(lhs: &CellValue, rhs: &CellValue) -> Result<CellValue, String> {
    match (lhs, rhs) {
        (CellValue::String(a), CellValue::String(b)) => {
            Ok(CellValue::String(format!("{a}{b}")))
        }
        (CellValue::Integer(a), CellValue::Integer(b)) => Ok(CellValue::Integer(a + b)),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(CellValue::Float(a + b)),
            _ => Err(binop_type_error(lhs, rhs, "+")),
        },
    }
}

fn numeric_op(
    lhs: &CellValue,
    rhs: &CellValue,
    symbol: &str,
    apply: fn(f64, f64) -> f64,
) -> Result<CellValue, String> {
    match (lhs, rhs) {
        (CellValue::Integer(a), CellValue::Integer(b)) => match symbol {
            "-" => Ok(CellValue::Integer(a - b)),
            "*" => Ok(CellValue::Integer(a * b)),
            _ => Ok(CellValue::Float(apply(*a as f64, *b as f64))),
        },
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok(CellValue::Float(apply(a, b))),
            _ => Err(binop_type_error(lhs, rhs, symbol)),
        },
    }
}

fn cells_equal(lhs: &CellValue, rhs: &CellValue) -> bool {
    match (lhs, rhs) {
        (CellValue::Null, CellValue::Null) => true,
        (CellValue::Null, _) | (_, CellValue::Null) => false,
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => lhs == rhs,
        },
    }
}

fn ordered(
    lhs: &CellValue,
    rhs: &CellValue,
    accept: fn(Ordering) -> bool,
) -> Result<CellValue, String> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(CellValue::Boolean(false));
    }
    Ok(CellValue::Boolean(accept(lhs.compare(rhs))))
}

fn binop_type_error(lhs: &CellValue, rhs: &CellValue, symbol: &str) -> String {
    format!(
        "cannot apply '{symbol}' to {} and {}",
        kind_name(lhs),
        kind_name(rhs)
    )
}

fn kind_name(cell: &CellValue) -> &'static str {
    cell.data_type().map(|d| d.name()).unwrap_or("null")
}

fn eval_call(function: &str, args: &[Expr], scope: Scope<'_>) -> Result<CellValue, String> {
    match function {
        "len" => {
            let arg = single_arg(function, args)?;
            if let Some(column) = column_arg(arg, scope) {
                return Ok(CellValue::Integer(column.len() as i64));
            }
            match eval(arg, scope)? {
                CellValue::String(s) => Ok(CellValue::Integer(s.chars().count() as i64)),
                other => Err(format!("len() expects a column or string, got {}", kind_name(&other))),
            }
        }
        "sum" => {
            let column = reduction_column(function, args, scope)?;
            let mut acc = 0.0;
            let mut all_integers = true;
            for cell in column.values() {
                if cell.is_null() {
                    continue;
                }
                match cell {
                    CellValue::Integer(_) => {}
                    _ => all_integers = false,
                }
                acc += cell
                    .as_f64()
                    .ok_or_else(|| format!("sum() over non-numeric column '{}'", column.name()))?;
            }
            if all_integers {
                Ok(CellValue::Integer(acc as i64))
            } else {
                Ok(CellValue::Float(acc))
            }
        }
        "min" | "max" => {
            let column = reduction_column(function, args, scope)?;
            let mut best: Option<&CellValue> = None;
            for cell in column.values() {
                if cell.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => cell,
                    Some(current) => {
                        let keep_new = if function == "min" {
                            cell.compare(current) == Ordering::Less
                        } else {
                            cell.compare(current) == Ordering::Greater
                        };
                        if keep_new {
                            cell
                        } else {
                            current
                        }
                    }
                });
            }
            Ok(best.cloned().unwrap_or(CellValue::Null))
        }
        "any" => {
            let column = reduction_column(function, args, scope)?;
            Ok(CellValue::Boolean(column.values().iter().any(CellValue::truthy)))
        }
        "all" => {
            let column = reduction_column(function, args, scope)?;
            Ok(CellValue::Boolean(column.values().iter().all(CellValue::truthy)))
        }
        other => Err(format!("unknown function '{other}'")),
    }
}

fn single_arg<'e>(function: &str, args: &'e [Expr]) -> Result<&'e Expr, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(format!("{function}() takes exactly one argument")),
    }
}

fn column_arg<'a>(arg: &Expr, scope: Scope<'a>) -> Option<&'a Column> {
    let (Expr::Column(name), Scope::Row { table, .. } | Scope::Table { table }) = (arg, scope)
    else {
        return None;
    };
    table.column(name)
}

fn reduction_column<'a>(
    function: &str,
    args: &[Expr],
    scope: Scope<'a>,
) -> Result<&'a Column, String> {
    let arg = single_arg(function, args)?;
    match arg {
        Expr::Column(name) => column_arg(arg, scope)
            .ok_or_else(|| format!("{function}(): unknown column '{name}'")),
        _ => Err(format!("{function}() expects a column reference")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parse_expression;

    fn table() -> Table {
        Table::from_rows(
            &["amount".to_string(), "name".to_string()],
            vec![
                vec![CellValue::Integer(5), CellValue::String("a".into())],
                vec![CellValue::Integer(7), CellValue::String("b".into())],
                vec![CellValue::Null, CellValue::String("c".into())],
            ],
        )
        .unwrap()
    }

    fn run_row(src: &str, row: usize) -> CellValue {
        let table = table();
        eval(&parse_expression(src).unwrap(), Scope::Row { table: &table, row }).unwrap()
    }

    fn run_table(src: &str) -> CellValue {
        let table = table();
        eval(&parse_expression(src).unwrap(), Scope::Table { table: &table }).unwrap()
    }

    #[test]
    fn row_scope_resolves_cells() {
        assert_eq!(run_row("amount > 6", 0), CellValue::Boolean(false));
        assert_eq!(run_row("amount > 6", 1), CellValue::Boolean(true));
        assert_eq!(run_row("name == 'a'", 0), CellValue::Boolean(true));
    }

    #[test]
    fn null_comparisons_are_false() {
        assert_eq!(run_row("amount > 6", 2), CellValue::Boolean(false));
        assert_eq!(run_row("amount == null", 2), CellValue::Boolean(true));
    }

    #[test]
    fn table_scope_builtins_and_reductions() {
        assert_eq!(run_table("row_count"), CellValue::Integer(3));
        assert_eq!(run_table("sum(amount)"), CellValue::Integer(12));
        assert_eq!(run_table("min(amount)"), CellValue::Integer(5));
        assert_eq!(run_table("len(amount) == 3"), CellValue::Boolean(true));
        assert_eq!(run_table("all(name)"), CellValue::Boolean(true));
    }

    #[test]
    fn bare_column_in_table_scope_is_rejected() {
        let table = table();
        let expr = parse_expression("amount > 3").unwrap();
        assert!(eval(&expr, Scope::Table { table: &table }).is_err());
    }

    #[test]
    fn arithmetic_and_string_concat() {
        assert_eq!(run_row("amount * 2 + 1", 0), CellValue::Integer(11));
        assert_eq!(run_row("amount / 2", 0), CellValue::Float(2.5));
        assert_eq!(
            run_row("name + '!'", 1),
            CellValue::String("b!".into())
        );
    }

    #[test]
    fn cell_scope_binds_x() {
        let value = CellValue::Integer(4);
        let expr = parse_expression("x * x").unwrap();
        assert_eq!(
            eval(&expr, Scope::Cell { value: &value }).unwrap(),
            CellValue::Integer(16)
        );
    }

    #[test]
    fn unknown_function_is_an_error() {
        let table = table();
        let expr = parse_expression("open('/etc/passwd')").unwrap();
        assert!(eval(&expr, Scope::Table { table: &table }).is_err());
    }
}
