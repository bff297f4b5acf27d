// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Sandboxed table script, the runtime behind `run_script` nodes.
//!
//! A script is a sequence of statements, one per line (`;` also separates
//! statements, `#` starts a comment). Statements operate on a single table
//! and nothing else; there is no filesystem, network or ambient state.
//!
//! ```text
//! derive total = price * quantity
//! filter total > 100
//! select sku, total
//! limit 50
//! ```

use nom::{
    branch::alt,
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res},
    multi::separated_list1,
    sequence::{delimited, preceded, separated_pair},
    IResult,
};

use super::parser::{expression, identifier};
use super::{eval, Expr, Scope};
use crate::table::{Column, Table};

/// One parsed script statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(Vec<String>),
    Drop(Vec<String>),
    Derive { column: String, expr: Expr },
    Filter(Expr),
    Limit(usize),
}

/// Parse a whole script into statements.
pub fn parse_script(source: &str) -> Result<Vec<Statement>, String> {
    let mut statements = Vec::new();
    for raw in source.lines().flat_map(|line| line.split(';')) {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        statements.push(parse_statement(line)?);
    }
    if statements.is_empty() {
        return Err("script contains no statements".to_string());
    }
    Ok(statements)
}

/// Run a parsed script against its input table.
pub fn run(table: &Table, statements: &[Statement]) -> Result<Table, String> {
    let mut current = table.clone();
    for statement in statements {
        current = match statement {
            Statement::Select(columns) => current.select(columns)?,
            Statement::Drop(columns) => current.drop_columns(columns),
            Statement::Derive { column, expr } => {
                let mut values = Vec::with_capacity(current.row_count());
                for row in 0..current.row_count() {
                    values.push(eval(expr, Scope::Row { table: &current, row })?);
                }
                current.with_column(Column::inferred(column.clone(), values))
            }
            Statement::Filter(expr) => {
                let mut keep = Vec::new();
                for row in 0..current.row_count() {
                    if eval(expr, Scope::Row { table: &current, row })?.truthy() {
                        keep.push(row);
                    }
                }
                current.take_rows(&keep)
            }
            Statement::Limit(n) => {
                let rows: Vec<usize> = (0..current.row_count().min(*n)).collect();
                current.take_rows(&rows)
            }
        };
    }
    Ok(current)
}

/// Parse and run in one step.
pub fn execute(table: &Table, source: &str) -> Result<Table, String> {
    let statements = parse_script(source)?;
    run(table, &statements)
}

fn parse_statement(line: &str) -> Result<Statement, String> {
    match all_consuming(delimited(multispace0, statement, multispace0))(line) {
        Ok((_, stmt)) => Ok(stmt),
        Err(_) => Err(format!("invalid script statement: '{line}'")),
    }
}

fn statement(input: &str) -> IResult<&str, Statement> {
    alt((select_stmt, drop_stmt, derive_stmt, filter_stmt, limit_stmt))(input)
}

fn select_stmt(input: &str) -> IResult<&str, Statement> {
    map(keyword_then_columns("select"), Statement::Select)(input)
}

fn drop_stmt(input: &str) -> IResult<&str, Statement> {
    map(keyword_then_columns("drop"), Statement::Drop)(input)
}

fn derive_stmt(input: &str) -> IResult<&str, Statement> {
    let (input, _) = keyword("derive")(input)?;
    let (input, (column, expr)) = preceded(
        multispace1,
        separated_pair(
            identifier,
            delimited(multispace0, char('='), multispace0),
            expression,
        ),
    )(input)?;
    Ok((
        input,
        Statement::Derive {
            column: column.to_string(),
            expr,
        },
    ))
}

fn filter_stmt(input: &str) -> IResult<&str, Statement> {
    let (input, _) = keyword("filter")(input)?;
    map(preceded(multispace1, expression), Statement::Filter)(input)
}

fn limit_stmt(input: &str) -> IResult<&str, Statement> {
    let (input, _) = keyword("limit")(input)?;
    map(
        preceded(multispace1, map_res(digit1, str::parse::<usize>)),
        Statement::Limit,
    )(input)
}

fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, ()> {
    move |input: &str| {
        let (rest, name) = identifier(input)?;
        if name == word {
            Ok((rest, ()))
        } else {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    }
}

fn keyword_then_columns(word: &'static str) -> impl Fn(&str) -> IResult<&str, Vec<String>> {
    move |input: &str| {
        let (input, _) = keyword(word)(input)?;
        let (input, names) = preceded(
            multispace1,
            separated_list1(
                delimited(multispace0, char(','), multispace0),
                identifier,
            ),
        )(input)?;
        Ok((input, names.into_iter().map(str::to_string).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::CellValue;

    fn table() -> Table {
        Table::from_rows(
            &["sku".to_string(), "price".to_string(), "quantity".to_string()],
            vec![
                vec![
                    CellValue::String("a".into()),
                    CellValue::Integer(10),
                    CellValue::Integer(3),
                ],
                vec![
                    CellValue::String("b".into()),
                    CellValue::Integer(50),
                    CellValue::Integer(4),
                ],
            ],
        )
        .unwrap()
    }

    #[test]
    fn derive_filter_select_pipeline() {
        let script = "
            derive total = price * quantity
            filter total > 100   # only the big orders
            select sku, total
        ";
        let result = execute(&table(), script).unwrap();
        assert_eq!(result.column_names(), vec!["sku", "total"]);
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.cell(0, "total"), Some(&CellValue::Integer(200)));
    }

    #[test]
    fn statements_split_on_semicolons() {
        let result = execute(&table(), "drop quantity; limit 1").unwrap();
        assert_eq!(result.column_names(), vec!["sku", "price"]);
        assert_eq!(result.row_count(), 1);
    }

    #[test]
    fn unknown_statement_is_rejected() {
        assert!(parse_script("import os").is_err());
        assert!(parse_script("").is_err());
    }

    #[test]
    fn select_missing_column_fails_at_run_time() {
        assert!(execute(&table(), "select ghost").is_err());
    }
}
