// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! nom parser for the restricted expression language.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{all_consuming, map, opt, recognize, value, verify},
    error::{Error as NomError, ErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded},
    IResult,
};

use super::{BinaryOp, Expr, UnaryOp};
use crate::table::CellValue;

/// Parse a complete expression from source text.
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    match all_consuming(delimited(multispace0, expression, multispace0))(input) {
        Ok((_, expr)) => Ok(expr),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(format!(
            "invalid expression near '{}'",
            e.input.chars().take(24).collect::<String>()
        )),
        Err(nom::Err::Incomplete(_)) => Err("incomplete expression".to_string()),
    }
}

pub(super) fn expression(input: &str) -> IResult<&str, Expr> {
    or_expr(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(or_op, and_expr))(input)?;
    Ok((input, fold_binary(first, BinaryOp::Or, rest)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input)?;
    let (input, rest) = many0(preceded(and_op, not_expr))(input)?;
    Ok((input, fold_binary(first, BinaryOp::And, rest)))
}

fn not_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(not_op, not_expr), |operand| Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }),
        comparison,
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, left) = additive(input)?;
    let (input, tail) = opt(pair(comparison_op, additive))(input)?;
    Ok((input, match tail {
        Some((op, right)) => Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        None => left,
    }))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = multiplicative(input)?;
    loop {
        let op: IResult<&str, BinaryOp> = preceded(
            multispace0,
            alt((
                value(BinaryOp::Add, char('+')),
                value(BinaryOp::Sub, char('-')),
            )),
        )(input);
        match op {
            Ok((rest, op)) => {
                let (rest, right) = multiplicative(rest)?;
                acc = Expr::Binary {
                    op,
                    left: Box::new(acc),
                    right: Box::new(right),
                };
                input = rest;
            }
            Err(_) => return Ok((input, acc)),
        }
    }
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut acc) = unary(input)?;
    loop {
        let op: IResult<&str, BinaryOp> = preceded(
            multispace0,
            alt((
                value(BinaryOp::Mul, char('*')),
                value(BinaryOp::Div, char('/')),
                value(BinaryOp::Mod, char('%')),
            )),
        )(input);
        match op {
            Ok((rest, op)) => {
                let (rest, right) = unary(rest)?;
                acc = Expr::Binary {
                    op,
                    left: Box::new(acc),
                    right: Box::new(right),
                };
                input = rest;
            }
            Err(_) => return Ok((input, acc)),
        }
    }
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(preceded(multispace0, char('-')), unary),
            |operand| Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            },
        ),
        atom,
    ))(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            number,
            string_literal,
            keyword_literal,
            call_or_column,
            delimited(char('('), expression, preceded(multispace0, char(')'))),
        )),
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)?;
    let expr = if text.contains('.') {
        match text.parse::<f64>() {
            Ok(v) => Expr::Literal(CellValue::Float(v)),
            Err(_) => return Err(nom::Err::Error(NomError::new(input, ErrorKind::Float))),
        }
    } else {
        match text.parse::<i64>() {
            Ok(v) => Expr::Literal(CellValue::Integer(v)),
            Err(_) => return Err(nom::Err::Error(NomError::new(input, ErrorKind::Digit))),
        }
    };
    Ok((rest, expr))
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    let double = delimited(
        char('"'),
        opt(escaped_transform(is_not("\\\""), '\\', escape_sequence)),
        char('"'),
    );
    let single = delimited(
        char('\''),
        opt(escaped_transform(is_not("\\'"), '\\', escape_sequence)),
        char('\''),
    );
    map(alt((double, single)), |text: Option<String>| {
        Expr::Literal(CellValue::String(text.unwrap_or_default()))
    })(input)
}

fn escape_sequence(input: &str) -> IResult<&str, &str> {
    alt((
        value("\\", char('\\')),
        value("\"", char('"')),
        value("'", char('\'')),
        value("\n", char('n')),
        value("\t", char('t')),
    ))(input)
}

fn keyword_literal(input: &str) -> IResult<&str, Expr> {
    alt((
        value(Expr::Literal(CellValue::Boolean(true)), keyword("true")),
        value(Expr::Literal(CellValue::Boolean(false)), keyword("false")),
        value(Expr::Literal(CellValue::Null), keyword("null")),
    ))(input)
}

fn call_or_column(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    let args = opt(delimited(
        preceded(multispace0, char('(')),
        separated_list0(preceded(multispace0, char(',')), expression),
        preceded(multispace0, char(')')),
    ))(rest)?;
    let (rest, args) = args;
    Ok((rest, match args {
        Some(args) => Expr::Call {
            function: name.to_string(),
            args,
        },
        None => Expr::Column(name.to_string()),
    }))
}

const KEYWORDS: &[&str] = &["and", "or", "not", "true", "false", "null"];

pub(super) fn identifier(input: &str) -> IResult<&str, &str> {
    verify(bare_identifier, |name: &str| !KEYWORDS.contains(&name))(input)
}

fn bare_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// Match a whole keyword, refusing to split an identifier.
fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, ()> {
    move |input: &str| {
        let (rest, name) = bare_identifier(input)?;
        if name == word {
            Ok((rest, ()))
        } else {
            Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag)))
        }
    }
}

fn or_op(input: &str) -> IResult<&str, ()> {
    preceded(multispace0, alt((value((), tag("||")), keyword_op("or"))))(input)
}

fn and_op(input: &str) -> IResult<&str, ()> {
    preceded(multispace0, alt((value((), tag("&&")), keyword_op("and"))))(input)
}

fn not_op(input: &str) -> IResult<&str, ()> {
    preceded(multispace0, alt((value((), char('!')), keyword_op("not"))))(input)
}

fn keyword_op(word: &'static str) -> impl Fn(&str) -> IResult<&str, ()> {
    let matcher = keyword(word);
    move |input: &str| matcher(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    preceded(
        multispace0,
        alt((
            value(BinaryOp::Eq, tag("==")),
            value(BinaryOp::Ne, tag("!=")),
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Lt, char('<')),
            value(BinaryOp::Gt, char('>')),
        )),
    )(input)
}

fn fold_binary(first: Expr, op: BinaryOp, rest: Vec<Expr>) -> Expr {
    rest.into_iter().fold(first, |left, right| Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comparison_with_column() {
        let expr = parse_expression("row_count > 10").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinaryOp::Gt,
                left: Box::new(Expr::Column("row_count".into())),
                right: Box::new(Expr::Literal(CellValue::Integer(10))),
            }
        );
    }

    #[test]
    fn parses_boolean_connectives_and_precedence() {
        // `a > 1 and b < 2 or not c` groups as ((a>1 and b<2) or (not c)).
        let expr = parse_expression("a > 1 and b < 2 or not c").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Or, left, right } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::And, .. }));
                assert!(matches!(*right, Expr::Unary { op: UnaryOp::Not, .. }));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parses_arithmetic_precedence() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn parses_calls_and_strings() {
        let expr = parse_expression("sum(amount) >= 10.5 and name != 'n/a'").unwrap();
        match expr {
            Expr::Binary { op: BinaryOp::And, left, .. } => match *left {
                Expr::Binary { left: call, .. } => {
                    assert_eq!(
                        *call,
                        Expr::Call {
                            function: "sum".into(),
                            args: vec![Expr::Column("amount".into())],
                        }
                    );
                }
                other => panic!("unexpected shape: {other:?}"),
            },
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn keywords_are_not_identifiers() {
        assert!(parse_expression("not").is_err());
        let expr = parse_expression("northern == true").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary { op: BinaryOp::Eq, .. }
        ));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse_expression("a > 1 ;; drop").is_err());
        assert!(parse_expression("(a > 1").is_err());
    }
}
