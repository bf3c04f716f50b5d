//! nom grammar for guard and output expressions.
//!
//! Precedence, loosest first: `||`/`or`, `&&`/`and`, comparisons
//! (non-associative), `+ -`, `* / %`, unary `! not -`, primaries.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value, verify},
    multi::{fold_many0, many0},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};
use serde_json::{Number, Value};

use super::ast::{BinaryOp, Expr};
use crate::error::ExpressionError;

const RESERVED: [&str; 6] = ["and", "or", "not", "true", "false", "null"];

/// Parse a complete expression.
pub fn parse_expression(source: &str) -> Result<Expr, ExpressionError> {
    match all_consuming(ws(or_expr))(source) {
        Ok((_, expr)) => Ok(expr),
        Err(err) => Err(ExpressionError::Syntax {
            expression: source.to_string(),
            message: describe(err),
        }),
    }
}

fn describe(err: nom::Err<nom::error::Error<&str>>) -> String {
    match err {
        nom::Err::Error(e) | nom::Err::Failure(e) if e.input.is_empty() => {
            "unexpected end of input".to_string()
        }
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let near: String = e.input.chars().take(16).collect();
            format!("unexpected input near '{near}'")
        }
        nom::Err::Incomplete(_) => "incomplete input".to_string(),
    }
}

// =============================================================================
// HELPER PARSERS
// =============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// A reserved word not followed by an identifier character.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

// =============================================================================
// PRECEDENCE LEVELS
// =============================================================================

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(ws(alt((tag("||"), keyword("or")))), and_expr),
        move || first.clone(),
        |acc, rhs| binary(BinaryOp::Or, acc, rhs),
    )(input)
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = comparison(input)?;
    fold_many0(
        preceded(ws(alt((tag("&&"), keyword("and")))), comparison),
        move || first.clone(),
        |acc, rhs| binary(BinaryOp::And, acc, rhs),
    )(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        value(BinaryOp::Le, tag("<=")),
        value(BinaryOp::Ge, tag(">=")),
        value(BinaryOp::Eq, tag("==")),
        value(BinaryOp::Ne, tag("!=")),
        value(BinaryOp::Lt, tag("<")),
        value(BinaryOp::Gt, tag(">")),
    ))(input)
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, rest) = opt(pair(ws(comparison_op), additive))(input)?;
    let expr = match rest {
        Some((op, rhs)) => binary(op, lhs, rhs),
        None => lhs,
    };
    Ok((input, expr))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = multiplicative(input)?;
    fold_many0(
        pair(
            ws(alt((
                value(BinaryOp::Add, char('+')),
                value(BinaryOp::Sub, char('-')),
            ))),
            multiplicative,
        ),
        move || first.clone(),
        |acc, (op, rhs)| binary(op, acc, rhs),
    )(input)
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    fold_many0(
        pair(
            ws(alt((
                value(BinaryOp::Mul, char('*')),
                value(BinaryOp::Div, char('/')),
                value(BinaryOp::Rem, char('%')),
            ))),
            unary,
        ),
        move || first.clone(),
        |acc, (op, rhs)| binary(op, acc, rhs),
    )(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(alt((tag("!"), keyword("not")))), unary), |e| {
            Expr::Not(Box::new(e))
        }),
        map(preceded(ws(char('-')), unary), |e| Expr::Neg(Box::new(e))),
        primary,
    ))(input)
}

// =============================================================================
// PRIMARIES
// =============================================================================

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        number,
        string_literal,
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        path,
        delimited(char('('), or_expr, char(')')),
    )))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |text: &str| -> Result<Expr, String> {
            if text.contains('.') {
                let f: f64 = text.parse().map_err(|e| format!("{e}"))?;
                Number::from_f64(f)
                    .map(|n| Expr::Literal(Value::Number(n)))
                    .ok_or_else(|| format!("{text} is not finite"))
            } else {
                text.parse::<i64>()
                    .map(|i| Expr::Literal(Value::from(i)))
                    .map_err(|e| e.to_string())
            }
        },
    )(input)
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('"'), take_until("\""), char('"')),
            delimited(char('\''), take_until("'"), char('\'')),
        )),
        |s: &str| Expr::Literal(Value::String(s.to_string())),
    )(input)
}

fn path(input: &str) -> IResult<&str, Expr> {
    let (input, root) = verify(identifier, |s: &str| !RESERVED.contains(&s))(input)?;
    let (input, members) = many0(preceded(char('.'), identifier))(input)?;
    Ok((
        input,
        Expr::Path {
            root: root.to_string(),
            members: members.into_iter().map(str::to_string).collect(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lit(v: Value) -> Expr {
        Expr::Literal(v)
    }

    fn path_of(root: &str, members: &[&str]) -> Expr {
        Expr::Path {
            root: root.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn parses_comparison_of_paths() {
        let expr = parse_expression("foo.a > bar.b").unwrap();
        assert_eq!(
            expr,
            binary(BinaryOp::Gt, path_of("foo", &["a"]), path_of("bar", &["b"]))
        );
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let expr = parse_expression("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Add,
                lit(json!(1)),
                binary(BinaryOp::Mul, lit(json!(2)), lit(json!(3)))
            )
        );
    }

    #[test]
    fn subtraction_is_left_associative() {
        let expr = parse_expression("10 - 4 - 3").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Sub,
                binary(BinaryOp::Sub, lit(json!(10)), lit(json!(4))),
                lit(json!(3))
            )
        );
    }

    #[test]
    fn keywords_and_symbols_are_interchangeable() {
        assert_eq!(
            parse_expression("a and not b or c").unwrap(),
            parse_expression("a && !b || c").unwrap()
        );
    }

    #[test]
    fn keyword_prefix_is_still_an_identifier() {
        assert_eq!(
            parse_expression("notice.count").unwrap(),
            path_of("notice", &["count"])
        );
        assert_eq!(parse_expression("order_1").unwrap(), path_of("order_1", &[]));
    }

    #[test]
    fn literals() {
        assert_eq!(parse_expression("'ok'").unwrap(), lit(json!("ok")));
        assert_eq!(parse_expression("\"ok\"").unwrap(), lit(json!("ok")));
        assert_eq!(parse_expression("2.5").unwrap(), lit(json!(2.5)));
        assert_eq!(parse_expression(" null ").unwrap(), lit(Value::Null));
        assert_eq!(
            parse_expression("-3").unwrap(),
            Expr::Neg(Box::new(lit(json!(3))))
        );
    }

    #[test]
    fn malformed_expressions_are_syntax_errors() {
        for bad in ["", "1 +", "a >", "(a", "a < b < c", "a.", "and", "a b"] {
            assert!(
                matches!(parse_expression(bad), Err(ExpressionError::Syntax { .. })),
                "expected syntax error for {bad:?}"
            );
        }
    }
}
