use super::common::{column_ref, identifier, integer, string_literal, ws};
use super::statement::{BinaryOp, ColumnRef, Expr, Statement, UnaryOp};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case},
    character::complete::char,
    combinator::{map, opt},
    multi::separated_list1,
    sequence::{delimited, preceded, tuple},
    IResult,
};

fn operand(input: &str) -> IResult<&str, Expr> {
    alt((
        map(char('?'), |_| Expr::Wildcard),
        map(integer, Expr::Int),
        map(string_literal, Expr::Str),
        map(column_ref, Expr::Column),
    ))(input)
}

fn comparison_op(input: &str) -> IResult<&str, BinaryOp> {
    alt((
        map(tag(">="), |_| BinaryOp::Ge),
        map(tag("<="), |_| BinaryOp::Le),
        map(tag("<>"), |_| BinaryOp::Ne),
        map(tag("!="), |_| BinaryOp::Ne),
        map(tag("="), |_| BinaryOp::Eq),
        map(tag(">"), |_| BinaryOp::Gt),
        map(tag("<"), |_| BinaryOp::Lt),
    ))(input)
}

// A parenthesised condition, a null test or a comparison
fn condition_term(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(ws(char('(')), condition, ws(char(')'))),
        map(
            tuple((
                ws(operand),
                ws(tag_no_case("IS")),
                ws(tag_no_case("NOT")),
                ws(tag_no_case("NULL")),
            )),
            |(e, _, _, _)| Expr::Unary { op: UnaryOp::IsNotNull, operand: Box::new(e) },
        ),
        map(
            tuple((ws(operand), ws(tag_no_case("IS")), ws(tag_no_case("NULL")))),
            |(e, _, _)| Expr::Unary { op: UnaryOp::IsNull, operand: Box::new(e) },
        ),
        map(
            tuple((ws(operand), ws(comparison_op), ws(operand))),
            |(left, op, right)| Expr::binary(left, op, right),
        ),
    ))(input)
}

// AND binds tighter than OR
fn condition_and(input: &str) -> IResult<&str, Expr> {
    let (input, first) = condition_term(input)?;
    let (input, rest) = opt(preceded(ws(tag_no_case("AND")), condition_and))(input)?;

    match rest {
        Some(right) => Ok((input, Expr::binary(first, BinaryOp::And, right))),
        None => Ok((input, first)),
    }
}

pub fn condition(input: &str) -> IResult<&str, Expr> {
    let (input, first) = condition_and(input)?;
    let (input, rest) = opt(preceded(ws(tag_no_case("OR")), condition))(input)?;

    match rest {
        Some(right) => Ok((input, Expr::binary(first, BinaryOp::Or, right))),
        None => Ok((input, first)),
    }
}

fn select_columns(input: &str) -> IResult<&str, Vec<ColumnRef>> {
    alt((
        map(ws(char('*')), |_| Vec::new()),
        separated_list1(ws(char(',')), ws(column_ref)),
    ))(input)
}

pub fn select(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("SELECT"))(input)?;
    let (input, distinct) = opt(ws(tag_no_case("DISTINCT")))(input)?;
    let (input, columns) = select_columns(input)?;
    let (input, _) = ws(tag_no_case("FROM"))(input)?;
    let (input, tables) = separated_list1(ws(char(',')), ws(identifier))(input)?;
    let (input, filter) = opt(preceded(ws(tag_no_case("WHERE")), condition))(input)?;
    let (input, order_by) = opt(preceded(
        tuple((ws(tag_no_case("ORDER")), ws(tag_no_case("BY")))),
        separated_list1(ws(char(',')), ws(column_ref)),
    ))(input)?;

    Ok((
        input,
        Statement::Select {
            distinct: distinct.is_some(),
            columns,
            tables,
            filter,
            order_by: order_by.unwrap_or_default(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let (_, e) = condition("a = 1 OR b = 2 AND c = 3").unwrap();
        match e {
            Expr::Binary { op: BinaryOp::Or, right, .. } => {
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn test_parentheses_and_null_tests() {
        let (rest, e) = condition("(a = 1 OR b = 2) AND c IS NOT NULL").unwrap();
        assert!(rest.is_empty());
        match e {
            Expr::Binary { left, op: BinaryOp::And, right } => {
                assert!(matches!(*left, Expr::Binary { op: BinaryOp::Or, .. }));
                assert!(matches!(*right, Expr::Unary { op: UnaryOp::IsNotNull, .. }));
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }

    #[test]
    fn test_select_parts() {
        let (rest, stmt) =
            select("SELECT DISTINCT A.x, y FROM A, B WHERE A.id = B.id ORDER BY y, A.x").unwrap();
        assert!(rest.is_empty());
        match stmt {
            Statement::Select { distinct, columns, tables, filter, order_by } => {
                assert!(distinct);
                assert_eq!(columns.len(), 2);
                assert_eq!(tables, vec!["A".to_string(), "B".to_string()]);
                assert!(filter.is_some());
                assert_eq!(order_by[1], ColumnRef::new(Some("A"), "x"));
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }
}
