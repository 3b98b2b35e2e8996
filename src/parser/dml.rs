use super::common::{identifier, value, ws};
use super::queries::condition;
use super::statement::Statement;
use nom::{
    bytes::complete::tag_no_case,
    character::complete::char,
    combinator::opt,
    multi::separated_list1,
    sequence::{delimited, preceded, tuple},
    IResult,
};

pub fn insert(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("INSERT"))(input)?;
    let (input, _) = ws(tag_no_case("INTO"))(input)?;
    let (input, table) = ws(identifier)(input)?;
    let (input, columns) = delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), ws(identifier)),
        ws(char(')')),
    )(input)?;
    let (input, _) = ws(tag_no_case("VALUES"))(input)?;
    let (input, values) = delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), ws(value)),
        ws(char(')')),
    )(input)?;
    let (input, temporary) = opt(ws(tag_no_case("TEMPORARY")))(input)?;

    Ok((
        input,
        Statement::Insert {
            table,
            columns,
            values,
            temporary: temporary.is_some(),
        },
    ))
}

pub fn update(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("UPDATE"))(input)?;
    let (input, table) = ws(identifier)(input)?;
    let (input, _) = ws(tag_no_case("SET"))(input)?;
    let (input, assignments) = separated_list1(
        ws(char(',')),
        tuple((ws(identifier), ws(char('=')), ws(value))),
    )(input)?;
    let assignments = assignments
        .into_iter()
        .map(|(col, _, val)| (col, val))
        .collect();
    let (input, filter) = opt(preceded(ws(tag_no_case("WHERE")), condition))(input)?;

    Ok((
        input,
        Statement::Update {
            table,
            assignments,
            filter,
        },
    ))
}

pub fn delete(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("DELETE"))(input)?;
    let (input, _) = ws(tag_no_case("FROM"))(input)?;
    let (input, table) = ws(identifier)(input)?;
    let (input, filter) = opt(preceded(ws(tag_no_case("WHERE")), condition))(input)?;

    Ok((input, Statement::Delete { table, filter }))
}
