use super::statement::{ColumnRef, Value};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{alpha1, char, digit1, multispace0},
    combinator::{map, map_res, opt, recognize, verify},
    sequence::{delimited, pair, separated_pair},
    IResult,
};

pub fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

const KEYWORDS: &[&str] = &[
    "AND", "BY", "CREATE", "DELETE", "DISTINCT", "DROP", "FROM", "HOLD", "INSERT", "INTO", "IS",
    "KEY", "LOCALIZABLE", "NOT", "NULL", "OR", "ORDER", "PRIMARY", "SELECT", "SET", "TABLE",
    "TEMPORARY", "UPDATE", "VALUES", "WHERE",
];

fn bare_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

/// Plain or back-quoted identifier. Plain identifiers may not be keywords.
pub fn identifier(input: &str) -> IResult<&str, String> {
    alt((
        map(delimited(char('`'), take_while1(|c| c != '`'), char('`')), |s: &str| s.to_string()),
        map(
            verify(bare_identifier, |s: &str| !KEYWORDS.contains(&s.to_uppercase().as_str())),
            |s: &str| s.to_string(),
        ),
    ))(input)
}

/// `table.column` or `column`.
pub fn column_ref(input: &str) -> IResult<&str, ColumnRef> {
    alt((
        map(separated_pair(identifier, char('.'), identifier), |(t, c)| ColumnRef {
            table: Some(t),
            column: c,
        }),
        map(identifier, |c| ColumnRef { table: None, column: c }),
    ))(input)
}

pub fn integer(input: &str) -> IResult<&str, i32> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| s.parse::<i32>())(input)
}

pub fn number(input: &str) -> IResult<&str, u32> {
    map_res(digit1, |s: &str| s.parse::<u32>())(input)
}

/// `'text'`; the empty literal is allowed.
pub fn string_literal(input: &str) -> IResult<&str, String> {
    map(delimited(char('\''), take_while(|c| c != '\''), char('\'')), |s: &str| s.to_string())(input)
}

pub fn value(input: &str) -> IResult<&str, Value> {
    alt((
        map(tag_no_case("NULL"), |_| Value::Null),
        map(char('?'), |_| Value::Wildcard),
        map(integer, Value::Int),
        map(string_literal, Value::Str),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert_eq!(identifier("Feature rest"), Ok((" rest", "Feature".to_string())));
        assert_eq!(identifier("`Table`"), Ok(("", "Table".to_string())));
        assert!(identifier("WHERE").is_err());
        assert_eq!(
            column_ref("A.id"),
            Ok(("", ColumnRef::new(Some("A"), "id")))
        );
    }

    #[test]
    fn test_values() {
        assert_eq!(value("-12"), Ok(("", Value::Int(-12))));
        assert_eq!(value("''"), Ok(("", Value::Str(String::new()))));
        assert_eq!(value("?"), Ok(("", Value::Wildcard)));
        assert_eq!(value("null"), Ok(("", Value::Null)));
    }
}
