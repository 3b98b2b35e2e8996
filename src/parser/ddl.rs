use super::common::{identifier, number, ws};
use super::statement::{ColumnDef, Statement};
use crate::core::column::{
    MSITYPE_LOCALIZABLE, MSITYPE_NULLABLE, MSITYPE_TEMPORARY, TYPE_BINARY, TYPE_LONG, TYPE_SHORT,
    type_string,
};
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::char,
    combinator::{map, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded, tuple},
    IResult,
};

#[derive(Clone, Copy)]
enum ColumnFlag {
    NotNull,
    Temporary,
    Localizable,
}

pub fn data_type(input: &str) -> IResult<&str, u32> {
    alt((
        map(
            tuple((
                alt((tag_no_case("CHARACTER"), tag_no_case("CHAR"))),
                opt(delimited(ws(char('(')), ws(number), ws(char(')')))),
            )),
            |(_, len)| type_string(len.unwrap_or(1)),
        ),
        map(tag_no_case("LONGCHAR"), |_| type_string(0)),
        map(tag_no_case("SHORT"), |_| TYPE_SHORT),
        map(tag_no_case("INTEGER"), |_| TYPE_SHORT),
        map(tag_no_case("INT"), |_| TYPE_SHORT),
        map(tag_no_case("LONG"), |_| TYPE_LONG),
        map(tag_no_case("OBJECT"), |_| TYPE_BINARY),
    ))(input)
}

fn column_flag(input: &str) -> IResult<&str, ColumnFlag> {
    alt((
        map(tuple((ws(tag_no_case("NOT")), ws(tag_no_case("NULL")))), |_| ColumnFlag::NotNull),
        map(ws(tag_no_case("TEMPORARY")), |_| ColumnFlag::Temporary),
        map(ws(tag_no_case("LOCALIZABLE")), |_| ColumnFlag::Localizable),
    ))(input)
}

fn column_def(input: &str) -> IResult<&str, ColumnDef> {
    let (input, name) = ws(identifier)(input)?;
    let (input, mut ty) = ws(data_type)(input)?;
    let (input, flags) = many0(column_flag)(input)?;

    let mut nullable = true;
    let mut temporary = false;
    for flag in flags {
        match flag {
            ColumnFlag::NotNull => nullable = false,
            ColumnFlag::Temporary => temporary = true,
            ColumnFlag::Localizable => ty |= MSITYPE_LOCALIZABLE,
        }
    }
    if nullable {
        ty |= MSITYPE_NULLABLE;
    }
    if temporary {
        ty |= MSITYPE_TEMPORARY;
    }
    Ok((input, ColumnDef { name, ty, temporary }))
}

pub fn create_table(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("CREATE"))(input)?;
    let (input, _) = ws(tag_no_case("TABLE"))(input)?;
    let (input, name) = ws(identifier)(input)?;
    let (input, _) = ws(char('('))(input)?;
    let (input, columns) = separated_list1(ws(char(',')), column_def)(input)?;
    let (input, primary_keys) = preceded(
        tuple((ws(tag_no_case("PRIMARY")), ws(tag_no_case("KEY")))),
        separated_list1(ws(char(',')), ws(identifier)),
    )(input)?;
    let (input, _) = ws(char(')'))(input)?;
    let (input, hold) = opt(ws(tag_no_case("HOLD")))(input)?;

    Ok((
        input,
        Statement::CreateTable {
            name,
            columns,
            primary_keys,
            hold: hold.is_some(),
        },
    ))
}

pub fn drop_table(input: &str) -> IResult<&str, Statement> {
    let (input, _) = ws(tag_no_case("DROP"))(input)?;
    let (input, _) = ws(tag_no_case("TABLE"))(input)?;
    let (input, name) = ws(identifier)(input)?;
    Ok((input, Statement::DropTable { name }))
}
