// Module declarations
mod statement;
mod common;
mod ddl;
mod dml;
mod queries;

pub use statement::{BinaryOp, ColumnDef, ColumnRef, Expr, Statement, UnaryOp, Value};

use crate::core::{MsiError, Result};
use nom::branch::alt;

/// Parses one statement of the installer SQL dialect.
pub fn parse_statement(input: &str) -> Result<Statement> {
    let input = input.trim();
    let input = input.trim_end_matches(';');

    let result = alt((
        queries::select,
        dml::insert,
        dml::update,
        dml::delete,
        ddl::create_table,
        ddl::drop_table,
    ))(input);

    match result {
        Ok((remaining, stmt)) => {
            if remaining.trim().is_empty() {
                Ok(stmt)
            } else {
                Err(MsiError::syntax(format!("unexpected input after statement: {remaining}")))
            }
        }
        Err(e) => Err(MsiError::syntax(format!("{e:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_table() {
        let sql = "CREATE TABLE `Feature` (`Feature` CHAR(38) NOT NULL, `Level` SHORT NOT NULL PRIMARY KEY `Feature`)";
        let stmt = parse_statement(sql).unwrap();
        assert!(matches!(stmt, Statement::CreateTable { .. }));
    }

    #[test]
    fn test_parse_insert() {
        let sql = "INSERT INTO `Feature` (`Feature`, `Level`) VALUES ('Main', ?) TEMPORARY";
        let stmt = parse_statement(sql).unwrap();
        match stmt {
            Statement::Insert { values, temporary, .. } => {
                assert_eq!(values, vec![Value::Str("Main".into()), Value::Wildcard]);
                assert!(temporary);
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_parse_select() {
        let stmt = parse_statement("SELECT * FROM `Property` WHERE `Property` = 'ProductCode';").unwrap();
        match stmt {
            Statement::Select { columns, filter: Some(Expr::Binary { op: BinaryOp::Eq, .. }), .. } => {
                assert!(columns.is_empty());
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_and_delete() {
        let stmt = parse_statement("UPDATE T SET a = 1, b = NULL WHERE c = ?").unwrap();
        match stmt {
            Statement::Update { assignments, filter, .. } => {
                assert_eq!(assignments[1], ("b".to_string(), Value::Null));
                assert!(filter.is_some());
            }
            other => panic!("unexpected statement {other:?}"),
        }
        assert!(matches!(
            parse_statement("DELETE FROM T").unwrap(),
            Statement::Delete { filter: None, .. }
        ));
        assert!(matches!(parse_statement("DROP TABLE T").unwrap(), Statement::DropTable { .. }));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse_statement("SELEKT * FROM T"), Err(MsiError::BadQuerySyntax(_))));
        assert!(matches!(parse_statement("SELECT * FROM T garbage"), Err(MsiError::BadQuerySyntax(_))));
        assert!(parse_statement("SELECT * FROM T WHERE a >").is_err());
    }
}
