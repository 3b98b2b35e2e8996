use tracing::debug;

use super::select::SelectView;
use super::where_view::open_table;
use super::View;
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result};
use crate::database::Database;
use crate::parser::{ColumnRef, Value};

/// Builds a record from literal values, taking `?` wildcards from
/// `params` in order starting at field `first_param`.
pub(crate) fn merge_values(values: &[Value], params: Option<&Record>, first_param: usize) -> Result<Record> {
    let mut rec = Record::new(values.len())?;
    let mut next = first_param;
    for (i, value) in values.iter().enumerate() {
        let field = i + 1;
        match value {
            Value::Null => {}
            Value::Int(v) => rec.set_int(field, *v)?,
            Value::Str(s) => rec.set_string(field, s)?,
            Value::Wildcard => {
                let params = params.ok_or(MsiError::InvalidParameter)?;
                if next > params.field_count() {
                    return Err(MsiError::InvalidParameter);
                }
                params.copy_field(next, &mut rec, field)?;
                next += 1;
            }
        }
    }
    Ok(rec)
}

/// `INSERT INTO table (cols) VALUES (vals) [TEMPORARY]`
pub struct InsertView {
    target: SelectView,
    values: Vec<Value>,
    temporary: bool,
}

impl InsertView {
    pub fn new(db: &mut Database, table: &str, columns: &[String], values: &[Value], temporary: bool) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(MsiError::syntax(format!(
                "{} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        let inner = open_table(db, table)?;
        let refs: Vec<ColumnRef> = columns.iter().map(|c| ColumnRef::new(None, c)).collect();
        let target = SelectView::new(db, inner, &refs)?;
        Ok(Self {
            target,
            values: values.to_vec(),
            temporary,
        })
    }
}

impl View for InsertView {
    fn fetch_int(&self, _db: &Database, _row: usize, _col: usize) -> Result<u32> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        let rec = merge_values(&self.values, params, 1)?;
        self.target.insert_row(db, &rec, self.temporary)?;
        debug!(temporary = self.temporary, "insert executed");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.target.close()
    }

    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)> {
        let (_, cols) = self.target.get_dimensions(db)?;
        Ok((0, cols))
    }

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo> {
        self.target.get_column_info(db, col)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;

    #[test]
    fn test_merge_values_takes_wildcards_in_order() {
        let values = [Value::Str("a".into()), Value::Wildcard, Value::Null, Value::Wildcard];
        let params = Record::from_fields(vec![Field::Int(7), Field::Str("b".into())]).unwrap();
        let rec = merge_values(&values, Some(&params), 1).unwrap();
        assert_eq!(rec.get_string(1), "a");
        assert_eq!(rec.get_int(2), 7);
        assert!(rec.is_null(3));
        assert_eq!(rec.get_string(4), "b");

        assert!(matches!(merge_values(&values, None, 1), Err(MsiError::InvalidParameter)));
    }
}
