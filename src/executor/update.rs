use tracing::debug;

use super::insert::merge_values;
use super::select::SelectView;
use super::where_view::WhereView;
use super::{View, leading_columns};
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result};
use crate::database::Database;
use crate::parser::{ColumnRef, Expr, Value};

/// `UPDATE table SET col = val, ... [WHERE cond]`
///
/// Parameters bind the SET wildcards first; the fields after the first
/// `n` (n = number of SET columns) bind the WHERE wildcards.
pub struct UpdateView {
    target: SelectView,
    values: Vec<Value>,
}

impl UpdateView {
    pub fn new(db: &mut Database, table: &str, assignments: &[(String, Value)], filter: Option<&Expr>) -> Result<Self> {
        let inner = WhereView::new(db, &[table.to_string()], filter)?;
        let refs: Vec<ColumnRef> = assignments.iter().map(|(c, _)| ColumnRef::new(None, c)).collect();
        let target = SelectView::new(db, Box::new(inner), &refs)?;
        Ok(Self {
            target,
            values: assignments.iter().map(|(_, v)| v.clone()).collect(),
        })
    }
}

impl View for UpdateView {
    fn fetch_int(&self, _db: &Database, _row: usize, _col: usize) -> Result<u32> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        let set_count = self.values.len();
        let where_params = match params {
            Some(p) if p.field_count() > set_count => {
                let mut rec = Record::new(p.field_count() - set_count)?;
                for i in 1..=rec.field_count() {
                    p.copy_field(set_count + i, &mut rec, i)?;
                }
                Some(rec)
            }
            _ => None,
        };
        let values = merge_values(&self.values, params, 1)?;

        self.target.execute(db, where_params.as_ref())?;
        let (rows, _) = self.target.get_dimensions(db)?;
        let mask = leading_columns(set_count);
        for row in 0..rows {
            self.target.set_row(db, row, &values, mask)?;
        }
        debug!(rows, "update executed");
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
