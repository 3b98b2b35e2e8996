use super::{View, check_column, column_bit};
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result, Stream};
use crate::database::Database;
use crate::parser::ColumnRef;

/// 1-based index of the column `c` names in `view`.
pub(crate) fn find_column(view: &dyn View, db: &Database, c: &ColumnRef) -> Result<usize> {
    let (_, cols) = view.get_dimensions(db)?;
    let mut found = None;
    for col in 1..=cols {
        let info = view.get_column_info(db, col)?;
        if info.name != c.column {
            continue;
        }
        if let Some(table) = &c.table {
            if *table != info.table {
                continue;
            }
        }
        if found.is_some() {
            return Err(MsiError::syntax(format!("ambiguous column {c}")));
        }
        found = Some(col);
    }
    found.ok_or_else(|| MsiError::syntax(format!("unknown column {c}")))
}

/// Projection: exposes a subset of the inner view's columns, in a given order.
pub struct SelectView {
    inner: Box<dyn View>,
    columns: Vec<usize>,
}

impl SelectView {
    /// Resolves `refs` against the inner view's columns.
    pub fn new(db: &Database, inner: Box<dyn View>, refs: &[ColumnRef]) -> Result<Self> {
        let columns = refs
            .iter()
            .map(|c| find_column(inner.as_ref(), db, c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { inner, columns })
    }

    fn inner_column(&self, col: usize) -> Result<usize> {
        Ok(self.columns[check_column(col, self.columns.len())?])
    }

    /// Spreads a record laid out in projection order over the inner view's columns.
    fn expand(&self, db: &Database, rec: &Record, mask: u64) -> Result<(Record, u64)> {
        let (_, cols) = self.inner.get_dimensions(db)?;
        let mut expanded = Record::new(cols)?;
        let mut expanded_mask = 0u64;
        for (i, &col) in self.columns.iter().enumerate() {
            if mask & column_bit(i) == 0 || i + 1 > rec.field_count() {
                continue;
            }
            rec.copy_field(i + 1, &mut expanded, col)?;
            expanded_mask |= column_bit(col - 1);
        }
        Ok((expanded, expanded_mask))
    }
}

impl View for SelectView {
    fn fetch_int(&self, db: &Database, row: usize, col: usize) -> Result<u32> {
        self.inner.fetch_int(db, row, self.inner_column(col)?)
    }

    fn fetch_stream(&self, db: &Database, row: usize, col: usize) -> Result<Stream> {
        self.inner.fetch_stream(db, row, self.inner_column(col)?)
    }

    fn set_row(&mut self, db: &mut Database, row: usize, rec: &Record, mask: u64) -> Result<()> {
        let (expanded, mask) = self.expand(db, rec, mask)?;
        self.inner.set_row(db, row, &expanded, mask)
    }

    fn insert_row(&mut self, db: &mut Database, rec: &Record, temporary: bool) -> Result<()> {
        let (expanded, _) = self.expand(db, rec, u64::MAX)?;
        self.inner.insert_row(db, &expanded, temporary)
    }

    fn delete_row(&mut self, db: &mut Database, row: usize) -> Result<()> {
        self.inner.delete_row(db, row)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        self.inner.execute(db, params)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)> {
        let (rows, _) = self.inner.get_dimensions(db)?;
        Ok((rows, self.columns.len()))
    }

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo> {
        self.inner.get_column_info(db, self.inner_column(col)?)
    }
}
