use std::collections::HashSet;

use super::View;
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result, Stream};
use crate::database::Database;

/// Drops rows whose raw values repeat an earlier row.
pub struct DistinctView {
    inner: Box<dyn View>,
    rows: Vec<usize>,
}

impl DistinctView {
    #[must_use]
    pub fn new(inner: Box<dyn View>) -> Self {
        Self { inner, rows: Vec::new() }
    }

    fn inner_row(&self, row: usize) -> Result<usize> {
        self.rows.get(row).copied().ok_or(MsiError::NoMoreItems)
    }
}

impl View for DistinctView {
    fn fetch_int(&self, db: &Database, row: usize, col: usize) -> Result<u32> {
        self.inner.fetch_int(db, self.inner_row(row)?, col)
    }

    fn fetch_stream(&self, db: &Database, row: usize, col: usize) -> Result<Stream> {
        self.inner.fetch_stream(db, self.inner_row(row)?, col)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        self.inner.execute(db, params)?;
        let (rows, cols) = self.inner.get_dimensions(db)?;
        let mut seen = HashSet::with_capacity(rows);
        self.rows.clear();
        for row in 0..rows {
            let values = (1..=cols)
                .map(|col| self.inner.fetch_int(db, row, col))
                .collect::<Result<Vec<_>>>()?;
            if seen.insert(values) {
                self.rows.push(row);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.inner.close()
    }

    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)> {
        let (_, cols) = self.inner.get_dimensions(db)?;
        Ok((self.rows.len(), cols))
    }

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo> {
        self.inner.get_column_info(db, col)
    }
}
