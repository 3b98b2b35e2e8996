use tracing::debug;

use super::View;
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result};
use crate::database::Database;

/// `DELETE FROM table [WHERE cond]`: removes every row the inner view
/// yields. Never produces result rows.
pub struct DeleteView {
    inner: Box<dyn View>,
}

impl DeleteView {
    #[must_use]
    pub fn new(inner: Box<dyn View>) -> Self {
        Self { inner }
    }
}

impl View for DeleteView {
    fn fetch_int(&self, _db: &Database, _row: usize, _col: usize) -> Result<u32> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        db.check_writable()?;
        self.inner.execute(db, params)?;
        let (rows, _) = self.inner.get_dimensions(db)?;
        // back to front keeps the remaining indices valid
        for row in (0..rows).rev() {
            self.inner.delete_row(db, row)?;
        }
        debug!(rows, "delete executed");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)> {
        let (_, cols) = self.inner.get_dimensions(db)?;
        Ok((0, cols))
    }

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo> {
        self.inner.get_column_info(db, col)
    }
}
