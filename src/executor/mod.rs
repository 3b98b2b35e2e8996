//! Executor module - the view tree a query runs on
//!
//! Every plan node implements [`View`]. Leaves read tables
//! ([`TableView`], [`StreamsView`]); inner nodes filter and join
//! ([`WhereView`]), project ([`SelectView`], [`DistinctView`]) or mutate
//! ([`InsertView`], [`UpdateView`], [`DeleteView`], [`CreateView`],
//! [`DropView`]). Views keep no reference to the database; every call
//! receives it.
//!
//! Columns are numbered from 1. Rows are numbered from 0 and are only
//! meaningful after `execute`.

pub mod conditions;
pub mod ddl;
pub mod delete;
pub mod distinct;
pub mod insert;
pub mod query;
pub mod select;
pub mod streams;
pub mod table;
pub mod update;
pub mod where_view;

pub use ddl::{CreateView, DropView};
pub use delete::DeleteView;
pub use distinct::DistinctView;
pub use insert::InsertView;
pub use query::{ColumnInfoKind, Query, build_view};
pub use select::SelectView;
pub use streams::StreamsView;
pub use table::TableView;
pub use update::UpdateView;
pub use where_view::WhereView;

use crate::core::column::{ColumnInfo, bias_decode};
use crate::core::{MsiError, Record, Result, Stream};
use crate::database::Database;

pub trait View {
    /// Raw cell value: a string id, a bias-encoded integer, or for
    /// binary columns 1 when a stream is present. 0 is NULL.
    fn fetch_int(&self, db: &Database, row: usize, col: usize) -> Result<u32>;

    fn fetch_stream(&self, _db: &Database, _row: usize, _col: usize) -> Result<Stream> {
        Err(MsiError::Unsupported)
    }

    /// Decoded row as a record of `column_count` fields.
    fn get_row(&self, db: &Database, row: usize) -> Result<Record> {
        let (rows, cols) = self.get_dimensions(db)?;
        if row >= rows {
            return Err(MsiError::NoMoreItems);
        }
        let mut rec = Record::new(cols)?;
        for col in 1..=cols {
            let info = self.get_column_info(db, col)?;
            let raw = self.fetch_int(db, row, col)?;
            if raw == 0 {
                continue;
            }
            if info.is_binary() {
                rec.set_stream(col, self.fetch_stream(db, row, col)?)?;
            } else if info.is_string() {
                let text = db.strings().lookup(raw).unwrap_or("");
                rec.set_string(col, text)?;
            } else if let Some(v) = bias_decode(raw, info.int_width()) {
                // a stored zero reads back as NULL; use raw cells to see it
                if v != 0 {
                    rec.set_int(col, v)?;
                }
            }
        }
        Ok(rec)
    }

    /// Overwrites the columns of `row` whose bit (`1 << (col - 1)`) is set in `mask`.
    fn set_row(&mut self, _db: &mut Database, _row: usize, _rec: &Record, _mask: u64) -> Result<()> {
        Err(MsiError::Unsupported)
    }

    fn insert_row(&mut self, _db: &mut Database, _rec: &Record, _temporary: bool) -> Result<()> {
        Err(MsiError::Unsupported)
    }

    fn delete_row(&mut self, _db: &mut Database, _row: usize) -> Result<()> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()>;

    /// Releases materialized rows. Calling it twice is harmless.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// `(rows, columns)`; rows are only valid after `execute`.
    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)>;

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo>;

    /// Next row at or after `*cursor` whose column `col` holds `value`;
    /// advances the cursor past it so the search can resume.
    fn find_matching_rows(&self, db: &Database, col: usize, value: u32, cursor: &mut usize) -> Result<usize> {
        let (rows, _) = self.get_dimensions(db)?;
        while *cursor < rows {
            let row = *cursor;
            *cursor += 1;
            if self.fetch_int(db, row, col)? == value {
                return Ok(row);
            }
        }
        Err(MsiError::NoMoreItems)
    }

    /// Registers ORDER BY columns (1-based) applied by the next `execute`.
    fn sort(&mut self, _db: &Database, _columns: &[usize]) -> Result<()> {
        Err(MsiError::Unsupported)
    }

    fn add_column(&mut self, _db: &mut Database, _column: &ColumnInfo) -> Result<()> {
        Err(MsiError::Unsupported)
    }

    fn drop_table(&mut self, _db: &mut Database) -> Result<()> {
        Err(MsiError::Unsupported)
    }
}

/// Checks a 1-based column index against a column count.
pub(crate) fn check_column(col: usize, count: usize) -> Result<usize> {
    if col == 0 || col > count {
        return Err(MsiError::InvalidParameter);
    }
    Ok(col - 1)
}

/// Mask bit of the zero-based column `index`; 0 past the mask width.
pub(crate) fn column_bit(index: usize) -> u64 {
    u32::try_from(index).ok().and_then(|i| 1u64.checked_shl(i)).unwrap_or(0)
}

/// Mask selecting the first `count` columns.
pub(crate) const fn leading_columns(count: usize) -> u64 {
    if count >= u64::BITS as usize { u64::MAX } else { (1u64 << count) - 1 }
}
