use std::cmp::Ordering;

use tracing::warn;

use super::column::{ColumnInfo, bytes_per_column};
use super::error::{MsiError, Result};

/// Decoded contents of one table: rows of raw cells plus per-row
/// persistence. String cells hold string ids, integer cells hold
/// bias-encoded values, binary cells hold 1 when a stream is present.
#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    rows: Vec<Vec<u32>>,
    row_persistent: Vec<bool>,
    persistent: bool,
}

fn read_cell(data: &[u8], offset: usize, width: usize) -> u32 {
    data[offset..offset + width]
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (8 * i)))
}

fn write_cell(out: &mut Vec<u8>, value: u32, width: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

impl Table {
    #[must_use]
    pub fn new(name: &str, columns: Vec<ColumnInfo>, persistent: bool) -> Self {
        Self {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
            row_persistent: Vec::new(),
            persistent,
        }
    }

    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.persistent
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn get_column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions (0-based) of the primary key columns.
    #[must_use]
    pub fn key_columns(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_key())
            .map(|(i, _)| i)
            .collect()
    }

    #[must_use]
    pub fn row(&self, row: usize) -> Option<&[u32]> {
        self.rows.get(row).map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u32]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Raw cell, `col` 0-based.
    #[must_use]
    pub fn cell(&self, row: usize, col: usize) -> Option<u32> {
        self.rows.get(row)?.get(col).copied()
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: u32) -> Result<()> {
        let slot = self
            .rows
            .get_mut(row)
            .and_then(|r| r.get_mut(col))
            .ok_or(MsiError::NoMoreItems)?;
        *slot = value;
        Ok(())
    }

    #[must_use]
    pub fn is_row_persistent(&self, row: usize) -> bool {
        self.row_persistent.get(row).copied().unwrap_or(false)
    }

    fn compare_keys(&self, a: &[u32], b: &[u32]) -> Ordering {
        for (i, col) in self.columns.iter().enumerate() {
            if !col.is_key() {
                continue;
            }
            match a[i].cmp(&b[i]) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// `Ok(row)` when a row with the same key values exists, otherwise
    /// `Err(position)` where it would be inserted.
    pub fn find_insert_index(&self, values: &[u32]) -> std::result::Result<usize, usize> {
        self.rows.binary_search_by(|r| self.compare_keys(r, values))
    }

    /// Row whose key columns equal those of `values`.
    #[must_use]
    pub fn find_row(&self, values: &[u32]) -> Option<usize> {
        if self.columns.iter().all(|c| !c.is_key()) {
            return self.rows.iter().position(|r| r.as_slice() == values);
        }
        self.find_insert_index(values).ok()
    }

    /// Inserts at the sorted key position. Fails if a non-nullable column
    /// is NULL or the key already exists.
    pub fn insert_row(&mut self, values: Vec<u32>, persistent: bool) -> Result<usize> {
        if values.len() != self.columns.len() {
            return Err(MsiError::InvalidParameter);
        }
        for (col, v) in self.columns.iter().zip(&values) {
            if *v == 0 && !col.is_nullable() {
                return Err(MsiError::InvalidData(format!(
                    "column {}.{} may not be NULL",
                    self.name, col.name
                )));
            }
        }
        let pos = match self.find_insert_index(&values) {
            Ok(_) if self.columns.iter().any(ColumnInfo::is_key) => {
                return Err(MsiError::failed(format!("duplicate primary key in {}", self.name)));
            }
            Ok(pos) | Err(pos) => pos,
        };
        self.rows.insert(pos, values);
        self.row_persistent.insert(pos, persistent && self.persistent);
        Ok(pos)
    }

    /// Appends a column; existing rows hold NULL in it.
    pub fn add_column(&mut self, column: ColumnInfo) {
        self.columns.push(column);
        for row in &mut self.rows {
            row.push(0);
        }
    }

    pub fn delete_row(&mut self, row: usize) -> Result<Vec<u32>> {
        if row >= self.rows.len() {
            return Err(MsiError::InvalidParameter);
        }
        self.row_persistent.remove(row);
        Ok(self.rows.remove(row))
    }

    /// Byte offset of each column within a row, plus the row size.
    #[must_use]
    pub fn column_offsets(&self, bytes_per_strref: usize) -> (Vec<usize>, usize) {
        let mut offsets = Vec::with_capacity(self.columns.len());
        let mut size = 0;
        for col in &self.columns {
            offsets.push(size);
            size += bytes_per_column(col.ty, bytes_per_strref);
        }
        (offsets, size)
    }

    /// Decodes a column-major table stream into rows.
    pub fn load(&mut self, data: &[u8], bytes_per_strref: usize) -> Result<()> {
        self.rows.clear();
        self.row_persistent.clear();
        let (offsets, row_size) = self.column_offsets(bytes_per_strref);
        if row_size == 0 || data.is_empty() {
            return Ok(());
        }
        if data.len() % row_size != 0 {
            warn!(table = %self.name, len = data.len(), row_size, "table stream size is not a multiple of the row size");
        }
        let count = data.len() / row_size;
        self.rows.reserve(count);
        for i in 0..count {
            let row = self
                .columns
                .iter()
                .zip(&offsets)
                .map(|(col, &off)| {
                    let width = bytes_per_column(col.ty, bytes_per_strref);
                    read_cell(data, off * count + i * width, width)
                })
                .collect();
            self.rows.push(row);
            self.row_persistent.push(self.persistent);
        }
        if self.columns.iter().any(ColumnInfo::is_key) {
            let mut paired: Vec<_> = self.rows.drain(..).zip(self.row_persistent.drain(..)).collect();
            paired.sort_by(|a, b| self.compare_keys(&a.0, &b.0));
            for (row, p) in paired {
                self.rows.push(row);
                self.row_persistent.push(p);
            }
        }
        Ok(())
    }

    /// Encodes the persistent rows column-major.
    #[must_use]
    pub fn save(&self, bytes_per_strref: usize) -> Vec<u8> {
        let kept: Vec<&Vec<u32>> = self
            .rows
            .iter()
            .zip(&self.row_persistent)
            .filter(|(_, p)| **p)
            .map(|(r, _)| r)
            .collect();
        let (_, row_size) = self.column_offsets(bytes_per_strref);
        let mut out = Vec::with_capacity(row_size * kept.len());
        for (j, col) in self.columns.iter().enumerate() {
            let width = bytes_per_column(col.ty, bytes_per_strref);
            for row in &kept {
                write_cell(&mut out, row[j], width);
            }
        }
        out
    }
}
