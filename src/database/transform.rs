//! Transforms: row deltas against a base database, stored in a container
//! of their own with a private string pool.
//!
//! Every table touched by a transform has a stream of entries. An entry is
//! a little-endian `u16` mask followed by the cells it carries:
//!
//! * `mask & 1`: a full row of the first `mask >> 8` columns (insert or replace)
//! * `mask == 0`: only the key columns; the row is deleted
//! * otherwise: key columns plus each column `i` with bit `i` set (update)

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use super::{COLUMNS_TABLE, Database, STRING_DATA_STREAM, STRING_POOL_STREAM, TABLES_TABLE, catalog_columns};
use crate::core::column::{ColumnInfo, bias_decode, bias_encode, bytes_per_column};
use crate::core::{Field, MsiError, Persistence, Record, Result, StringTable, Table};
use crate::storage::{self, CLSID_MSI_TRANSFORM, Storage, decode_stream_name, encode_stream_name};

const FULL_ROW: u16 = 0x0001;

/// Highest column that can be named in an update mask.
const MASK_COLUMNS: usize = 16;

/// One delta entry. Cells live in the transform's string space; absent
/// columns are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    mask: u16,
    cells: Vec<Option<u32>>,
}

impl Entry {
    fn full(cells: Vec<u32>) -> Self {
        let count = cells.len().min(0xFF) as u16;
        Self {
            mask: FULL_ROW | (count << 8),
            cells: cells.into_iter().map(Some).collect(),
        }
    }

    const fn is_delete(&self) -> bool {
        self.mask == 0
    }

    const fn is_full(&self) -> bool {
        self.mask & FULL_ROW != 0
    }

    fn cell(&self, col: usize) -> Option<u32> {
        self.cells.get(col).copied().flatten()
    }
}

fn present_columns(mask: u16, columns: &[ColumnInfo]) -> Vec<bool> {
    if mask & FULL_ROW != 0 {
        let count = match usize::from(mask >> 8) {
            0 => columns.len(),
            n => n,
        };
        return (0..columns.len()).map(|i| i < count).collect();
    }
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| c.is_key() || (i < MASK_COLUMNS && mask & (1 << i) != 0))
        .collect()
}

fn read_entries(data: &[u8], columns: &[ColumnInfo], bytes_per_strref: usize) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let mask = u16::from_le_bytes([data[pos], data[pos + 1]]);
        pos += 2;
        let mut cells = Vec::with_capacity(columns.len());
        for (col, present) in columns.iter().zip(present_columns(mask, columns)) {
            if !present {
                cells.push(None);
                continue;
            }
            let width = bytes_per_column(col.ty, bytes_per_strref);
            let bytes = data
                .get(pos..pos + width)
                .ok_or_else(|| MsiError::InvalidData("transform entry truncated".into()))?;
            cells.push(Some(bytes.iter().rev().fold(0u32, |acc, b| (acc << 8) | u32::from(*b))));
            pos += width;
        }
        entries.push(Entry { mask, cells });
    }
    Ok(entries)
}

fn write_entries(entries: &[Entry], columns: &[ColumnInfo], bytes_per_strref: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&entry.mask.to_le_bytes());
        for (col, cell) in columns.iter().zip(&entry.cells) {
            if let Some(value) = cell {
                let width = bytes_per_column(col.ty, bytes_per_strref);
                out.extend_from_slice(&value.to_le_bytes()[..width]);
            }
        }
    }
    out
}

fn text_of(strings: &StringTable, cell: Option<u32>) -> String {
    cell.and_then(|id| strings.lookup(id)).unwrap_or("").to_string()
}

/// Key column values of a decoded row, as text.
fn key_of(columns: &[ColumnInfo], rec: &Record) -> Vec<String> {
    columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_key())
        .map(|(i, _)| rec.get_string(i + 1))
        .collect()
}

/// A column definition carried by a `_Columns` delta.
struct PendingColumn {
    table: String,
    number: Option<usize>,
    name: String,
    ty: u32,
}

impl Database {
    /// Applies the transform stored at `path`.
    pub fn apply_transform(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let transform = storage::load_storage(path)?;
        self.apply_transform_storage(transform)
    }

    /// Applies an already-loaded transform container and records it in
    /// [`Database::transforms`].
    pub fn apply_transform_storage(&mut self, transform: Storage) -> Result<()> {
        self.check_writable()?;
        if transform.class_id != CLSID_MSI_TRANSFORM {
            return Err(MsiError::InvalidData(format!("{} is not a transform class id", transform.class_id)));
        }
        let pool = transform.stream(&encode_stream_name(STRING_POOL_STREAM, true));
        let data = transform.stream(&encode_stream_name(STRING_DATA_STREAM, true));
        let strings = match (pool, data) {
            (Some(p), Some(d)) => StringTable::load(p, d)?,
            _ => StringTable::new(0),
        };
        let bytes_per_strref = strings.bytes_per_strref();

        self.apply_catalog_deltas(&transform, &strings)?;

        let mut names: Vec<String> = transform
            .streams()
            .map(|(encoded, _)| decode_stream_name(encoded))
            .filter(|(name, is_table)| {
                *is_table
                    && ![STRING_POOL_STREAM, STRING_DATA_STREAM, TABLES_TABLE, COLUMNS_TABLE].contains(&name.as_str())
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();

        for name in names {
            if !self.table_exists(&name) {
                warn!(table = %name, "transform changes a missing table; skipped");
                continue;
            }
            let Some(data) = transform.stream(&encode_stream_name(&name, true)) else {
                continue;
            };
            let columns = self.columns(&name)?;
            let entries = read_entries(data, &columns, bytes_per_strref)?;
            debug!(table = %name, entries = entries.len(), "applying table delta");
            let persistent = self.is_table_persistent(&name)?;
            for entry in &entries {
                self.apply_entry(&name, &columns, persistent, &strings, &transform, entry)?;
            }
        }

        info!(transforms = self.transforms.len() + 1, "applied transform");
        self.transforms.push(transform);
        Ok(())
    }

    /// `_Tables` and `_Columns` deltas: drops, new tables, new columns.
    fn apply_catalog_deltas(&mut self, transform: &Storage, strings: &StringTable) -> Result<()> {
        let bytes_per_strref = strings.bytes_per_strref();
        let mut created = Vec::new();

        if let Some(data) = transform.stream(&encode_stream_name(TABLES_TABLE, true)) {
            let columns = catalog_columns(TABLES_TABLE).unwrap_or_default();
            for entry in read_entries(data, &columns, bytes_per_strref)? {
                let name = text_of(strings, entry.cell(0));
                if entry.is_delete() {
                    if self.table_exists(&name) {
                        self.drop_table(&name)?;
                    }
                } else if !self.table_exists(&name) {
                    created.push(name);
                }
            }
        }

        let mut pending = Vec::new();
        if let Some(data) = transform.stream(&encode_stream_name(COLUMNS_TABLE, true)) {
            let columns = catalog_columns(COLUMNS_TABLE).unwrap_or_default();
            for entry in read_entries(data, &columns, bytes_per_strref)? {
                if !entry.is_full() {
                    warn!(mask = entry.mask, "only column additions are supported; entry skipped");
                    continue;
                }
                pending.push(PendingColumn {
                    table: text_of(strings, entry.cell(0)),
                    number: entry
                        .cell(1)
                        .and_then(|raw| bias_decode(raw, 2))
                        .and_then(|n| usize::try_from(n).ok()),
                    name: text_of(strings, entry.cell(2)),
                    ty: entry.cell(3).and_then(|raw| bias_decode(raw, 2)).unwrap_or(0) as u32,
                });
            }
        }

        // NULL numbers continue after the highest number seen for the table
        let mut next: HashMap<String, usize> = HashMap::new();
        for col in &pending {
            let existing = if created.contains(&col.table) || !self.table_exists(&col.table) {
                0
            } else {
                self.columns(&col.table)?.len()
            };
            let slot = next.entry(col.table.clone()).or_insert(existing);
            if let Some(n) = col.number {
                *slot = (*slot).max(n);
            }
        }
        for col in &mut pending {
            if col.number.is_none() {
                let slot = next.entry(col.table.clone()).or_insert(0);
                *slot += 1;
                col.number = Some(*slot);
            }
        }
        pending.sort_by_key(|c| c.number);

        for name in &created {
            let columns: Vec<ColumnInfo> = pending
                .iter()
                .filter(|c| &c.table == name)
                .map(|c| ColumnInfo::new(name, c.number.unwrap_or(0), &c.name, c.ty))
                .collect();
            if columns.is_empty() {
                warn!(table = %name, "transform adds a table without columns; skipped");
                continue;
            }
            self.create_table(name, &columns, true)?;
        }

        for col in pending.iter().filter(|c| !created.contains(&c.table)) {
            if !self.table_exists(&col.table) {
                warn!(table = %col.table, column = %col.name, "column for a missing table; skipped");
                continue;
            }
            if self.load_table(&col.table)?.get_column_index(&col.name).is_some() {
                continue;
            }
            self.add_column(&col.table, &ColumnInfo::new(&col.table, 0, &col.name, col.ty))?;
        }
        Ok(())
    }

    /// Local raw value for a transform cell.
    fn import_cell(&mut self, col: &ColumnInfo, raw: u32, strings: &StringTable, persistence: Persistence) -> u32 {
        if raw != 0 && col.is_string() {
            return self.strings.add(strings.lookup(raw).unwrap_or(""), persistence);
        }
        raw
    }

    fn apply_entry(
        &mut self,
        name: &str,
        columns: &[ColumnInfo],
        persistent: bool,
        strings: &StringTable,
        transform: &Storage,
        entry: &Entry,
    ) -> Result<()> {
        let persistence = if persistent { Persistence::Persistent } else { Persistence::NonPersistent };
        let has_keys = columns.iter().any(ColumnInfo::is_key);

        let mut key_values = vec![0; columns.len()];
        let mut resolved = has_keys;
        for (i, col) in columns.iter().enumerate().filter(|(_, c)| c.is_key()) {
            let raw = entry.cell(i).unwrap_or(0);
            key_values[i] = if col.is_string() {
                match self.strings.id_of(strings.lookup(raw).unwrap_or("")) {
                    Some(id) => id,
                    None => {
                        resolved = false;
                        0
                    }
                }
            } else {
                raw
            };
        }
        let existing = if resolved { self.table(name)?.find_insert_index(&key_values).ok() } else { None };

        if entry.is_delete() {
            match existing {
                Some(row) => {
                    let table = self.table(name)?;
                    if columns.iter().any(ColumnInfo::is_binary) {
                        let stream_name = self.row_stream_name(table, row)?;
                        self.streams.remove(&stream_name);
                    }
                    self.remove_row(name, row)?;
                }
                None => debug!(table = name, "transform deletes a missing row"),
            }
            return Ok(());
        }

        let row = match existing {
            Some(row) => {
                for (i, col) in columns.iter().enumerate() {
                    if col.is_key() {
                        continue;
                    }
                    if let Some(raw) = entry.cell(i) {
                        let value = self.import_cell(col, raw, strings, persistence);
                        self.replace_cell(name, row, i, value)?;
                    }
                }
                row
            }
            None => {
                let mut values = Vec::with_capacity(columns.len());
                for (i, col) in columns.iter().enumerate() {
                    let raw = entry.cell(i).unwrap_or(0);
                    values.push(self.import_cell(col, raw, strings, persistence));
                }
                match self.table_mut(name)?.insert_row(values.clone(), persistent) {
                    Ok(row) => row,
                    Err(e) => {
                        self.release_cells(columns, &values, persistent);
                        warn!(table = name, error = %e, "transform row skipped");
                        return Ok(());
                    }
                }
            }
        };

        if columns.iter().any(ColumnInfo::is_binary) {
            let stream_name = self.row_stream_name(self.table(name)?, row)?;
            for (i, col) in columns.iter().enumerate().filter(|(_, c)| c.is_binary()) {
                match entry.cell(i) {
                    Some(0) => {
                        self.streams.remove(&stream_name);
                    }
                    Some(_) => match transform.stream(&encode_stream_name(&stream_name, false)) {
                        Some(bytes) => {
                            self.streams.insert(stream_name.clone(), bytes.clone());
                        }
                        None => warn!(stream = %stream_name, column = %col.name, "transform lacks a binary cell"),
                    },
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Writes to `path` the transform that turns `reference` into this database.
    ///
    /// Tables only in `reference` are dropped, tables only here are created,
    /// and columns appended here are added. Any other schema change fails
    /// with `DatatypeMismatch`.
    pub fn generate_transform(&mut self, reference: &mut Database, path: impl AsRef<Path>) -> Result<()> {
        let mut strings = StringTable::new(self.codepage());
        let mut out = Storage::new(CLSID_MSI_TRANSFORM);
        let mut tables_delta = Vec::new();
        let mut columns_delta = Vec::new();
        let mut deltas = Vec::new();

        let ours = self.table_names()?;
        let theirs = reference.table_names()?;
        for name in theirs.iter().filter(|n| !ours.contains(*n)) {
            tables_delta.push(Entry {
                mask: 0,
                cells: vec![Some(strings.add(name, Persistence::Persistent))],
            });
        }

        for name in &ours {
            let table = self.load_table(name)?.clone();
            let old = if theirs.contains(name) { Some(reference.load_table(name)?.clone()) } else { None };
            let old_columns = old.as_ref().map(|t| t.columns.clone()).unwrap_or_default();
            if old.is_none() {
                tables_delta.push(Entry::full(vec![strings.add(name, Persistence::Persistent)]));
            }

            let reshaped = old_columns.len() > table.columns.len()
                || old_columns
                    .iter()
                    .zip(&table.columns)
                    .any(|(a, b)| a.name != b.name || a.ty != b.ty);
            if reshaped {
                return Err(MsiError::DatatypeMismatch(format!("columns of {name} changed")));
            }
            for col in &table.columns[old_columns.len()..] {
                columns_delta.push(Entry::full(vec![
                    strings.add(name, Persistence::Persistent),
                    bias_encode(col.number as i32, 2)?,
                    strings.add(&col.name, Persistence::Persistent),
                    bias_encode(col.ty as i32, 2)?,
                ]));
            }

            let entries = self.diff_rows(reference, &table, old.as_ref(), &mut strings, &mut out)?;
            if !entries.is_empty() {
                deltas.push((name.clone(), table.columns, entries));
            }
        }

        let (pool, data, bytes_per_strref) = strings.save();
        out.set_stream(&encode_stream_name(STRING_POOL_STREAM, true), pool);
        out.set_stream(&encode_stream_name(STRING_DATA_STREAM, true), data);
        for (name, entries) in [(TABLES_TABLE, &tables_delta), (COLUMNS_TABLE, &columns_delta)] {
            if !entries.is_empty() {
                let columns = catalog_columns(name).unwrap_or_default();
                out.set_stream(&encode_stream_name(name, true), write_entries(entries, &columns, bytes_per_strref));
            }
        }
        for (name, columns, entries) in &deltas {
            out.set_stream(&encode_stream_name(name, true), write_entries(entries, columns, bytes_per_strref));
        }

        storage::save_storage(&out, path)?;
        info!(tables = deltas.len(), "generated transform");
        Ok(())
    }

    /// Entries turning `old` (a table of `reference`) into `table`.
    fn diff_rows(
        &self,
        reference: &Database,
        table: &Table,
        old: Option<&Table>,
        strings: &mut StringTable,
        out: &mut Storage,
    ) -> Result<Vec<Entry>> {
        let columns = &table.columns;
        let keyed = columns.iter().any(ColumnInfo::is_key);
        let mut previous: HashMap<Vec<String>, Record> = HashMap::new();
        let mut unkeyed_previous = Vec::new();
        if let Some(old) = old {
            for row in 0..old.row_count() {
                let rec = reference.row_record(old, row)?;
                if keyed {
                    previous.insert(key_of(&old.columns, &rec), rec);
                } else {
                    unkeyed_previous.push(rec);
                }
            }
        }

        let mut entries = Vec::new();
        for row in 0..table.row_count() {
            let rec = self.row_record(table, row)?;
            let before = if keyed {
                previous.remove(&key_of(columns, &rec))
            } else {
                unkeyed_previous.iter().position(|r| *r == rec).map(|pos| unkeyed_previous.swap_remove(pos))
            };

            let changed: Vec<usize> = match &before {
                None => (0..columns.len()).collect(),
                Some(prev) => (0..columns.len())
                    .filter(|&i| !columns[i].is_key())
                    .filter(|&i| rec.field(i + 1) != Some(prev.field(i + 1).unwrap_or(&Field::Null)))
                    .collect(),
            };
            if changed.is_empty() {
                continue;
            }
            let full = before.is_none() || changed.iter().any(|&i| i == 0 || i >= MASK_COLUMNS);

            let mut mask = 0u16;
            let mut cells = Vec::with_capacity(columns.len());
            for (i, col) in columns.iter().enumerate() {
                if !full && !col.is_key() && !changed.contains(&i) {
                    cells.push(None);
                    continue;
                }
                if !full && !col.is_key() {
                    mask |= 1 << i;
                }
                cells.push(Some(self.export_cell(table, row, col, &rec, i + 1, strings, out)?));
            }
            if full {
                let values = cells.into_iter().map(|c| c.unwrap_or(0)).collect();
                entries.push(Entry::full(values));
            } else {
                entries.push(Entry { mask, cells });
            }
        }

        if !unkeyed_previous.is_empty() {
            warn!(table = %table.name, rows = unkeyed_previous.len(), "rows removed from a table without keys are not recorded");
        }
        let mut removed: Vec<Record> = previous.into_values().collect();
        removed.sort_by_key(|rec| key_of(columns, rec));
        for rec in removed {
            let mut cells = Vec::with_capacity(columns.len());
            for (i, col) in columns.iter().enumerate() {
                cells.push(if col.is_key() { Some(encode_value(col, &rec, i + 1, strings)?) } else { None });
            }
            entries.push(Entry { mask: 0, cells });
        }
        Ok(entries)
    }

    /// Transform-space value for one cell, copying binary data into `out`.
    fn export_cell(
        &self,
        table: &Table,
        row: usize,
        col: &ColumnInfo,
        rec: &Record,
        field: usize,
        strings: &mut StringTable,
        out: &mut Storage,
    ) -> Result<u32> {
        if col.is_binary() && rec.is_stream(field) {
            let stream_name = self.row_stream_name(table, row)?;
            out.set_stream(&encode_stream_name(&stream_name, false), rec.get_stream(field)?.into_bytes());
        }
        encode_value(col, rec, field, strings)
    }
}

fn encode_value(col: &ColumnInfo, rec: &Record, field: usize, strings: &mut StringTable) -> Result<u32> {
    if rec.is_null(field) {
        return Ok(0);
    }
    if col.is_binary() {
        return Ok(u32::from(rec.is_stream(field)));
    }
    if col.is_string() {
        return Ok(strings.add(&rec.get_string(field), Persistence::Persistent));
    }
    bias_encode(rec.get_int(field), col.int_width())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stream;
    use crate::core::column::{MSITYPE_KEY, TYPE_SHORT};
    use tempfile::TempDir;

    fn base() -> Database {
        let mut db = Database::new();
        db.execute_sql("CREATE TABLE `Property` (`Property` CHAR(72) NOT NULL, `Value` CHAR(0) PRIMARY KEY `Property`)")
            .unwrap();
        db.execute_sql("CREATE TABLE `Old` (`Id` SHORT NOT NULL PRIMARY KEY `Id`)").unwrap();
        for (k, v) in [("ProductName", "Demo"), ("ProductVersion", "1.0"), ("Obsolete", "x")] {
            db.execute_sql(&format!("INSERT INTO `Property` (`Property`, `Value`) VALUES ('{k}', '{v}')"))
                .unwrap();
        }
        db
    }

    fn rows(db: &mut Database, sql: &str) -> Vec<String> {
        let mut q = db.open_query(sql).unwrap();
        let mut out = Vec::new();
        q.iterate(None, |rec| {
            out.push(rec.to_string());
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_generate_and_apply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("patch.mst");

        let mut reference = base();
        let mut updated = base();
        updated.execute_sql("UPDATE `Property` SET `Value` = '2.0' WHERE `Property` = 'ProductVersion'").unwrap();
        updated.execute_sql("DELETE FROM `Property` WHERE `Property` = 'Obsolete'").unwrap();
        updated.execute_sql("INSERT INTO `Property` (`Property`, `Value`) VALUES ('Manufacturer', 'Acme')").unwrap();
        updated.execute_sql("DROP TABLE `Old`").unwrap();
        updated
            .execute_sql("CREATE TABLE `Binary` (`Name` CHAR(72) NOT NULL, `Data` OBJECT PRIMARY KEY `Name`)")
            .unwrap();
        let mut q = updated.open_query("INSERT INTO `Binary` (`Name`, `Data`) VALUES (?, ?)").unwrap();
        let mut params = Record::new(2).unwrap();
        params.set_string(1, "logo").unwrap();
        params.set_stream(2, Stream::new(b"BM\x00\x01".to_vec())).unwrap();
        q.execute(Some(&params)).unwrap();
        q.close().unwrap();
        drop(q);

        updated.generate_transform(&mut reference, &path).unwrap();

        let mut target = base();
        target.apply_transform(&path).unwrap();
        assert_eq!(target.transforms().len(), 1);
        assert!(!target.table_exists("Old"));

        let sql = "SELECT `Property`, `Value` FROM `Property` ORDER BY `Property`";
        assert_eq!(rows(&mut target, sql), rows(&mut updated, sql));
        assert_eq!(target.stream("Binary.logo").unwrap().len(), 4);
        assert_eq!(rows(&mut target, "SELECT `Name` FROM `Binary`"), vec!["logo"]);
        for gone in ["Obsolete", "x", "1.0", "Old"] {
            assert_eq!(target.strings().id_of(gone), None, "{gone} still interned");
        }
    }

    #[test]
    fn test_appended_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("column.mst");
        let mut reference = base();
        let mut updated = base();
        updated
            .add_column("Old", &ColumnInfo::new("Old", 0, "Extra", TYPE_SHORT | crate::core::column::MSITYPE_NULLABLE))
            .unwrap();
        updated.execute_sql("INSERT INTO `Old` (`Id`, `Extra`) VALUES (1, 7)").unwrap();
        updated.generate_transform(&mut reference, &path).unwrap();

        let mut target = base();
        target.apply_transform(&path).unwrap();
        assert_eq!(target.columns("Old").unwrap().len(), 2);
        assert_eq!(rows(&mut target, "SELECT `Id`, `Extra` FROM `Old`"), vec!["1\t7"]);
    }

    #[test]
    fn test_masked_update_entry() {
        let columns = vec![
            ColumnInfo::new("T", 1, "Id", TYPE_SHORT | MSITYPE_KEY),
            ColumnInfo::new("T", 2, "A", TYPE_SHORT),
            ColumnInfo::new("T", 3, "B", TYPE_SHORT),
        ];
        // update of column 2 only: mask bit 2, key then B
        let data = [0x04, 0x00, 0x01, 0x80, 0x09, 0x80];
        let entries = read_entries(&data, &columns, 2).unwrap();
        assert_eq!(entries, vec![Entry { mask: 4, cells: vec![Some(0x8001), None, Some(0x8009)] }]);
        assert_eq!(write_entries(&entries, &columns, 2), data);

        assert!(matches!(read_entries(&data[..5], &columns, 2), Err(MsiError::InvalidData(_))));
    }

    #[test]
    fn test_rejects_non_transform() {
        let mut db = base();
        let err = db.apply_transform_storage(Storage::new(crate::storage::CLSID_MSI_DATABASE));
        assert!(matches!(err, Err(MsiError::InvalidData(_))));
        assert!(db.transforms().is_empty());
    }
}
