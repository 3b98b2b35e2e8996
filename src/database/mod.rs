//! The database object: string pool, table cache, raw streams and
//! sub-storages, and the commit that writes them back out.

mod idt;
mod merge;
mod transform;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info};

use crate::core::column::{
    ColumnInfo, MAX_COLUMNS, MSITYPE_KEY, MSITYPE_NULLABLE, TYPE_BINARY, TYPE_SHORT, bias_decode, bias_encode,
    type_string,
};
use crate::core::string_table::is_valid_codepage;
use crate::core::summary_info::SUMMARY_INFO_STREAM;
use crate::core::{MsiError, Persistence, Record, Result, Stream, StringTable, SummaryInfo, Table};
use crate::storage::{
    self, CLSID_MSI_DATABASE, CLSID_MSI_PATCH, CLSID_MSI_TRANSFORM, Storage, decode_stream_name,
    encode_stream_name,
};

pub use idt::{FORCE_CODEPAGE, SUMMARY_INFORMATION};
pub use merge::{MergeConflict, MergeOutcome};

pub const TABLES_TABLE: &str = "_Tables";
pub const COLUMNS_TABLE: &str = "_Columns";
pub const STREAMS_TABLE: &str = "_Streams";
pub const STRING_POOL_STREAM: &str = "_StringPool";
pub const STRING_DATA_STREAM: &str = "_StringData";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// No writes; commit is a no-op.
    ReadOnly,
    /// Writes are kept in memory until commit replaces the file.
    Transact,
    /// Like `Transact`; commit writes back to the opened file.
    Direct,
    /// Start from an empty database that commit writes to the path.
    Create,
}

/// Built-in column layout of the catalog tables.
fn system_columns(table: &str) -> Option<Vec<ColumnInfo>> {
    match table {
        TABLES_TABLE => Some(vec![ColumnInfo::new(TABLES_TABLE, 1, "Name", type_string(64) | MSITYPE_KEY)]),
        COLUMNS_TABLE => Some(vec![
            ColumnInfo::new(COLUMNS_TABLE, 1, "Table", type_string(64) | MSITYPE_KEY),
            ColumnInfo::new(COLUMNS_TABLE, 2, "Number", TYPE_SHORT | MSITYPE_KEY),
            ColumnInfo::new(COLUMNS_TABLE, 3, "Name", type_string(64)),
            ColumnInfo::new(COLUMNS_TABLE, 4, "Type", TYPE_SHORT),
        ]),
        STREAMS_TABLE => Some(vec![
            ColumnInfo::new(STREAMS_TABLE, 1, "Name", type_string(62) | MSITYPE_KEY),
            ColumnInfo::new(STREAMS_TABLE, 2, "Data", TYPE_BINARY | MSITYPE_NULLABLE),
        ]),
        _ => None,
    }
}

/// Columns of a catalog table, if `table` is one.
#[must_use]
pub fn catalog_columns(table: &str) -> Option<Vec<ColumnInfo>> {
    system_columns(table)
}

pub struct Database {
    path: Option<PathBuf>,
    outpath: Option<PathBuf>,
    mode: OpenMode,
    class_id: uuid::Uuid,
    /// Container as last loaded or committed; source of unloaded table streams.
    storage: Storage,
    strings: StringTable,
    tables: HashMap<String, Table>,
    /// Non-table streams by decoded name.
    streams: BTreeMap<String, Bytes>,
    storages: BTreeMap<String, Storage>,
    transforms: Vec<Storage>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("cached_tables", &self.tables.len())
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (or, with [`OpenMode::Create`], starts) the database at `path`.
    /// Commits go back to `path`.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        Self::open_with_output(path, mode, Some(path))
    }

    /// Opens `path`, directing commits to `outpath` instead.
    pub fn open_with_output(path: impl AsRef<Path>, mode: OpenMode, outpath: Option<&Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = if mode == OpenMode::Create {
            Storage::new(CLSID_MSI_DATABASE)
        } else {
            storage::load_storage(&path)?
        };
        let mut db = Self::from_storage(storage, mode)?;
        db.path = Some(path);
        db.outpath = outpath.map(Path::to_path_buf);
        db.start_transaction();
        Ok(db)
    }

    /// Empty in-memory database; commit needs [`Database::set_output_path`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: None,
            outpath: None,
            mode: OpenMode::Create,
            class_id: CLSID_MSI_DATABASE,
            storage: Storage::new(CLSID_MSI_DATABASE),
            strings: StringTable::new(0),
            tables: HashMap::new(),
            streams: BTreeMap::new(),
            storages: BTreeMap::new(),
            transforms: Vec::new(),
        }
    }

    /// Wraps an already-loaded container.
    pub fn from_storage(storage: Storage, mode: OpenMode) -> Result<Self> {
        let class_id = storage.class_id;
        if ![CLSID_MSI_DATABASE, CLSID_MSI_PATCH, CLSID_MSI_TRANSFORM].contains(&class_id) {
            return Err(MsiError::InvalidData(format!("unrecognised root class id {class_id}")));
        }

        let pool = storage.stream(&encode_stream_name(STRING_POOL_STREAM, true));
        let data = storage.stream(&encode_stream_name(STRING_DATA_STREAM, true));
        let strings = match (pool, data) {
            (Some(p), Some(d)) => StringTable::load(p, d)?,
            _ => StringTable::new(0),
        };

        let mut streams = BTreeMap::new();
        for (name, bytes) in storage.streams() {
            let (decoded, is_table) = decode_stream_name(name);
            if !is_table {
                streams.insert(decoded, bytes.clone());
            }
        }
        let storages = storage
            .storages()
            .map(|(name, st)| (name.to_string(), st.clone()))
            .collect();

        debug!(strings = strings.len(), streams = streams.len(), "opened database");
        Ok(Self {
            path: None,
            outpath: None,
            mode,
            class_id,
            storage,
            strings,
            tables: HashMap::new(),
            streams,
            storages,
            transforms: Vec::new(),
        })
    }

    #[must_use]
    pub const fn mode(&self) -> OpenMode {
        self.mode
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_output_path(&mut self, outpath: impl AsRef<Path>) {
        self.outpath = Some(outpath.as_ref().to_path_buf());
        if self.mode == OpenMode::ReadOnly {
            self.mode = OpenMode::Transact;
        }
    }

    /// Prepares the write target for the next commit. In transact mode the
    /// opened file stays untouched until commit swaps the new file in.
    pub fn start_transaction(&mut self) {
        if self.mode == OpenMode::ReadOnly {
            return;
        }
        if self.outpath.is_none() {
            self.outpath.clone_from(&self.path);
        }
        debug!(mode = ?self.mode, outpath = ?self.outpath, "transaction started");
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(MsiError::AccessDenied);
        }
        Ok(())
    }

    #[must_use]
    pub const fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    #[must_use]
    pub const fn codepage(&self) -> u32 {
        self.strings.codepage()
    }

    pub fn set_codepage(&mut self, codepage: u32) -> Result<()> {
        self.check_writable()?;
        if !is_valid_codepage(codepage) {
            return Err(MsiError::FunctionFailed(format!("unsupported codepage {codepage}")));
        }
        self.strings.set_codepage(codepage)
    }

    // ---- tables ----

    fn stored_table_stream(&self, name: &str) -> Option<&Bytes> {
        self.storage.stream(&encode_stream_name(name, true))
    }

    fn lookup_catalog_columns(&mut self, name: &str) -> Result<Vec<ColumnInfo>> {
        self.load_table(COLUMNS_TABLE)?;
        let Some(id) = self.strings.id_of(name) else {
            return Ok(Vec::new());
        };
        let cols_table = self.table(COLUMNS_TABLE)?;
        let mut columns = Vec::new();
        for row in cols_table.rows().filter(|r| r[0] == id) {
            let number = bias_decode(row[1], 2).unwrap_or(0);
            let col_name = self.strings.lookup(row[2]).unwrap_or("");
            let ty = bias_decode(row[3], 2).unwrap_or(0) as u32;
            columns.push(ColumnInfo::new(name, number.max(0) as usize, col_name, ty));
        }
        columns.sort_by_key(|c| c.number);
        Ok(columns)
    }

    /// Row of `_Tables` naming `name`.
    fn catalog_row(&mut self, name: &str) -> Result<Option<usize>> {
        self.load_table(TABLES_TABLE)?;
        let Some(id) = self.strings.id_of(name) else {
            return Ok(None);
        };
        Ok(self.table(TABLES_TABLE)?.find_row(&[id]))
    }

    /// Loads a table into the cache (no-op when cached) and returns it.
    pub fn load_table(&mut self, name: &str) -> Result<&mut Table> {
        if !self.tables.contains_key(name) {
            let table = self.read_table(name)?;
            self.tables.insert(name.to_string(), table);
        }
        self.tables
            .get_mut(name)
            .ok_or_else(|| MsiError::InvalidTable(name.to_string()))
    }

    fn read_table(&mut self, name: &str) -> Result<Table> {
        let (columns, persistent) = match system_columns(name) {
            Some(_) if name == STREAMS_TABLE => return Err(MsiError::InvalidTable(name.to_string())),
            Some(cols) => (cols, true),
            None => {
                let Some(row) = self.catalog_row(name)? else {
                    return Err(MsiError::InvalidTable(name.to_string()));
                };
                let persistent = self.table(TABLES_TABLE)?.is_row_persistent(row);
                let cols = self.lookup_catalog_columns(name)?;
                if cols.is_empty() {
                    return Err(MsiError::InvalidTable(name.to_string()));
                }
                (cols, persistent)
            }
        };
        let mut table = Table::new(name, columns, persistent);
        if let Some(data) = self.stored_table_stream(name) {
            table.load(data, self.strings.bytes_per_strref())?;
        }
        debug!(table = name, rows = table.row_count(), "loaded table");
        Ok(table)
    }

    /// A cached table. Views load their tables up front, so a miss here
    /// means the table was dropped or never opened.
    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| MsiError::InvalidTable(name.to_string()))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MsiError::InvalidTable(name.to_string()))
    }

    /// Drops the string references held by one row's cells.
    pub(crate) fn release_cells(&mut self, columns: &[ColumnInfo], cells: &[u32], persistent: bool) {
        let persistence = if persistent { Persistence::Persistent } else { Persistence::NonPersistent };
        for (col, &raw) in columns.iter().zip(cells) {
            if raw != 0 && col.is_string() {
                self.strings.release(raw, persistence);
            }
        }
    }

    /// Deletes a row of a cached table along with its string references.
    pub(crate) fn remove_row(&mut self, name: &str, row: usize) -> Result<()> {
        let table = self.table_mut(name)?;
        let persistent = table.is_row_persistent(row);
        let cells = table.delete_row(row)?;
        let columns = table.columns.clone();
        self.release_cells(&columns, &cells, persistent);
        Ok(())
    }

    /// Overwrites one cell. `value` must already carry its own string
    /// reference; the old value's reference is dropped.
    pub(crate) fn replace_cell(&mut self, name: &str, row: usize, col: usize, value: u32) -> Result<()> {
        let table = self.table_mut(name)?;
        let old = table.cell(row, col).ok_or(MsiError::InvalidParameter)?;
        let persistent = table.is_row_persistent(row);
        let is_string = table.columns.get(col).is_some_and(ColumnInfo::is_string);
        table.set_cell(row, col, value)?;
        if is_string && old != 0 {
            let persistence = if persistent { Persistence::Persistent } else { Persistence::NonPersistent };
            self.strings.release(old, persistence);
        }
        Ok(())
    }

    #[must_use]
    pub fn is_system_table(name: &str) -> bool {
        system_columns(name).is_some()
    }

    pub fn table_exists(&mut self, name: &str) -> bool {
        Self::is_system_table(name) || matches!(self.catalog_row(name), Ok(Some(_)))
    }

    pub fn is_table_persistent(&mut self, name: &str) -> Result<bool> {
        if Self::is_system_table(name) {
            return Ok(true);
        }
        let row = self.catalog_row(name)?.ok_or_else(|| MsiError::InvalidTable(name.to_string()))?;
        Ok(self.table(TABLES_TABLE)?.is_row_persistent(row))
    }

    /// Names of all user tables, in `_Tables` order.
    pub fn table_names(&mut self) -> Result<Vec<String>> {
        self.load_table(TABLES_TABLE)?;
        let tables = self.table(TABLES_TABLE)?;
        Ok(tables
            .rows()
            .filter_map(|r| self.strings.lookup(r[0]).map(str::to_string))
            .collect())
    }

    pub fn columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.load_table(table)?.columns.clone())
    }

    /// Record whose field 0 is the table name and fields `1..` its key columns.
    pub fn primary_keys(&mut self, table: &str) -> Result<Record> {
        if !self.table_exists(table) {
            return Err(MsiError::InvalidTable(table.to_string()));
        }
        let columns = match system_columns(table) {
            Some(cols) => cols,
            None => self.columns(table)?,
        };
        let keys: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_key()).collect();
        let mut rec = Record::new(keys.len())?;
        rec.set_string(0, table)?;
        for (i, col) in keys.iter().enumerate() {
            rec.set_string(i + 1, &col.name)?;
        }
        Ok(rec)
    }

    /// Registers a new table in the catalog. `columns` carry their final
    /// type words (key bits included), numbered from 1.
    pub fn create_table(&mut self, name: &str, columns: &[ColumnInfo], persistent: bool) -> Result<()> {
        self.check_writable()?;
        if self.table_exists(name) {
            return Err(MsiError::syntax(format!("table {name} already exists")));
        }
        if columns.len() > MAX_COLUMNS {
            return Err(MsiError::InvalidParameter);
        }
        let persistence = if persistent { Persistence::Persistent } else { Persistence::NonPersistent };

        let name_id = self.strings.add(name, persistence);
        self.load_table(TABLES_TABLE)?;
        self.table_mut(TABLES_TABLE)?.insert_row(vec![name_id], persistent)?;

        self.load_table(COLUMNS_TABLE)?;
        for col in columns {
            let table_id = self.strings.add(name, persistence);
            let col_id = self.strings.add(&col.name, persistence);
            let row = vec![
                table_id,
                bias_encode(col.number as i32, 2)?,
                col_id,
                bias_encode(col.ty as i32, 2)?,
            ];
            self.table_mut(COLUMNS_TABLE)?.insert_row(row, persistent)?;
        }

        let cols = columns
            .iter()
            .map(|c| {
                let mut info = ColumnInfo::new(name, c.number, &c.name, c.ty);
                info.temporary = c.temporary;
                info
            })
            .collect();
        self.tables.insert(name.to_string(), Table::new(name, cols, persistent));
        info!(table = name, persistent, "created table");
        Ok(())
    }

    /// Removes a table, its catalog rows and its binary cell streams.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        if Self::is_system_table(name) {
            return Err(MsiError::AccessDenied);
        }
        let row = self.catalog_row(name)?.ok_or_else(|| MsiError::InvalidTable(name.to_string()))?;
        let id = self.strings.id_of(name).unwrap_or(0);
        let table = self.load_table(name)?.clone();
        let has_streams = table.columns.iter().any(ColumnInfo::is_binary);
        for (r, cells) in table.rows().enumerate() {
            if has_streams {
                let stream_name = self.row_stream_name(&table, r)?;
                self.streams.remove(&stream_name);
            }
            self.release_cells(&table.columns, cells, table.is_row_persistent(r));
        }

        self.remove_row(TABLES_TABLE, row)?;
        self.load_table(COLUMNS_TABLE)?;
        loop {
            let Some(pos) = self.table(COLUMNS_TABLE)?.rows().position(|r| r[0] == id) else {
                break;
            };
            self.remove_row(COLUMNS_TABLE, pos)?;
        }
        self.tables.remove(name);
        self.storage.remove_stream(&encode_stream_name(name, true));
        info!(table = name, "dropped table");
        Ok(())
    }

    /// Appends a column to an existing table; existing rows read NULL in it.
    pub fn add_column(&mut self, table: &str, column: &ColumnInfo) -> Result<()> {
        self.check_writable()?;
        if Self::is_system_table(table) {
            return Err(MsiError::AccessDenied);
        }
        let persistent = self.is_table_persistent(table)?;
        let t = self.load_table(table)?;
        if t.get_column_index(&column.name).is_some() {
            return Err(MsiError::syntax(format!("column {table}.{} already exists", column.name)));
        }
        if t.column_count() >= MAX_COLUMNS {
            return Err(MsiError::InvalidParameter);
        }
        let number = t.column_count() + 1;
        let persistence = if persistent { Persistence::Persistent } else { Persistence::NonPersistent };

        let table_id = self.strings.add(table, persistence);
        let col_id = self.strings.add(&column.name, persistence);
        self.load_table(COLUMNS_TABLE)?;
        let row = vec![
            table_id,
            bias_encode(number as i32, 2)?,
            col_id,
            bias_encode(column.ty as i32, 2)?,
        ];
        self.table_mut(COLUMNS_TABLE)?.insert_row(row, persistent)?;

        let mut info = ColumnInfo::new(table, number, &column.name, column.ty);
        info.temporary = column.temporary;
        self.table_mut(table)?.add_column(info);
        debug!(table, column = %column.name, number, "added column");
        Ok(())
    }

    /// Name of the stream holding the binary cells of `row`:
    /// the table name followed by each key value, joined with `.`.
    pub(crate) fn row_stream_name(&self, table: &Table, row: usize) -> Result<String> {
        let cells = table.row(row).ok_or(MsiError::InvalidParameter)?;
        let mut name = table.name.clone();
        for (col, raw) in table.columns.iter().zip(cells) {
            if !col.is_key() {
                continue;
            }
            name.push('.');
            if col.is_string() {
                name.push_str(self.strings.lookup(*raw).unwrap_or(""));
            } else if let Some(v) = bias_decode(*raw, col.int_width()) {
                name.push_str(&v.to_string());
            }
        }
        Ok(name)
    }

    // ---- streams and storages ----

    #[must_use]
    pub fn stream(&self, name: &str) -> Option<Stream> {
        self.streams.get(name).map(|b| Stream::new(b.clone()))
    }

    pub fn set_stream(&mut self, name: &str, data: impl Into<Bytes>) -> Result<()> {
        self.check_writable()?;
        self.streams.insert(name.to_string(), data.into());
        Ok(())
    }

    pub fn remove_stream(&mut self, name: &str) -> Result<Option<Bytes>> {
        self.check_writable()?;
        Ok(self.streams.remove(name))
    }

    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub(crate) fn put_stream(&mut self, name: String, data: Bytes) {
        self.streams.insert(name, data);
    }

    pub(crate) fn take_stream(&mut self, name: &str) -> Option<Bytes> {
        self.streams.remove(name)
    }

    #[must_use]
    pub fn storage(&self, name: &str) -> Option<&Storage> {
        self.storages.get(name)
    }

    pub fn set_storage(&mut self, name: &str, storage: Storage) -> Result<()> {
        self.check_writable()?;
        self.storages.insert(name.to_string(), storage);
        Ok(())
    }

    pub fn remove_storage(&mut self, name: &str) -> Result<Option<Storage>> {
        self.check_writable()?;
        Ok(self.storages.remove(name))
    }

    pub fn storage_names(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }

    /// Transforms applied so far, oldest first.
    #[must_use]
    pub fn transforms(&self) -> &[Storage] {
        &self.transforms
    }

    // ---- summary information ----

    /// Summary information, empty when the stream is absent.
    pub fn summary_info(&self) -> Result<SummaryInfo> {
        match self.streams.get(SUMMARY_INFO_STREAM) {
            Some(data) => SummaryInfo::load(data),
            None => Ok(SummaryInfo::new()),
        }
    }

    pub fn set_summary_info(&mut self, info: &SummaryInfo) -> Result<()> {
        self.set_stream(SUMMARY_INFO_STREAM, info.to_bytes())
    }

    // ---- commit ----

    /// Writes everything to the output path and starts a new transaction.
    ///
    /// The database is not locked; callers must serialize commits from
    /// different handles to the same file themselves.
    pub fn commit(&mut self) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            debug!("commit on read-only database ignored");
            return Ok(());
        }
        let outpath = self
            .outpath
            .clone()
            .ok_or_else(|| MsiError::failed("database has no output path"))?;

        // every table has to be decoded with the current string ref width
        let mut names = vec![TABLES_TABLE.to_string(), COLUMNS_TABLE.to_string()];
        names.extend(self.table_names()?);
        for name in &names {
            self.load_table(name)?;
        }

        let mut out = Storage::new(self.class_id);

        let (pool, data, bytes_per_strref) = self.strings.save();
        out.set_stream(&encode_stream_name(STRING_POOL_STREAM, true), pool);
        out.set_stream(&encode_stream_name(STRING_DATA_STREAM, true), data);

        for (name, st) in &self.storages {
            out.set_storage(name, st.clone());
        }

        for (name, bytes) in &self.streams {
            out.set_stream(&encode_stream_name(name, false), bytes.clone());
        }

        for name in &names {
            let table = self.table(name)?;
            if !table.is_persistent() {
                continue;
            }
            out.set_stream(&encode_stream_name(name, true), table.save(bytes_per_strref));
        }

        storage::save_storage(&out, &outpath)?;
        info!(path = %outpath.display(), tables = names.len(), "committed database");

        self.storage = out;
        self.path = Some(outpath);
        self.mode = OpenMode::Transact;
        self.start_transaction();
        Ok(())
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl SummaryInfo {
    /// Writes these properties back as the database's summary stream.
    pub fn persist(&self, db: &mut Database) -> Result<()> {
        db.set_summary_info(self)
    }
}
