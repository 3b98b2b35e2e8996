use super::{View, check_column};
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Persistence, Record, Result, Stream, StringId};
use crate::database::{Database, STREAMS_TABLE, catalog_columns};

/// The `_Streams` pseudo-table: one row per raw database stream.
pub struct StreamsView {
    columns: Vec<ColumnInfo>,
    /// Snapshot of stream names with their (non-persistent) string ids.
    rows: Vec<(String, StringId)>,
}

impl StreamsView {
    pub fn new(db: &mut Database) -> Result<Self> {
        let columns = catalog_columns(STREAMS_TABLE).ok_or_else(|| MsiError::InvalidTable(STREAMS_TABLE.into()))?;
        let mut view = Self { columns, rows: Vec::new() };
        view.refresh(db);
        Ok(view)
    }

    fn refresh(&mut self, db: &mut Database) {
        let names: Vec<String> = db.stream_names().map(str::to_string).collect();
        self.rows = names
            .into_iter()
            .map(|name| {
                let id = match db.strings().id_of(&name) {
                    Some(id) => id,
                    None => db.strings_mut().add(&name, Persistence::NonPersistent),
                };
                (name, id)
            })
            .collect();
    }

    fn row_name(&self, row: usize) -> Result<&str> {
        self.rows
            .get(row)
            .map(|(name, _)| name.as_str())
            .ok_or(MsiError::InvalidParameter)
    }
}

impl View for StreamsView {
    fn fetch_int(&self, _db: &Database, row: usize, col: usize) -> Result<u32> {
        let col = check_column(col, self.columns.len())?;
        let (_, id) = self.rows.get(row).ok_or(MsiError::InvalidParameter)?;
        Ok(if col == 0 { *id } else { 1 })
    }

    fn fetch_stream(&self, db: &Database, row: usize, col: usize) -> Result<Stream> {
        if check_column(col, self.columns.len())? != 1 {
            return Err(MsiError::InvalidDatatype);
        }
        let name = self.row_name(row)?;
        db.stream(name).ok_or_else(|| MsiError::NotFound(name.to_string()))
    }

    fn set_row(&mut self, db: &mut Database, row: usize, rec: &Record, mask: u64) -> Result<()> {
        let name = self.row_name(row)?.to_string();
        if mask & 1 != 0 && rec.get_string(1) != name {
            return Err(MsiError::failed("cannot rename a stream"));
        }
        if mask & 2 != 0 {
            let data = rec.get_stream(2).map(Stream::into_bytes).unwrap_or_default();
            db.set_stream(&name, data)?;
        }
        Ok(())
    }

    fn insert_row(&mut self, db: &mut Database, rec: &Record, _temporary: bool) -> Result<()> {
        let name = rec.get_string(1);
        if name.is_empty() {
            return Err(MsiError::InvalidData("stream name may not be NULL".into()));
        }
        if db.stream(&name).is_some() {
            return Err(MsiError::failed(format!("stream {name} already exists")));
        }
        let data = rec.get_stream(2).map(Stream::into_bytes).unwrap_or_default();
        db.set_stream(&name, data)?;
        self.refresh(db);
        Ok(())
    }

    fn delete_row(&mut self, db: &mut Database, row: usize) -> Result<()> {
        let name = self.row_name(row)?.to_string();
        db.remove_stream(&name)?;
        self.rows.remove(row);
        Ok(())
    }

    fn execute(&mut self, db: &mut Database, _params: Option<&Record>) -> Result<()> {
        self.refresh(db);
        Ok(())
    }

    fn get_dimensions(&self, _db: &Database) -> Result<(usize, usize)> {
        Ok((self.rows.len(), self.columns.len()))
    }

    fn get_column_info(&self, _db: &Database, col: usize) -> Result<ColumnInfo> {
        let idx = check_column(col, self.columns.len())?;
        Ok(self.columns[idx].clone())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}
