use tracing::debug;

use super::{View, check_column, column_bit};
use crate::core::column::{ColumnInfo, bias_encode};
use crate::core::{MsiError, Persistence, Record, Result, Stream, Table, NULL_INT};
use crate::database::Database;

/// Leaf view over one table of the database's table cache.
pub struct TableView {
    name: String,
    columns: Vec<ColumnInfo>,
}

impl TableView {
    /// Loads `name` into the cache; fails with `InvalidTable` if it does not exist.
    pub fn new(db: &mut Database, name: &str) -> Result<Self> {
        let columns = db.load_table(name)?.columns.clone();
        Ok(Self {
            name: name.to_string(),
            columns,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn table<'a>(&self, db: &'a Database) -> Result<&'a Table> {
        db.table(&self.name)
    }

    /// Raw cell value for a non-binary field without touching string refcounts.
    fn peek_raw(db: &Database, col: &ColumnInfo, rec: &Record, field: usize) -> Result<u32> {
        if rec.is_null(field) {
            return Ok(0);
        }
        if col.is_string() {
            return Ok(db.strings().id_of(&rec.get_string(field)).unwrap_or(0));
        }
        match rec.get_int(field) {
            NULL_INT => Ok(0),
            v => bias_encode(v, col.int_width()),
        }
    }

    /// Row whose key columns match the key fields of `rec`, if any.
    pub(crate) fn find_row_by_keys(&self, db: &Database, rec: &Record) -> Result<Option<usize>> {
        if !self.columns.iter().any(ColumnInfo::is_key) {
            return Ok(None);
        }
        let mut values = vec![0; self.columns.len()];
        for (i, col) in self.columns.iter().enumerate() {
            if col.is_key() {
                values[i] = Self::peek_raw(db, col, rec, i + 1)?;
            }
        }
        Ok(self.table(db)?.find_insert_index(&values).ok())
    }

    fn encode_field(
        db: &mut Database,
        col: &ColumnInfo,
        rec: &Record,
        field: usize,
        persistence: Persistence,
    ) -> Result<u32> {
        if rec.is_null(field) {
            return Ok(0);
        }
        if col.is_binary() {
            return Ok(u32::from(rec.is_stream(field)));
        }
        if col.is_string() {
            let text = rec.get_string(field);
            return Ok(db.strings_mut().add(&text, persistence));
        }
        match rec.get_int(field) {
            NULL_INT => Ok(0),
            v => bias_encode(v, col.int_width()),
        }
    }

    /// Fails when `field` cannot be stored in `col`. Touches nothing.
    fn validate_field(&self, col: &ColumnInfo, rec: &Record, field: usize) -> Result<()> {
        let is_null = if rec.is_null(field) {
            true
        } else if col.is_binary() {
            !rec.is_stream(field)
        } else if col.is_string() {
            rec.get_string(field).is_empty()
        } else {
            match rec.get_int(field) {
                NULL_INT => true,
                v => bias_encode(v, col.int_width()).map(|_| false)?,
            }
        };
        if is_null && !col.is_nullable() {
            return Err(MsiError::InvalidData(format!(
                "column {}.{} may not be NULL",
                self.name, col.name
            )));
        }
        Ok(())
    }
}

fn persistence_of(persistent: bool) -> Persistence {
    if persistent { Persistence::Persistent } else { Persistence::NonPersistent }
}

impl View for TableView {
    fn fetch_int(&self, db: &Database, row: usize, col: usize) -> Result<u32> {
        let col = check_column(col, self.columns.len())?;
        self.table(db)?.cell(row, col).ok_or(MsiError::InvalidParameter)
    }

    fn fetch_stream(&self, db: &Database, row: usize, col: usize) -> Result<Stream> {
        let idx = check_column(col, self.columns.len())?;
        if !self.columns[idx].is_binary() {
            return Err(MsiError::InvalidDatatype);
        }
        let table = self.table(db)?;
        let name = db.row_stream_name(table, row)?;
        db.stream(&name).ok_or(MsiError::NotFound(name))
    }

    fn set_row(&mut self, db: &mut Database, row: usize, rec: &Record, mask: u64) -> Result<()> {
        db.check_writable()?;
        let table = self.table(db)?;
        let current = table.row(row).ok_or(MsiError::InvalidParameter)?.to_vec();
        let persistence = persistence_of(table.is_row_persistent(row));

        // every check runs before the first write: a rejected update leaves the row untouched
        let mut changed = Vec::new();
        for (i, col) in self.columns.iter().enumerate() {
            if mask & column_bit(i) == 0 {
                continue;
            }
            if col.is_key() {
                if Self::peek_raw(db, col, rec, i + 1)? != current[i] {
                    return Err(MsiError::failed(format!("cannot change key column {}.{}", self.name, col.name)));
                }
                continue;
            }
            self.validate_field(col, rec, i + 1)?;
            changed.push(i);
        }
        if changed.is_empty() {
            return Ok(());
        }

        for i in changed {
            let (col, field) = (&self.columns[i], i + 1);
            if col.is_binary() {
                let stream_name = db.row_stream_name(self.table(db)?, row)?;
                if rec.is_stream(field) {
                    db.put_stream(stream_name, rec.get_stream(field)?.into_bytes());
                } else {
                    db.take_stream(&stream_name);
                }
            }
            let raw = Self::encode_field(db, col, rec, field, persistence)?;
            db.replace_cell(&self.name, row, i, raw)?;
        }
        Ok(())
    }

    fn insert_row(&mut self, db: &mut Database, rec: &Record, temporary: bool) -> Result<()> {
        db.check_writable()?;
        let persistent = !temporary && self.table(db)?.is_persistent();
        let persistence = persistence_of(persistent);

        let mut values = Vec::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            match Self::encode_field(db, col, rec, i + 1, persistence) {
                Ok(v) => values.push(v),
                Err(e) => {
                    db.release_cells(&self.columns, &values, persistent);
                    return Err(e);
                }
            }
        }
        let row = match db.table_mut(&self.name)?.insert_row(values.clone(), persistent) {
            Ok(row) => row,
            Err(e) => {
                db.release_cells(&self.columns, &values, persistent);
                return Err(e);
            }
        };

        for (i, col) in self.columns.iter().enumerate() {
            if col.is_binary() && rec.is_stream(i + 1) {
                let stream_name = db.row_stream_name(self.table(db)?, row)?;
                db.put_stream(stream_name, rec.get_stream(i + 1)?.into_bytes());
            }
        }
        debug!(table = %self.name, row, persistent, "inserted row");
        Ok(())
    }

    fn delete_row(&mut self, db: &mut Database, row: usize) -> Result<()> {
        db.check_writable()?;
        if self.columns.iter().any(ColumnInfo::is_binary) {
            let stream_name = db.row_stream_name(self.table(db)?, row)?;
            db.take_stream(&stream_name);
        }
        db.remove_row(&self.name, row)
    }

    fn execute(&mut self, db: &mut Database, _params: Option<&Record>) -> Result<()> {
        db.load_table(&self.name)?;
        Ok(())
    }

    fn get_dimensions(&self, db: &Database) -> Result<(usize, usize)> {
        Ok((self.table(db)?.row_count(), self.columns.len()))
    }

    fn get_column_info(&self, _db: &Database, col: usize) -> Result<ColumnInfo> {
        let idx = check_column(col, self.columns.len())?;
        Ok(self.columns[idx].clone())
    }

    fn add_column(&mut self, db: &mut Database, column: &ColumnInfo) -> Result<()> {
        db.add_column(&self.name, column)?;
        self.columns = self.table(db)?.columns.clone();
        Ok(())
    }

    fn drop_table(&mut self, db: &mut Database) -> Result<()> {
        db.drop_table(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;
    use crate::core::column::{MSITYPE_KEY, MSITYPE_NULLABLE, TYPE_BINARY, TYPE_SHORT, type_string};

    fn setup() -> Database {
        let mut db = Database::new();
        let columns = vec![
            ColumnInfo::new("Binary", 1, "Name", type_string(72) | MSITYPE_KEY),
            ColumnInfo::new("Binary", 2, "Size", TYPE_SHORT | MSITYPE_NULLABLE),
            ColumnInfo::new("Binary", 3, "Data", TYPE_BINARY | MSITYPE_NULLABLE),
        ];
        db.create_table("Binary", &columns, true).unwrap();
        db
    }

    #[test]
    fn test_insert_and_fetch() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let mut rec = Record::from_fields(vec![Field::Str("icon".into()), Field::Int(-1), Field::Null]).unwrap();
        rec.set_stream(3, Stream::new(b"\x89PNG".to_vec())).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        view.execute(&mut db, None).unwrap();

        assert_eq!(view.get_dimensions(&db).unwrap(), (1, 3));
        assert_eq!(view.fetch_int(&db, 0, 2).unwrap(), 0x7FFF);
        assert_eq!(view.fetch_int(&db, 0, 3).unwrap(), 1);
        assert!(db.stream("Binary.icon").is_some());

        let row = view.get_row(&db, 0).unwrap();
        assert_eq!(row.get_string(1), "icon");
        assert_eq!(row.get_int(2), -1);
        assert_eq!(row.get_stream(3).unwrap().len(), 4);
    }

    #[test]
    fn test_set_row_rejects_key_change() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let rec = Record::from_fields(vec![Field::Str("a".into()), Field::Int(1), Field::Null]).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();

        let changed = Record::from_fields(vec![Field::Str("b".into()), Field::Int(2), Field::Null]).unwrap();
        assert!(matches!(view.set_row(&mut db, 0, &changed, 0b11), Err(MsiError::FunctionFailed(_))));
        assert_eq!(view.fetch_int(&db, 0, 2).unwrap(), 0x8001);

        view.set_row(&mut db, 0, &changed, 0b10).unwrap();
        assert_eq!(view.fetch_int(&db, 0, 2).unwrap(), 0x8002);
    }

    #[test]
    fn test_rejected_update_leaves_row_untouched() {
        let mut db = Database::new();
        let columns = vec![
            ColumnInfo::new("Icon", 1, "Name", type_string(72) | MSITYPE_KEY),
            ColumnInfo::new("Icon", 2, "Title", type_string(64) | MSITYPE_NULLABLE),
            ColumnInfo::new("Icon", 3, "Data", TYPE_BINARY | MSITYPE_NULLABLE),
            ColumnInfo::new("Icon", 4, "Size", TYPE_SHORT),
        ];
        db.create_table("Icon", &columns, true).unwrap();
        let mut view = TableView::new(&mut db, "Icon").unwrap();
        let mut rec = Record::from_fields(vec![Field::Str("app".into()), Field::Str("old".into()), Field::Null, Field::Int(5)])
            .unwrap();
        rec.set_stream(3, Stream::new(b"ICO".to_vec())).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();

        let update = Record::from_fields(vec![Field::Str("app".into()), Field::Str("new".into()), Field::Null, Field::Null])
            .unwrap();
        assert!(matches!(view.set_row(&mut db, 0, &update, 0b1110), Err(MsiError::InvalidData(_))));

        let row = view.get_row(&db, 0).unwrap();
        assert_eq!(row.get_string(2), "old");
        assert_eq!(row.get_int(4), 5);
        assert_eq!(db.stream("Icon.app").map(|s| s.len()), Some(3));
        assert_eq!(db.strings().id_of("new"), None);
    }

    #[test]
    fn test_overwritten_and_deleted_strings_are_released() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let rec = Record::from_fields(vec![Field::Str("ghost".into())]).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        let ghost = db.strings().id_of("ghost").unwrap();
        assert_eq!(db.strings().refcounts(ghost), (1, 0));

        view.delete_row(&mut db, 0).unwrap();
        assert_eq!(db.strings().refcounts(ghost), (0, 0));
        let (pool, data, _) = db.strings_mut().save();
        let reloaded = crate::core::StringTable::load(&pool, &data).unwrap();
        assert_eq!(reloaded.id_of("ghost"), None);
        assert_eq!(reloaded.lookup(ghost), None);

        let columns = vec![
            ColumnInfo::new("Label", 1, "Id", TYPE_SHORT | MSITYPE_KEY),
            ColumnInfo::new("Label", 2, "Text", type_string(0) | MSITYPE_NULLABLE),
        ];
        db.create_table("Label", &columns, true).unwrap();
        let mut labels = TableView::new(&mut db, "Label").unwrap();
        let first = Record::from_fields(vec![Field::Int(1), Field::Str("before".into())]).unwrap();
        labels.insert_row(&mut db, &first, false).unwrap();
        let second = Record::from_fields(vec![Field::Int(1), Field::Str("after".into())]).unwrap();
        labels.set_row(&mut db, 0, &second, 0b10).unwrap();
        assert_eq!(db.strings().id_of("before"), None);
        labels.set_row(&mut db, 0, &second, 0b10).unwrap();
        let after = db.strings().id_of("after").unwrap();
        assert_eq!(db.strings().refcounts(after), (1, 0));
    }

    #[test]
    fn test_failed_insert_keeps_no_strings() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let rec = Record::from_fields(vec![Field::Str("dup".into())]).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        let id = db.strings().id_of("dup").unwrap();
        assert!(view.insert_row(&mut db, &rec, false).is_err());
        assert_eq!(db.strings().refcounts(id), (1, 0));
    }

    #[test]
    fn test_zero_reads_back_null() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let rec = Record::from_fields(vec![Field::Str("z".into()), Field::Int(0), Field::Null]).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        assert_eq!(view.fetch_int(&db, 0, 2).unwrap(), 0x8000);
        assert!(view.get_row(&db, 0).unwrap().is_null(2));
    }

    #[test]
    fn test_delete_removes_streams() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let mut rec = Record::new(3).unwrap();
        rec.set_string(1, "blob").unwrap();
        rec.set_stream(3, Stream::new(vec![1u8, 2, 3])).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        view.delete_row(&mut db, 0).unwrap();
        assert_eq!(view.get_dimensions(&db).unwrap().0, 0);
        assert!(db.stream("Binary.blob").is_none());
    }

    #[test]
    fn test_add_column_extends_rows() {
        let mut db = setup();
        let mut view = TableView::new(&mut db, "Binary").unwrap();
        let rec = Record::from_fields(vec![Field::Str("a".into())]).unwrap();
        view.insert_row(&mut db, &rec, false).unwrap();
        view.add_column(&mut db, &ColumnInfo::new("Binary", 0, "Extra", TYPE_SHORT | MSITYPE_NULLABLE))
            .unwrap();
        assert_eq!(view.get_dimensions(&db).unwrap(), (1, 4));
        assert_eq!(view.fetch_int(&db, 0, 4).unwrap(), 0);
        assert_eq!(db.columns("Binary").unwrap()[3].number, 4);
    }

    #[test]
    fn test_unknown_table() {
        let mut db = Database::new();
        assert!(matches!(TableView::new(&mut db, "Missing"), Err(MsiError::InvalidTable(_))));
    }
}
