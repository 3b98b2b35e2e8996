use std::collections::HashSet;

use tracing::debug;

use super::View;
use crate::core::column::{ColumnInfo, MAX_COLUMNS, MSITYPE_KEY};
use crate::core::{MsiError, Record, Result};
use crate::database::Database;
use crate::parser::ColumnDef;

/// `CREATE TABLE name (...) PRIMARY KEY ... [HOLD]`
pub struct CreateView {
    name: String,
    columns: Vec<ColumnInfo>,
    temporary: bool,
}

impl CreateView {
    pub fn new(db: &mut Database, name: &str, defs: &[ColumnDef], primary_keys: &[String]) -> Result<Self> {
        if db.table_exists(name) {
            return Err(MsiError::syntax(format!("table {name} already exists")));
        }
        if defs.is_empty() {
            return Err(MsiError::syntax("a table needs at least one column"));
        }
        if defs.len() > MAX_COLUMNS {
            return Err(MsiError::failed(format!("table {name} has more than {MAX_COLUMNS} columns")));
        }

        let mut seen = HashSet::new();
        for def in defs {
            if !seen.insert(def.name.as_str()) {
                return Err(MsiError::syntax(format!("duplicate column {}", def.name)));
            }
        }
        for key in primary_keys {
            if !seen.contains(key.as_str()) {
                return Err(MsiError::syntax(format!("primary key {key} is not a column")));
            }
        }

        let temporary = defs.iter().all(|d| d.temporary);
        let mut columns = Vec::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            let is_key = primary_keys.contains(&def.name);
            if is_key && def.temporary && !temporary {
                return Err(MsiError::failed(format!(
                    "temporary key column {} in a persistent table",
                    def.name
                )));
            }
            let ty = if is_key { def.ty | MSITYPE_KEY } else { def.ty };
            let mut info = ColumnInfo::new(name, i + 1, &def.name, ty);
            info.temporary = def.temporary;
            columns.push(info);
        }

        Ok(Self {
            name: name.to_string(),
            columns,
            temporary,
        })
    }
}

impl View for CreateView {
    fn fetch_int(&self, _db: &Database, _row: usize, _col: usize) -> Result<u32> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, _params: Option<&Record>) -> Result<()> {
        debug!(table = %self.name, temporary = self.temporary, "create table");
        db.create_table(&self.name, &self.columns, !self.temporary)
    }

    fn get_dimensions(&self, _db: &Database) -> Result<(usize, usize)> {
        Ok((0, 0))
    }

    fn get_column_info(&self, _db: &Database, _col: usize) -> Result<ColumnInfo> {
        Err(MsiError::InvalidParameter)
    }
}

/// `DROP TABLE name`
pub struct DropView {
    name: String,
}

impl DropView {
    pub fn new(db: &mut Database, name: &str) -> Result<Self> {
        if !db.table_exists(name) {
            return Err(MsiError::InvalidTable(name.to_string()));
        }
        Ok(Self { name: name.to_string() })
    }
}

impl View for DropView {
    fn fetch_int(&self, _db: &Database, _row: usize, _col: usize) -> Result<u32> {
        Err(MsiError::Unsupported)
    }

    fn execute(&mut self, db: &mut Database, _params: Option<&Record>) -> Result<()> {
        db.drop_table(&self.name)
    }

    fn get_dimensions(&self, _db: &Database) -> Result<(usize, usize)> {
        Ok((0, 0))
    }

    fn get_column_info(&self, _db: &Database, _col: usize) -> Result<ColumnInfo> {
        Err(MsiError::InvalidParameter)
    }
}
