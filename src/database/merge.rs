//! Merging the tables of one database into another.

use tracing::{debug, info};

use super::Database;
use crate::core::column::bias_decode;
use crate::core::{MsiError, Record, Result, Table};
use crate::executor::{TableView, View};

/// Rows of one table whose keys exist in the target with different data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub table: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub conflicts: Vec<MergeConflict>,
    /// Tables that did not exist in the target.
    pub tables_created: Vec<String>,
    pub rows_inserted: usize,
}

impl MergeOutcome {
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Source rows of one table that would be inserted.
struct TablePlan {
    name: String,
    create: bool,
    rows: Vec<Record>,
}

impl Database {
    /// Decodes a row into a record, keeping stored zeros as `0`.
    pub(crate) fn row_record(&self, table: &Table, row: usize) -> Result<Record> {
        let cells = table.row(row).ok_or(MsiError::InvalidParameter)?;
        let mut rec = Record::new(cells.len())?;
        for (i, (col, &raw)) in table.columns.iter().zip(cells).enumerate() {
            if raw == 0 {
                continue;
            }
            if col.is_binary() {
                let name = self.row_stream_name(table, row)?;
                if let Some(stream) = self.stream(&name) {
                    rec.set_stream(i + 1, stream)?;
                }
            } else if col.is_string() {
                rec.set_string(i + 1, self.strings().lookup(raw).unwrap_or(""))?;
            } else if let Some(v) = bias_decode(raw, col.int_width()) {
                rec.set_int(i + 1, v)?;
            }
        }
        Ok(rec)
    }

    fn check_merge_schema(&mut self, source: &Table) -> Result<()> {
        let target = self.columns(&source.name)?;
        if target.len() != source.columns.len() {
            return Err(MsiError::DatatypeMismatch(format!("column count of {} differs", source.name)));
        }
        for (t, s) in target.iter().zip(&source.columns) {
            if t.name != s.name || t.ty != s.ty {
                return Err(MsiError::DatatypeMismatch(format!(
                    "column {}.{} differs",
                    source.name, s.name
                )));
            }
        }
        Ok(())
    }

    /// Merges every table of `source` into this database.
    ///
    /// A source row whose key already exists here with different data is a
    /// conflict. Rows are only inserted when no table has conflicts;
    /// otherwise nothing changes except that, given a `label`, a table of
    /// that name receives one `(Table, NumRowMergeConflicts)` row per
    /// conflicting table.
    pub fn merge(&mut self, source: &mut Database, label: Option<&str>) -> Result<MergeOutcome> {
        self.check_writable()?;
        let mut outcome = MergeOutcome::default();
        let mut plans = Vec::new();

        for name in source.table_names()? {
            let table = source.load_table(&name)?.clone();
            let create = !self.table_exists(&name);
            let mut plan = TablePlan { name: name.clone(), create, rows: Vec::new() };
            let mut conflicts = 0;

            if create {
                for row in 0..table.row_count() {
                    plan.rows.push(source.row_record(&table, row)?);
                }
            } else {
                self.check_merge_schema(&table)?;
                let view = TableView::new(self, &name)?;
                let target = self.table(&name)?.clone();
                for row in 0..table.row_count() {
                    let rec = source.row_record(&table, row)?;
                    match view.find_row_by_keys(self, &rec)? {
                        None => plan.rows.push(rec),
                        Some(existing) => {
                            if self.row_record(&target, existing)? != rec {
                                conflicts += 1;
                            }
                        }
                    }
                }
            }

            if conflicts > 0 {
                debug!(table = %name, conflicts, "merge conflicts");
                outcome.conflicts.push(MergeConflict { table: name, rows: conflicts });
            }
            plans.push((plan, table));
        }

        if outcome.has_conflicts() {
            if let Some(label) = label {
                self.write_merge_errors(label, &outcome.conflicts)?;
            }
            info!(tables = outcome.conflicts.len(), "merge aborted by conflicts");
            return Ok(outcome);
        }

        for (plan, table) in plans {
            if plan.create {
                self.create_table(&plan.name, &table.columns, table.is_persistent())?;
                outcome.tables_created.push(plan.name.clone());
            }
            let mut view = TableView::new(self, &plan.name)?;
            for rec in &plan.rows {
                view.insert_row(self, rec, false)?;
            }
            outcome.rows_inserted += plan.rows.len();
        }
        info!(
            created = outcome.tables_created.len(),
            rows = outcome.rows_inserted,
            "merge applied"
        );
        Ok(outcome)
    }

    fn write_merge_errors(&mut self, label: &str, conflicts: &[MergeConflict]) -> Result<()> {
        if !self.table_exists(label) {
            self.execute_sql(&format!(
                "CREATE TABLE `{label}` (`Table` CHAR(255) NOT NULL, `NumRowMergeConflicts` SHORT NOT NULL PRIMARY KEY `Table`)"
            ))?;
        }
        let mut query = self.open_query(&format!(
            "INSERT INTO `{label}` (`Table`, `NumRowMergeConflicts`) VALUES (?, ?)"
        ))?;
        for conflict in conflicts {
            let mut params = Record::new(2)?;
            params.set_string(1, &conflict.table)?;
            params.set_int(2, i32::try_from(conflict.rows).unwrap_or(i32::from(i16::MAX)))?;
            query.execute(Some(&params))?;
        }
        query.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with(rows: &[(&str, &str)]) -> Database {
        let mut db = Database::new();
        db.execute_sql("CREATE TABLE `Property` (`Property` CHAR(72) NOT NULL, `Value` CHAR(0) PRIMARY KEY `Property`)")
            .unwrap();
        for (k, v) in rows {
            db.execute_sql(&format!("INSERT INTO `Property` (`Property`, `Value`) VALUES ('{k}', '{v}')"))
                .unwrap();
        }
        db
    }

    fn value_of(db: &mut Database, key: &str) -> String {
        let mut q = db
            .open_query(&format!("SELECT `Value` FROM `Property` WHERE `Property` = '{key}'"))
            .unwrap();
        q.execute(None).unwrap();
        q.fetch().unwrap().map(|r| r.get_string(1)).unwrap_or_default()
    }

    #[test]
    fn test_conflict_leaves_target_unchanged() {
        let mut target = db_with(&[("pk1", "a")]);
        let mut source = db_with(&[("pk1", "b"), ("pk2", "c")]);
        let outcome = target.merge(&mut source, Some("MergeErrors")).unwrap();
        assert_eq!(outcome.conflicts, vec![MergeConflict { table: "Property".into(), rows: 1 }]);
        assert_eq!(value_of(&mut target, "pk1"), "a");
        assert_eq!(value_of(&mut target, "pk2"), "");

        let mut q = target.open_query("SELECT * FROM `MergeErrors`").unwrap();
        q.execute(None).unwrap();
        assert_eq!(q.fetch().unwrap().unwrap().to_string(), "Property\t1");
    }

    #[test]
    fn test_clean_merge_inserts_and_creates() {
        let mut target = db_with(&[("pk1", "a")]);
        let mut source = db_with(&[("pk1", "a"), ("pk2", "c")]);
        source
            .execute_sql("CREATE TABLE `Extra` (`Id` SHORT NOT NULL PRIMARY KEY `Id`)")
            .unwrap();
        source.execute_sql("INSERT INTO `Extra` (`Id`) VALUES (0)").unwrap();

        let outcome = target.merge(&mut source, None).unwrap();
        assert!(!outcome.has_conflicts());
        assert_eq!(outcome.tables_created, vec!["Extra".to_string()]);
        assert_eq!(outcome.rows_inserted, 2);
        assert_eq!(value_of(&mut target, "pk2"), "c");
        assert_eq!(target.table("Extra").unwrap().cell(0, 0), Some(0x8000));
    }

    #[test]
    fn test_schema_mismatch() {
        let mut target = db_with(&[]);
        let mut source = Database::new();
        source
            .execute_sql("CREATE TABLE `Property` (`Property` CHAR(72) NOT NULL, `Value` SHORT PRIMARY KEY `Property`)")
            .unwrap();
        assert!(matches!(target.merge(&mut source, None), Err(MsiError::DatatypeMismatch(_))));
    }
}
