use tracing::debug;

use super::select::find_column;
use super::where_view::open_table;
use super::{
    CreateView, DeleteView, DistinctView, DropView, InsertView, SelectView, UpdateView, View, WhereView,
};
use crate::core::column::type_code;
use crate::core::{MsiError, Record, Result};
use crate::database::Database;
use crate::parser::{Statement, parse_statement};

/// Which column description [`Query::column_info`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnInfoKind {
    Names,
    /// IDT type codes such as `s72` or `I2`.
    Types,
}

/// Builds the view tree for a parsed statement.
pub fn build_view(db: &mut Database, stmt: &Statement) -> Result<Box<dyn View>> {
    match stmt {
        Statement::Select { distinct, columns, tables, filter, order_by } => {
            let mut view: Box<dyn View> = if tables.len() == 1 && filter.is_none() && order_by.is_empty() {
                open_table(db, &tables[0])?
            } else {
                let mut wv = WhereView::new(db, tables, filter.as_ref())?;
                if !order_by.is_empty() {
                    let cols = order_by
                        .iter()
                        .map(|c| find_column(&wv, db, c))
                        .collect::<Result<Vec<_>>>()?;
                    wv.sort(db, &cols)?;
                }
                Box::new(wv)
            };
            if !columns.is_empty() {
                view = Box::new(SelectView::new(db, view, columns)?);
            }
            if *distinct {
                view = Box::new(DistinctView::new(view));
            }
            Ok(view)
        }
        Statement::Insert { table, columns, values, temporary } => {
            Ok(Box::new(InsertView::new(db, table, columns, values, *temporary)?))
        }
        Statement::Update { table, assignments, filter } => {
            Ok(Box::new(UpdateView::new(db, table, assignments, filter.as_ref())?))
        }
        Statement::Delete { table, filter } => {
            let inner = WhereView::new(db, std::slice::from_ref(table), filter.as_ref())?;
            Ok(Box::new(DeleteView::new(Box::new(inner))))
        }
        Statement::CreateTable { name, columns, primary_keys, hold } => {
            if *hold {
                debug!(table = %name, "HOLD ignored");
            }
            Ok(Box::new(CreateView::new(db, name, columns, primary_keys)?))
        }
        Statement::DropTable { name } => Ok(Box::new(DropView::new(db, name)?)),
    }
}

/// An open query: a view tree plus a fetch cursor.
///
/// The view is released by [`Query::close`] or when the query is dropped.
pub struct Query<'db> {
    db: &'db mut Database,
    view: Option<Box<dyn View>>,
    cursor: usize,
}

impl<'db> Query<'db> {
    pub fn new(db: &'db mut Database, sql: &str) -> Result<Self> {
        let stmt = parse_statement(sql)?;
        debug!(?stmt, "parsed query");
        let view = build_view(db, &stmt)?;
        Ok(Self { db, view: Some(view), cursor: 0 })
    }

    fn view(&self) -> Result<&dyn View> {
        self.view.as_deref().ok_or(MsiError::InvalidParameter)
    }

    /// Runs the statement, binding `?` wildcards from `params`, and rewinds the cursor.
    pub fn execute(&mut self, params: Option<&Record>) -> Result<()> {
        let view = self.view.as_mut().ok_or(MsiError::InvalidParameter)?;
        view.execute(self.db, params)?;
        self.cursor = 0;
        Ok(())
    }

    /// Next result row, `None` once exhausted.
    pub fn fetch(&mut self) -> Result<Option<Record>> {
        let view = self.view()?;
        let (rows, _) = view.get_dimensions(self.db)?;
        if self.cursor >= rows {
            return Ok(None);
        }
        let rec = view.get_row(self.db, self.cursor)?;
        self.cursor += 1;
        Ok(Some(rec))
    }

    pub fn column_info(&self, kind: ColumnInfoKind) -> Result<Record> {
        let view = self.view()?;
        let (_, cols) = view.get_dimensions(self.db)?;
        let mut rec = Record::new(cols)?;
        for col in 1..=cols {
            let info = view.get_column_info(self.db, col)?;
            match kind {
                ColumnInfoKind::Names => rec.set_string(col, &info.name)?,
                ColumnInfoKind::Types => rec.set_string(col, &type_code(info.ty, info.temporary))?,
            }
        }
        Ok(rec)
    }

    /// Executes and hands every result row to `f`; returns the row count.
    pub fn iterate<F>(&mut self, params: Option<&Record>, mut f: F) -> Result<usize>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        self.execute(params)?;
        let mut count = 0;
        while let Some(rec) = self.fetch()? {
            f(&rec)?;
            count += 1;
        }
        Ok(count)
    }

    #[must_use]
    pub fn database(&mut self) -> &mut Database {
        self.db
    }

    /// Releases the view. Further calls are no-ops.
    pub fn close(&mut self) -> Result<()> {
        match self.view.take() {
            Some(mut view) => view.close(),
            None => Ok(()),
        }
    }
}

impl Drop for Query<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing query failed");
        }
    }
}

impl Database {
    pub fn open_query(&mut self, sql: &str) -> Result<Query<'_>> {
        Query::new(self, sql)
    }

    /// Opens, executes and closes a statement that returns no rows.
    pub fn execute_sql(&mut self, sql: &str) -> Result<()> {
        let mut query = self.open_query(sql)?;
        query.execute(None)?;
        query.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;

    fn sample() -> Database {
        let mut db = Database::new();
        db.execute_sql(
            "CREATE TABLE `Feature` (`Feature` CHAR(38) NOT NULL, `Title` CHAR(64), `Level` SHORT NOT NULL PRIMARY KEY `Feature`)",
        )
        .unwrap();
        for (f, t, l) in [("Main", "Main Feature", 1), ("Docs", "Documentation", 3), ("Extras", "", 3)] {
            let mut q = db
                .open_query("INSERT INTO `Feature` (`Feature`, `Title`, `Level`) VALUES (?, ?, ?)")
                .unwrap();
            let params =
                Record::from_fields(vec![Field::Str(f.into()), Field::Str(t.into()), Field::Int(l)]).unwrap();
            q.execute(Some(&params)).unwrap();
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
    fn test_select_variants() {
        let mut db = sample();
        // rows are kept in string-id order, which follows insertion here
        assert_eq!(rows(&mut db, "SELECT `Feature` FROM `Feature`"), vec!["Main", "Docs", "Extras"]);
        assert_eq!(
            rows(&mut db, "SELECT `Feature`, `Level` FROM `Feature` WHERE `Level` = 3 ORDER BY `Feature`"),
            vec!["Docs\t3", "Extras\t3"]
        );
        assert_eq!(rows(&mut db, "SELECT DISTINCT `Level` FROM `Feature`"), vec!["1", "3"]);
        assert_eq!(rows(&mut db, "SELECT `Feature` FROM `Feature` WHERE `Title` IS NULL"), vec!["Extras"]);
    }

    #[test]
    fn test_update_and_delete() {
        let mut db = sample();
        {
            let mut q = db.open_query("UPDATE `Feature` SET `Level` = ? WHERE `Feature` = ?").unwrap();
            let params = Record::from_fields(vec![Field::Int(5), Field::Str("Main".into())]).unwrap();
            q.execute(Some(&params)).unwrap();
            q.close().unwrap();
        }
        assert_eq!(rows(&mut db, "SELECT `Level` FROM `Feature` WHERE `Feature` = 'Main'"), vec!["5"]);

        assert!(matches!(
            db.execute_sql("UPDATE `Feature` SET `Feature` = 'Other' WHERE `Level` = 5"),
            Err(MsiError::FunctionFailed(_))
        ));

        db.execute_sql("DELETE FROM `Feature` WHERE `Level` = 3").unwrap();
        assert_eq!(rows(&mut db, "SELECT `Feature` FROM `Feature`"), vec!["Main"]);
    }

    #[test]
    fn test_column_info() {
        let mut db = sample();
        let q = db.open_query("SELECT * FROM `Feature`").unwrap();
        assert_eq!(q.column_info(ColumnInfoKind::Names).unwrap().to_string(), "Feature\tTitle\tLevel");
        assert_eq!(q.column_info(ColumnInfoKind::Types).unwrap().to_string(), "s38\tS64\ti2");
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut db = sample();
        let mut q = db.open_query("SELECT * FROM `Feature`").unwrap();
        q.execute(None).unwrap();
        q.close().unwrap();
        q.close().unwrap();
        assert!(matches!(q.fetch(), Err(MsiError::InvalidParameter)));
    }

    #[test]
    fn test_bad_queries() {
        let mut db = sample();
        assert!(matches!(db.open_query("SELEC * FROM x"), Err(MsiError::BadQuerySyntax(_))));
        assert!(matches!(db.open_query("SELECT * FROM `Missing`"), Err(MsiError::InvalidTable(_))));
        assert!(matches!(
            db.open_query("SELECT * FROM `Feature` WHERE `Title` < 'x'"),
            Err(MsiError::BadQuerySyntax(_))
        ));
        assert!(matches!(
            db.open_query("INSERT INTO `Feature` (`Feature`) VALUES ('a', 'b')"),
            Err(MsiError::BadQuerySyntax(_))
        ));
    }
}
