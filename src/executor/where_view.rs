use tracing::debug;

use super::conditions::{BindTable, BoundExpr, Eval, Evaluator, bind, order_tables};
use super::{StreamsView, TableView, View, check_column, leading_columns};
use crate::core::column::ColumnInfo;
use crate::core::{MsiError, Record, Result, Stream};
use crate::database::{Database, STREAMS_TABLE};
use crate::parser::Expr;

/// Opens the leaf view for a table name.
pub(crate) fn open_table(db: &mut Database, name: &str) -> Result<Box<dyn View>> {
    if name == STREAMS_TABLE {
        Ok(Box::new(StreamsView::new(db)?))
    } else {
        Ok(Box::new(TableView::new(db, name)?))
    }
}

struct JoinTable {
    name: String,
    view: Box<dyn View>,
    columns: Vec<ColumnInfo>,
    /// Flattened index of this table's first column, 0-based.
    offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Raw(u32),
    Text(String),
}

/// Nested-loop join and filter over one or more tables.
///
/// The output column space is the concatenation of the joined tables'
/// columns, in FROM order. Each result row is a tuple holding one row
/// index per table.
pub struct WhereView {
    tables: Vec<JoinTable>,
    cond: Option<BoundExpr>,
    order_by: Vec<usize>,
    reorder: Vec<Vec<usize>>,
}

impl WhereView {
    pub fn new(db: &mut Database, tables: &[String], cond: Option<&Expr>) -> Result<Self> {
        if tables.is_empty() {
            return Err(MsiError::syntax("no tables to select from"));
        }
        let mut joined = Vec::with_capacity(tables.len());
        let mut offset = 0;
        for name in tables {
            let view = open_table(db, name)?;
            let (_, cols) = view.get_dimensions(db)?;
            let columns = (1..=cols)
                .map(|c| view.get_column_info(db, c))
                .collect::<Result<Vec<_>>>()?;
            joined.push(JoinTable { name: name.clone(), view, columns, offset });
            offset += cols;
        }

        let cond = match cond {
            Some(expr) => {
                let bind_tables: Vec<BindTable<'_>> = joined
                    .iter()
                    .map(|t| BindTable { name: &t.name, columns: &t.columns })
                    .collect();
                Some(bind(expr, &bind_tables)?)
            }
            None => None,
        };

        Ok(Self {
            tables: joined,
            cond,
            order_by: Vec::new(),
            reorder: Vec::new(),
        })
    }

    fn column_count(&self) -> usize {
        self.tables.iter().map(|t| t.columns.len()).sum()
    }

    /// Maps a flattened 1-based column to `(table, column within table)`.
    fn locate(&self, col: usize) -> Result<(usize, usize)> {
        let idx = check_column(col, self.column_count())?;
        self.tables
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| t.offset <= idx)
            .map(|(i, t)| (i, idx - t.offset + 1))
            .ok_or(MsiError::InvalidParameter)
    }

    fn tuple(&self, row: usize) -> Result<&[usize]> {
        self.reorder.get(row).map(Vec::as_slice).ok_or(MsiError::NoMoreItems)
    }

    fn check_condition(
        &self,
        db: &Database,
        order: &[usize],
        counts: &[usize],
        depth: usize,
        rows: &mut Vec<Option<usize>>,
        params: Option<&Record>,
        out: &mut Vec<Vec<usize>>,
    ) -> Result<()> {
        let t = order[depth];
        for r in 0..counts[t] {
            rows[t] = Some(r);
            let res = match &self.cond {
                Some(cond) => {
                    let fetch = |table: usize, row: usize, col: usize| self.tables[table].view.fetch_int(db, row, col);
                    Evaluator::new(&fetch, db.strings(), rows.as_slice(), params).evaluate(cond)?
                }
                None => Eval::Value(1),
            };
            if !res.passes() {
                continue;
            }
            if depth + 1 < order.len() {
                self.check_condition(db, order, counts, depth + 1, rows, params, out)?;
            } else {
                out.push(rows.iter().flatten().copied().collect());
            }
        }
        rows[t] = None;
        Ok(())
    }

    fn sort_key(&self, db: &Database, tuple: &[usize], col: usize) -> Result<SortKey> {
        let (t, c) = self.locate(col)?;
        let raw = self.tables[t].view.fetch_int(db, tuple[t], c)?;
        if self.tables[t].columns[c - 1].is_string() {
            Ok(SortKey::Text(db.strings().lookup(raw).unwrap_or("").to_string()))
        } else {
            Ok(SortKey::Raw(raw))
        }
    }

    fn sort_rows(&mut self, db: &Database) -> Result<()> {
        let tuples = std::mem::take(&mut self.reorder);
        let mut keyed = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let keys = self
                .order_by
                .iter()
                .map(|&col| self.sort_key(db, &tuple, col))
                .collect::<Result<Vec<_>>>()?;
            keyed.push((keys, tuple));
        }
        keyed.sort();
        self.reorder = keyed.into_iter().map(|(_, tuple)| tuple).collect();
        Ok(())
    }
}

impl View for WhereView {
    fn fetch_int(&self, db: &Database, row: usize, col: usize) -> Result<u32> {
        let (t, c) = self.locate(col)?;
        let tuple = self.tuple(row)?;
        self.tables[t].view.fetch_int(db, tuple[t], c)
    }

    fn fetch_stream(&self, db: &Database, row: usize, col: usize) -> Result<Stream> {
        let (t, c) = self.locate(col)?;
        let tuple = self.tuple(row)?;
        self.tables[t].view.fetch_stream(db, tuple[t], c)
    }

    fn set_row(&mut self, db: &mut Database, row: usize, rec: &Record, mask: u64) -> Result<()> {
        let tuple = self.tuple(row)?.to_vec();
        let mut target = None;
        for (i, table) in self.tables.iter().enumerate() {
            let cols = table.columns.len();
            let shifted = u32::try_from(table.offset).ok().and_then(|o| mask.checked_shr(o)).unwrap_or(0);
            let sub_mask = shifted & leading_columns(cols);
            if sub_mask != 0 {
                if target.is_some() {
                    return Err(MsiError::Unsupported);
                }
                target = Some((i, sub_mask));
            }
        }
        let Some((t, sub_mask)) = target else {
            return Ok(());
        };

        let table = &mut self.tables[t];
        let mut sub = Record::new(table.columns.len())?;
        for c in 1..=table.columns.len().min(rec.field_count().saturating_sub(table.offset)) {
            rec.copy_field(table.offset + c, &mut sub, c)?;
        }
        table.view.set_row(db, tuple[t], &sub, sub_mask)
    }

    fn insert_row(&mut self, db: &mut Database, rec: &Record, temporary: bool) -> Result<()> {
        match self.tables.as_mut_slice() {
            [only] => only.view.insert_row(db, rec, temporary),
            _ => Err(MsiError::Unsupported),
        }
    }

    fn delete_row(&mut self, db: &mut Database, row: usize) -> Result<()> {
        if self.tables.len() != 1 {
            return Err(MsiError::Unsupported);
        }
        let deleted = self.tuple(row)?[0];
        self.tables[0].view.delete_row(db, deleted)?;
        self.reorder.remove(row);
        for tuple in &mut self.reorder {
            if tuple[0] > deleted {
                tuple[0] -= 1;
            }
        }
        Ok(())
    }

    fn execute(&mut self, db: &mut Database, params: Option<&Record>) -> Result<()> {
        self.reorder.clear();
        let mut counts = Vec::with_capacity(self.tables.len());
        for table in &mut self.tables {
            table.view.execute(db, params)?;
            counts.push(table.view.get_dimensions(db)?.0);
        }
        if counts.contains(&0) {
            debug!("join over an empty table");
            return Ok(());
        }

        let order = order_tables(self.cond.as_ref(), self.tables.len());
        debug!(?order, ?counts, "join order");
        let mut rows = vec![None; self.tables.len()];
        let mut out = Vec::with_capacity(16);
        self.check_condition(db, &order, &counts, 0, &mut rows, params, &mut out)?;
        self.reorder = out;
        self.sort_rows(db)
    }

    fn close(&mut self) -> Result<()> {
        self.reorder.clear();
        for table in &mut self.tables {
            table.view.close()?;
        }
        Ok(())
    }

    fn get_dimensions(&self, _db: &Database) -> Result<(usize, usize)> {
        Ok((self.reorder.len(), self.column_count()))
    }

    fn get_column_info(&self, db: &Database, col: usize) -> Result<ColumnInfo> {
        let (t, c) = self.locate(col)?;
        self.tables[t].view.get_column_info(db, c)
    }

    fn sort(&mut self, _db: &Database, columns: &[usize]) -> Result<()> {
        for &col in columns {
            check_column(col, self.column_count())?;
        }
        self.order_by = columns.to_vec();
        Ok(())
    }
}
