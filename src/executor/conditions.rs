//! WHERE-clause binding and three-valued evaluation.
//!
//! Parsed [`Expr`] trees are bound against the joined tables once, at
//! view construction. Column references become `(table, column)` pairs and
//! comparisons involving text become string compares. Evaluation runs per
//! candidate row tuple; a column of a table that is not bound yet yields
//! [`Eval::Continue`] instead of a truth value, so the join loop can defer
//! the decision to a deeper level.

use std::cmp::Ordering;

use crate::core::column::{ColumnInfo, MSITYPE_STRING, bias_decode, int_width, is_string};
use crate::core::{MsiError, Record, Result, StringTable, NULL_INT};
use crate::parser::{BinaryOp, ColumnRef, Expr, UnaryOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnBinding {
    /// Index into the join's table list.
    pub table: usize,
    /// 1-based column within that table.
    pub col: usize,
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundExpr {
    Column(ColumnBinding),
    Int(i32),
    Str(String),
    Wildcard,
    Unary {
        op: UnaryOp,
        column: ColumnBinding,
    },
    /// Integer comparison.
    Compare {
        left: Box<BoundExpr>,
        op: BinaryOp,
        right: Box<BoundExpr>,
    },
    /// Text equality or inequality.
    StrCmp {
        left: Box<BoundExpr>,
        op: BinaryOp,
        right: Box<BoundExpr>,
    },
    Logical {
        left: Box<BoundExpr>,
        op: BinaryOp,
        right: Box<BoundExpr>,
    },
}

/// Result of evaluating a bound expression against a partial row tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eval {
    Value(i32),
    /// Depends on a table that is not bound yet.
    Continue,
}

impl Eval {
    const TRUE: Self = Self::Value(1);
    const FALSE: Self = Self::Value(0);

    fn from_bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// True when the join loop should keep going with this tuple.
    #[must_use]
    pub const fn passes(self) -> bool {
        !matches!(self, Self::Value(0))
    }
}

/// Name and columns of one joined table, as seen by the binder.
pub struct BindTable<'a> {
    pub name: &'a str,
    pub columns: &'a [ColumnInfo],
}

fn resolve_column(column: &ColumnRef, tables: &[BindTable<'_>]) -> Result<ColumnBinding> {
    let mut found = None;
    for (t, table) in tables.iter().enumerate() {
        if let Some(q) = &column.table {
            if q != table.name {
                continue;
            }
        }
        if let Some(i) = table.columns.iter().position(|c| c.name == column.column) {
            if found.is_some() {
                return Err(MsiError::syntax(format!("ambiguous column {column}")));
            }
            found = Some(ColumnBinding {
                table: t,
                col: i + 1,
                ty: table.columns[i].ty,
            });
        }
    }
    found.ok_or_else(|| MsiError::syntax(format!("unknown column {column}")))
}

fn bind_operand(expr: &Expr, tables: &[BindTable<'_>]) -> Result<BoundExpr> {
    match expr {
        Expr::Column(c) => Ok(BoundExpr::Column(resolve_column(c, tables)?)),
        Expr::Int(i) => Ok(BoundExpr::Int(*i)),
        Expr::Str(s) => Ok(BoundExpr::Str(s.clone())),
        Expr::Wildcard => Ok(BoundExpr::Wildcard),
        _ => Err(MsiError::syntax("expected a column or a value")),
    }
}

fn is_text(expr: &BoundExpr) -> bool {
    match expr {
        BoundExpr::Str(_) => true,
        BoundExpr::Column(c) => is_string(c.ty),
        _ => false,
    }
}

/// Resolves column references and picks integer or string comparison.
pub fn bind(expr: &Expr, tables: &[BindTable<'_>]) -> Result<BoundExpr> {
    match expr {
        Expr::Binary { left, op: op @ (BinaryOp::And | BinaryOp::Or), right } => Ok(BoundExpr::Logical {
            left: Box::new(bind(left, tables)?),
            op: *op,
            right: Box::new(bind(right, tables)?),
        }),
        Expr::Binary { left, op, right } => {
            let left = bind_operand(left, tables)?;
            let right = bind_operand(right, tables)?;
            if is_text(&left) || is_text(&right) {
                if !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                    return Err(MsiError::syntax("strings can only be compared with = or <>"));
                }
                Ok(BoundExpr::StrCmp { left: Box::new(left), op: *op, right: Box::new(right) })
            } else {
                Ok(BoundExpr::Compare { left: Box::new(left), op: *op, right: Box::new(right) })
            }
        }
        Expr::Unary { op, operand } => match operand.as_ref() {
            Expr::Column(c) => Ok(BoundExpr::Unary { op: *op, column: resolve_column(c, tables)? }),
            _ => Err(MsiError::syntax("IS NULL needs a column")),
        },
        _ => Err(MsiError::syntax("condition is not a comparison")),
    }
}

const CONST_EXPR: u32 = 1;
const JOIN_TO_CONST_EXPR: u32 = 0x10000;

fn reorder_check(expr: &BoundExpr, ordered: &mut Vec<usize>, process_joins: bool, last: &mut Option<usize>) -> u32 {
    let column_check = |c: &ColumnBinding, ordered: &Vec<usize>, last: &mut Option<usize>| {
        if ordered.contains(&c.table) {
            JOIN_TO_CONST_EXPR
        } else {
            *last = Some(c.table);
            CONST_EXPR
        }
    };
    let res = match expr {
        BoundExpr::Column(c) => return column_check(c, ordered, last),
        BoundExpr::Unary { column, .. } => column_check(column, ordered, last),
        BoundExpr::Compare { left, right, .. }
        | BoundExpr::StrCmp { left, right, .. }
        | BoundExpr::Logical { left, right, .. } => {
            let r = reorder_check(right, ordered, process_joins, last);
            r + reorder_check(left, ordered, process_joins, last)
        }
        _ => return 0,
    };
    if res == 0 {
        return 0;
    }
    if let Some(t) = *last {
        let promote = res == CONST_EXPR || (process_joins && res == JOIN_TO_CONST_EXPR + CONST_EXPR);
        if promote && !ordered.contains(&t) {
            ordered.push(t);
        }
    }
    res
}

/// Join order: tables compared against constants first, then tables
/// joined to those, then the rest in declaration order.
#[must_use]
pub fn order_tables(cond: Option<&BoundExpr>, table_count: usize) -> Vec<usize> {
    let mut ordered = Vec::with_capacity(table_count);
    if let Some(cond) = cond {
        let mut last = None;
        reorder_check(cond, &mut ordered, false, &mut last);
        let mut last = None;
        reorder_check(cond, &mut ordered, true, &mut last);
    }
    for t in 0..table_count {
        if !ordered.contains(&t) {
            ordered.push(t);
        }
    }
    ordered
}

/// Evaluates a bound condition for one row tuple. Build a fresh
/// evaluator per tuple: wildcards are numbered from the first parameter
/// field on every evaluation.
pub struct Evaluator<'a> {
    fetch: &'a dyn Fn(usize, usize, usize) -> Result<u32>,
    strings: &'a StringTable,
    rows: &'a [Option<usize>],
    params: Option<&'a Record>,
    wildcard: usize,
}

impl<'a> Evaluator<'a> {
    /// `fetch(table, row, col)` reads a raw cell; `rows[t]` is the bound
    /// row of table `t`, or `None` while it is unbound.
    pub fn new(
        fetch: &'a dyn Fn(usize, usize, usize) -> Result<u32>,
        strings: &'a StringTable,
        rows: &'a [Option<usize>],
        params: Option<&'a Record>,
    ) -> Self {
        Self { fetch, strings, rows, params, wildcard: 0 }
    }

    fn raw(&self, c: &ColumnBinding) -> Result<Option<u32>> {
        match self.rows.get(c.table).copied().flatten() {
            Some(row) => (self.fetch)(c.table, row, c.col).map(Some),
            None => Ok(None),
        }
    }

    fn next_param(&mut self) -> usize {
        self.wildcard += 1;
        self.wildcard
    }

    /// `Ok(None)` when unbound, `Ok(Some(None))` for NULL.
    fn int_operand(&mut self, expr: &BoundExpr) -> Result<Option<Option<i32>>> {
        match expr {
            BoundExpr::Column(c) => Ok(self.raw(c)?.map(|raw| {
                if raw == 0 {
                    None
                } else if c.ty & MSITYPE_STRING != 0 {
                    Some(raw as i32)
                } else {
                    bias_decode(raw, int_width(c.ty))
                }
            })),
            BoundExpr::Int(i) => Ok(Some(Some(*i))),
            BoundExpr::Wildcard => {
                let idx = self.next_param();
                let v = self.params.map_or(NULL_INT, |p| p.get_int(idx));
                Ok(Some((v != NULL_INT).then_some(v)))
            }
            BoundExpr::Str(_) => Err(MsiError::syntax("string in integer comparison")),
            _ => self.evaluate(expr).map(|e| match e {
                Eval::Value(v) => Some(Some(v)),
                Eval::Continue => None,
            }),
        }
    }

    fn text_operand(&mut self, expr: &BoundExpr) -> Result<Option<String>> {
        match expr {
            BoundExpr::Column(c) => Ok(self.raw(c)?.map(|raw| {
                if raw == 0 {
                    String::new()
                } else if is_string(c.ty) {
                    self.strings.lookup(raw).unwrap_or("").to_string()
                } else {
                    bias_decode(raw, int_width(c.ty)).map(|v| v.to_string()).unwrap_or_default()
                }
            })),
            BoundExpr::Str(s) => Ok(Some(s.clone())),
            BoundExpr::Int(i) => Ok(Some(i.to_string())),
            BoundExpr::Wildcard => {
                let idx = self.next_param();
                Ok(Some(self.params.map(|p| p.get_string(idx)).unwrap_or_default()))
            }
            _ => Err(MsiError::syntax("expression in string comparison")),
        }
    }

    pub fn evaluate(&mut self, expr: &BoundExpr) -> Result<Eval> {
        match expr {
            BoundExpr::Column(_) | BoundExpr::Int(_) | BoundExpr::Wildcard => {
                Ok(match self.int_operand(expr)? {
                    None => Eval::Continue,
                    Some(v) => Eval::from_bool(v.is_some_and(|v| v != 0)),
                })
            }
            BoundExpr::Str(s) => Ok(Eval::from_bool(!s.is_empty())),
            BoundExpr::Unary { op, column } => Ok(match self.raw(column)? {
                None => Eval::Continue,
                Some(raw) => Eval::from_bool((raw == 0) == (*op == UnaryOp::IsNull)),
            }),
            BoundExpr::Compare { left, op, right } => {
                let l = self.int_operand(left)?;
                let r = self.int_operand(right)?;
                let (Some(l), Some(r)) = (l, r) else {
                    return Ok(Eval::Continue);
                };
                let (Some(l), Some(r)) = (l, r) else {
                    return Ok(Eval::FALSE);
                };
                let ord = l.cmp(&r);
                Ok(Eval::from_bool(match op {
                    BinaryOp::Eq => ord == Ordering::Equal,
                    BinaryOp::Ne => ord != Ordering::Equal,
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Le => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    BinaryOp::Ge => ord != Ordering::Less,
                    BinaryOp::And | BinaryOp::Or => return Err(MsiError::failed("logical operator in comparison")),
                }))
            }
            BoundExpr::StrCmp { left, op, right } => {
                let l = self.text_operand(left)?;
                let r = self.text_operand(right)?;
                let (Some(l), Some(r)) = (l, r) else {
                    return Ok(Eval::Continue);
                };
                let equal = l == r;
                Ok(Eval::from_bool(if *op == BinaryOp::Eq { equal } else { !equal }))
            }
            BoundExpr::Logical { left, op, right } => {
                let l = self.evaluate(left)?;
                let r = self.evaluate(right)?;
                Ok(combine(l, *op, r))
            }
        }
    }
}

/// AND/OR over three-valued operands. A decided side can settle the
/// result even when the other side is still unbound.
fn combine(l: Eval, op: BinaryOp, r: Eval) -> Eval {
    match (l, r) {
        (Eval::Value(a), Eval::Value(b)) => Eval::from_bool(if op == BinaryOp::And {
            a != 0 && b != 0
        } else {
            a != 0 || b != 0
        }),
        (Eval::Continue, Eval::Continue) => Eval::Continue,
        (Eval::Value(v), Eval::Continue) | (Eval::Continue, Eval::Value(v)) => match op {
            BinaryOp::And if v == 0 => Eval::FALSE,
            BinaryOp::Or if v != 0 => Eval::TRUE,
            _ => Eval::Continue,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::column::{MSITYPE_KEY, TYPE_SHORT, type_string};
    use crate::parser::parse_statement;
    use crate::parser::Statement;

    fn where_of(sql: &str) -> Expr {
        match parse_statement(sql).unwrap() {
            Statement::Select { filter: Some(f), .. } => f,
            other => panic!("no condition in {other:?}"),
        }
    }

    fn columns(table: &str) -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new(table, 1, "id", TYPE_SHORT | MSITYPE_KEY),
            ColumnInfo::new(table, 2, "name", type_string(32)),
        ]
    }

    #[test]
    fn test_combine_short_circuits() {
        assert_eq!(combine(Eval::FALSE, BinaryOp::And, Eval::Continue), Eval::FALSE);
        assert_eq!(combine(Eval::Continue, BinaryOp::And, Eval::TRUE), Eval::Continue);
        assert_eq!(combine(Eval::TRUE, BinaryOp::Or, Eval::Continue), Eval::TRUE);
        assert_eq!(combine(Eval::Continue, BinaryOp::Or, Eval::FALSE), Eval::Continue);
        assert_eq!(combine(Eval::Continue, BinaryOp::And, Eval::Continue), Eval::Continue);
    }

    #[test]
    fn test_binding_errors() {
        let a = columns("A");
        let b = columns("B");
        let tables = [BindTable { name: "A", columns: &a }, BindTable { name: "B", columns: &b }];
        assert!(bind(&where_of("SELECT * FROM A, B WHERE A.id = B.id"), &tables).is_ok());
        assert!(matches!(
            bind(&where_of("SELECT * FROM A, B WHERE id = 1"), &tables),
            Err(MsiError::BadQuerySyntax(_))
        ));
        assert!(matches!(
            bind(&where_of("SELECT * FROM A, B WHERE A.name > 'x'"), &tables),
            Err(MsiError::BadQuerySyntax(_))
        ));
        assert!(matches!(
            bind(&where_of("SELECT * FROM A WHERE A.missing = 1"), &tables),
            Err(MsiError::BadQuerySyntax(_))
        ));
        assert!(matches!(
            bind(&where_of("SELECT * FROM A WHERE A.name = 'x'"), &tables).unwrap(),
            BoundExpr::StrCmp { .. }
        ));
    }

    #[test]
    fn test_order_tables_promotes_constants() {
        let a = columns("A");
        let b = columns("B");
        let c = columns("C");
        let tables = [
            BindTable { name: "A", columns: &a },
            BindTable { name: "B", columns: &b },
            BindTable { name: "C", columns: &c },
        ];
        let cond = bind(&where_of("SELECT * FROM A, B, C WHERE C.id = 5 AND B.id = C.id"), &tables).unwrap();
        assert_eq!(order_tables(Some(&cond), 3), vec![2, 1, 0]);
        assert_eq!(order_tables(None, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_evaluate_partial_tuple() {
        let a = columns("A");
        let b = columns("B");
        let tables = [BindTable { name: "A", columns: &a }, BindTable { name: "B", columns: &b }];
        let cond = bind(&where_of("SELECT * FROM A, B WHERE A.id = 5 AND B.id = A.id"), &tables).unwrap();
        let strings = StringTable::new(0);
        // every id cell holds 5
        let fetch = |_t: usize, _r: usize, col: usize| -> Result<u32> { Ok(if col == 1 { 0x8005 } else { 0 }) };

        let rows = [Some(0), None];
        let mut ev = Evaluator::new(&fetch, &strings, &rows, None);
        assert_eq!(ev.evaluate(&cond).unwrap(), Eval::Continue);

        let rows = [Some(0), Some(0)];
        let mut ev = Evaluator::new(&fetch, &strings, &rows, None);
        assert_eq!(ev.evaluate(&cond).unwrap(), Eval::TRUE);
    }

    #[test]
    fn test_wildcards_bind_in_order() {
        let a = columns("A");
        let tables = [BindTable { name: "A", columns: &a }];
        let cond = bind(&where_of("SELECT * FROM A WHERE A.id = ? AND A.name = ?"), &tables).unwrap();
        let mut strings = StringTable::new(0);
        let name = strings.add("x", crate::core::Persistence::Persistent);
        let fetch = move |_t: usize, _r: usize, col: usize| -> Result<u32> { Ok(if col == 1 { 0x8003 } else { name }) };
        let rows = [Some(0)];

        let params = Record::from_fields(vec![crate::core::Field::Int(3), crate::core::Field::Str("x".into())])
            .unwrap();
        let mut ev = Evaluator::new(&fetch, &strings, &rows, Some(&params));
        assert_eq!(ev.evaluate(&cond).unwrap(), Eval::TRUE);

        let params = Record::from_fields(vec![crate::core::Field::Int(3), crate::core::Field::Str("y".into())])
            .unwrap();
        let mut ev = Evaluator::new(&fetch, &strings, &rows, Some(&params));
        assert_eq!(ev.evaluate(&cond).unwrap(), Eval::FALSE);
    }
}
