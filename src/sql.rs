use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::VenueId;

/// One row of `INSERT INTO blocks`. Dates are not yet checked for order.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRow {
    pub id: Ulid,
    pub venue_id: VenueId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub label: Option<String>,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBlock(BlockRow),
    /// Multi-row VALUES; committed all-or-nothing.
    BatchInsertBlocks(Vec<BlockRow>),
    DeleteBlock {
        id: Ulid,
    },
    /// `WHERE venue_id = ..` lists a venue, `WHERE id = ..` fetches one block.
    SelectBlocks {
        venue_id: Option<VenueId>,
        id: Option<Ulid>,
    },
    SelectConflicts {
        venue_id: VenueId,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectAvailability {
        venue_id: VenueId,
        start: NaiveDate,
        end: NaiveDate,
        min_days: Option<u32>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const BLOCK_COLUMNS: [&str; 5] = ["id", "venue_id", "start", "end", "label"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "blocks" {
        return Err(SqlError::UnknownTable(table));
    }
    let positions = column_positions(&insert.columns)?;
    let rows = extract_insert_rows(insert)?;

    let mut blocks = rows
        .iter()
        .enumerate()
        .map(|(i, row)| {
            parse_block_row(row, &positions).map_err(|e| match e {
                SqlError::Parse(msg) if rows.len() > 1 => SqlError::Parse(format!("row {i}: {msg}")),
                other => other,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if blocks.len() == 1 {
        Ok(Command::InsertBlock(blocks.remove(0)))
    } else {
        Ok(Command::BatchInsertBlocks(blocks))
    }
}

/// Index into a VALUES row for each of `BLOCK_COLUMNS`. Without a column
/// list, values are positional in that order.
fn column_positions(columns: &[ast::Ident]) -> Result<[Option<usize>; 5], SqlError> {
    let mut positions = [None; 5];
    if columns.is_empty() {
        for (i, slot) in positions.iter_mut().enumerate() {
            *slot = Some(i);
        }
        return Ok(positions);
    }
    for (idx, ident) in columns.iter().enumerate() {
        let name = ident.value.to_lowercase();
        let slot = BLOCK_COLUMNS
            .iter()
            .position(|c| *c == name)
            .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
        positions[slot] = Some(idx);
    }
    Ok(positions)
}

fn parse_block_row(row: &[Expr], positions: &[Option<usize>; 5]) -> Result<BlockRow, SqlError> {
    let required = positions[..4].iter().flatten().count();
    if required < 4 {
        return Err(SqlError::WrongArity("blocks", 4, required));
    }
    let required_at = |col: usize| {
        row_value(row, positions[col])?.ok_or(SqlError::MissingColumn(BLOCK_COLUMNS[col]))
    };

    Ok(BlockRow {
        id: parse_ulid_expr(required_at(0)?)?,
        venue_id: parse_venue_expr(required_at(1)?)?,
        start: parse_date_expr(required_at(2)?)?,
        end: parse_date_expr(required_at(3)?)?,
        label: match row_value(row, positions[4])? {
            Some(expr) => parse_string_or_null(expr)?,
            None => None,
        },
    })
}

fn row_value(row: &[Expr], position: Option<usize>) -> Result<Option<&Expr>, SqlError> {
    match position {
        Some(idx) => row
            .get(idx)
            .map(Some)
            .ok_or(SqlError::WrongArity("blocks", idx + 1, row.len())),
        None => Ok(None),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "blocks" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::DeleteBlock { id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "blocks" => {
            filters.only("blocks", &["venue_id", "id"])?;
            if filters.venue_id.is_none() && filters.id.is_none() {
                return Err(SqlError::MissingFilter("venue_id"));
            }
            Ok(Command::SelectBlocks {
                venue_id: filters.venue_id,
                id: filters.id,
            })
        }
        "conflicts" => {
            filters.only("conflicts", &["venue_id", "start", "end", "date"])?;
            let venue_id = filters.venue_id.ok_or(SqlError::MissingFilter("venue_id"))?;
            let (start, end) = match filters.date {
                Some(date) => (date, date),
                None => (
                    filters.start.ok_or(SqlError::MissingFilter("start"))?,
                    filters.end.ok_or(SqlError::MissingFilter("end"))?,
                ),
            };
            Ok(Command::SelectConflicts {
                venue_id,
                start,
                end,
            })
        }
        "availability" => {
            filters.only("availability", &["venue_id", "start", "end", "min_days"])?;
            Ok(Command::SelectAvailability {
                venue_id: filters.venue_id.ok_or(SqlError::MissingFilter("venue_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
                min_days: filters.min_days,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunctive WHERE filters shared by the SELECT targets.
#[derive(Default)]
struct Filters {
    venue_id: Option<VenueId>,
    id: Option<Ulid>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    date: Option<NaiveDate>,
    min_days: Option<u32>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        let Expr::BinaryOp { left, op, right } = expr else {
            return match expr {
                Expr::Nested(inner) => self.collect(inner),
                other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
            };
        };
        if *op == ast::BinaryOperator::And {
            self.collect(left)?;
            return self.collect(right);
        }
        if *op == ast::BinaryOperator::Or {
            return Err(SqlError::Unsupported("OR in WHERE".into()));
        }

        let column = expr_column_name(left)
            .ok_or_else(|| SqlError::Unsupported(format!("WHERE clause {expr}")))?;
        if !FILTER_COLUMNS.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(column));
        }
        match (column.as_str(), op) {
            ("venue_id", ast::BinaryOperator::Eq) => self.venue_id = Some(parse_venue_expr(right)?),
            ("id", ast::BinaryOperator::Eq) => self.id = Some(parse_ulid_expr(right)?),
            ("date", ast::BinaryOperator::Eq) => self.date = Some(parse_date_expr(right)?),
            ("min_days", ast::BinaryOperator::Eq) => self.min_days = Some(parse_u32_expr(right)?),
            ("start", ast::BinaryOperator::GtEq) => self.start = Some(parse_date_expr(right)?),
            ("end", ast::BinaryOperator::LtEq) => self.end = Some(parse_date_expr(right)?),
            _ => return Err(SqlError::Unsupported(format!("filter {column} {op}"))),
        }
        Ok(())
    }

    /// Reject filters the target table would otherwise ignore.
    fn only(&self, table: &str, allowed: &[&str]) -> Result<(), SqlError> {
        let present = [
            ("venue_id", self.venue_id.is_some()),
            ("id", self.id.is_some()),
            ("start", self.start.is_some()),
            ("end", self.end.is_some()),
            ("date", self.date.is_some()),
            ("min_days", self.min_days.is_some()),
        ];
        match present
            .iter()
            .find(|(column, set)| *set && !allowed.contains(column))
        {
            Some((column, _)) => Err(SqlError::Unsupported(format!("filter on {column} for {table}"))),
            None => Ok(()),
        }
    }
}

const FILTER_COLUMNS: [&str; 6] = ["venue_id", "id", "start", "end", "date", "min_days"];

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        // '2026-02-10'::date and CAST(.. AS date)
        Expr::Cast { expr, .. } => extract_value(expr),
        Expr::Nested(inner) => extract_value(inner),
        _ => None,
    }
}

fn expect_string(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = expect_string(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_venue_expr(expr: &Expr) -> Result<VenueId, SqlError> {
    expect_string(expr).map(VenueId::from)
}

/// ISO `YYYY-MM-DD` calendar date.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = expect_string(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::InvalidDate(s.to_string()))
}

fn parse_u32_expr(expr: &Expr) -> Result<u32, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|_| SqlError::Parse(format!("expected non-negative integer, got {s}"))),
        _ => Err(SqlError::Parse(format!("expected number, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => expect_string(expr).map(|s| Some(s.to_string())),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
}
