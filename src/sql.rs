use chrono::{DateTime, NaiveDate, Utc};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectLabs {
        id: Option<Id>,
    },
    SelectReservations {
        id: Option<Id>,
        filter: ReservationFilter,
    },
    SelectBlocks {
        lab_id: Option<Id>,
    },
    SelectSlots {
        lab_id: Id,
        date: NaiveDate,
    },
    InsertReservation {
        input: NewReservation,
        returning: bool,
    },
    InsertApproval {
        reservation_id: Id,
    },
    InsertDenial {
        reservation_id: Id,
        reason: String,
    },
    DeleteReservation {
        id: Id,
    },
    InsertBlock {
        input: NewBlock,
        returning: bool,
    },
    DeleteBlock {
        id: Id,
    },
}

const RESERVATION_COLUMNS: &[&str] = &[
    "lab_id",
    "requester_name",
    "phone",
    "start_time",
    "duration_minutes",
    "course",
    "section",
    "note",
];
const BLOCK_COLUMNS: &[&str] = &["lab_id", "start_time", "end_time", "reason"];
const APPROVAL_COLUMNS: &[&str] = &["reservation_id"];
const DENIAL_COLUMNS: &[&str] = &["reservation_id", "reason"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table whose rows a statement returns, judged from its shape alone so
/// that `$N` placeholders need not be bound yet.
pub fn result_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Select(s) => table_factor_name(&s.from.first()?.relation).ok(),
            _ => None,
        },
        Statement::Insert(insert) if insert.returning.is_some() => insert_table_name(insert).ok(),
        _ => None,
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "reservations" => {
            let mut input = NewReservation::default();
            for (col, expr) in insert_pairs(insert, "reservations", RESERVATION_COLUMNS)? {
                match col.as_str() {
                    "lab_id" => input.lab_id = parse_id_or_null(&expr)?,
                    "requester_name" => {
                        input.requester_name = parse_text_or_null(&expr)?.unwrap_or_default()
                    }
                    "phone" => input.phone = parse_text_or_null(&expr)?.unwrap_or_default(),
                    "start_time" => input.start_time = parse_timestamp_or_null(&expr)?,
                    "duration_minutes" => input.duration_minutes = parse_u32_or_null(&expr)?,
                    "course" => input.course = parse_text_or_null(&expr)?,
                    "section" => input.section = parse_text_or_null(&expr)?,
                    "note" => input.note = parse_text_or_null(&expr)?,
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::InsertReservation { input, returning })
        }
        "blocks" => {
            let mut input = NewBlock::default();
            for (col, expr) in insert_pairs(insert, "blocks", BLOCK_COLUMNS)? {
                match col.as_str() {
                    "lab_id" => input.lab_id = parse_id_or_null(&expr)?,
                    "start_time" => input.start_time = parse_timestamp_or_null(&expr)?,
                    "end_time" => input.end_time = parse_timestamp_or_null(&expr)?,
                    "reason" => input.reason = parse_text_or_null(&expr)?.unwrap_or_default(),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::InsertBlock { input, returning })
        }
        "approvals" => {
            let mut reservation_id = None;
            for (col, expr) in insert_pairs(insert, "approvals", APPROVAL_COLUMNS)? {
                match col.as_str() {
                    "reservation_id" => reservation_id = Some(parse_id(&expr)?),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::InsertApproval {
                reservation_id: reservation_id.ok_or(SqlError::MissingValue("reservation_id"))?,
            })
        }
        "denials" => {
            let (mut reservation_id, mut reason) = (None, String::new());
            for (col, expr) in insert_pairs(insert, "denials", DENIAL_COLUMNS)? {
                match col.as_str() {
                    "reservation_id" => reservation_id = Some(parse_id(&expr)?),
                    "reason" => reason = parse_text_or_null(&expr)?.unwrap_or_default(),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::InsertDenial {
                reservation_id: reservation_id.ok_or(SqlError::MissingValue("reservation_id"))?,
                reason,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::DeleteReservation { id }),
        "blocks" => Ok(Command::DeleteBlock { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "labs" => {
            let mut id = None;
            for (col, expr) in filters {
                match col.as_str() {
                    "id" => id = Some(parse_id(&expr)?),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::SelectLabs { id })
        }
        "reservations" => {
            let (mut id, mut filter) = (None, ReservationFilter::default());
            for (col, expr) in filters {
                match col.as_str() {
                    "id" => id = Some(parse_id(&expr)?),
                    "phone" => filter.phone = parse_text_or_null(&expr)?,
                    "lab_id" => filter.lab_id = Some(parse_id(&expr)?),
                    "status" => filter.status = Some(parse_status(&expr)?),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::SelectReservations { id, filter })
        }
        "blocks" => {
            let mut lab_id = None;
            for (col, expr) in filters {
                match col.as_str() {
                    "lab_id" => lab_id = Some(parse_id(&expr)?),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::SelectBlocks { lab_id })
        }
        "slots" => {
            let (mut lab_id, mut date) = (None, None);
            for (col, expr) in filters {
                match col.as_str() {
                    "lab_id" => lab_id = Some(parse_id(&expr)?),
                    "date" | "day" => date = Some(parse_date(&expr)?),
                    _ => return Err(unknown_column(&table, &col)),
                }
            }
            Ok(Command::SelectSlots {
                lab_id: lab_id.ok_or(SqlError::MissingFilter("lab_id"))?,
                date: date.ok_or(SqlError::MissingFilter("date"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 'x'` into column/value pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("operator {op}"))),
        },
        _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
}

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// Pair each VALUES entry with its column. Without a column list the
/// table's declared order applies.
fn insert_pairs(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row,
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns
            .iter()
            .take(values.len())
            .map(|c| c.to_string())
            .collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(columns.into_iter().zip(values.iter().cloned()).collect())
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Id, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_id(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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
        _ => None,
    }
}

fn unknown_column(table: &str, col: &str) -> SqlError {
    SqlError::UnknownColumn(table.to_string(), col.to_string())
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_id(expr: &Expr) -> Result<Id, SqlError> {
    let v = parse_i64_expr(expr)?;
    Id::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is not a valid id")))
}

fn parse_id_or_null(expr: &Expr) -> Result<Option<Id>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_id(expr).map(Some)
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// RFC 3339, with either `T` or a space between date and time.
fn parse_timestamp_or_null(expr: &Expr) -> Result<Option<Timestamp>, SqlError> {
    let Some(s) = parse_text_or_null(expr)? else {
        return Ok(None);
    };
    let normalized = s.trim().replacen(' ', "T", 1);
    DateTime::parse_from_rfc3339(&normalized)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text_or_null(expr)?.ok_or(SqlError::MissingValue("date"))?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    let s = parse_text_or_null(expr)?.ok_or(SqlError::MissingValue("status"))?;
    ReservationStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown status: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} on {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
