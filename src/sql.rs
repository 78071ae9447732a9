use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectAvailability {
        selection: Selection,
    },
    SelectSelection {
        selection: Selection,
    },
    InsertSpot {
        spot: NewSpot,
    },
    SelectSpots {
        filter: SpotFilter,
    },
    SelectStats,
    SelectLeaderboard {
        owner_wallet: Option<String>,
    },
    SelectWhitelist {
        wallet: String,
    },
    InsertWhitelist {
        wallet: String,
        allowance: u32,
    },
    DeleteWhitelist {
        wallet: String,
    },
    ConsumeAllowance {
        wallet: String,
        amount: u32,
    },
    InsertUpload {
        spot_id: String,
        file_name: String,
        content_type: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, PartialEq)]
pub enum SpotFilter {
    All,
    Id(Ulid),
    Owner(String),
}

/// Positional column order of `INSERT INTO spots` without a column list.
const SPOT_COLUMNS: [&str; 9] = [
    "x",
    "y",
    "width",
    "height",
    "owner_wallet",
    "image_url",
    "color_hex",
    "link_url",
    "tx_signature",
];

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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.to_string().trim_matches('"').to_lowercase())
        .collect();

    match table.as_str() {
        "spots" => {
            let row = bind_columns(&table, &SPOT_COLUMNS, &columns, &values)?;
            Ok(Command::InsertSpot {
                spot: NewSpot {
                    x: required_i64(&row, "x")?,
                    y: required_i64(&row, "y")?,
                    width: required_i64(&row, "width")?,
                    height: required_i64(&row, "height")?,
                    owner_wallet: optional_string(&row, "owner_wallet")?
                        .ok_or(SqlError::MissingValue("owner_wallet"))?,
                    image_url: optional_string(&row, "image_url")?,
                    color_hex: optional_string(&row, "color_hex")?,
                    link_url: optional_string(&row, "link_url")?,
                    tx_signature: optional_string(&row, "tx_signature")?,
                },
            })
        }
        "whitelist" => {
            let row = bind_columns(&table, &["wallet", "allowance"], &columns, &values)?;
            Ok(Command::InsertWhitelist {
                wallet: optional_string(&row, "wallet")?.ok_or(SqlError::MissingValue("wallet"))?,
                allowance: match lookup(&row, "allowance") {
                    Some(expr) => parse_u32(expr)?,
                    None => 1,
                },
            })
        }
        "allowance_uses" => {
            let row = bind_columns(&table, &["wallet", "amount"], &columns, &values)?;
            Ok(Command::ConsumeAllowance {
                wallet: optional_string(&row, "wallet")?.ok_or(SqlError::MissingValue("wallet"))?,
                amount: match lookup(&row, "amount") {
                    Some(expr) => parse_u32(expr)?,
                    None => 1,
                },
            })
        }
        "uploads" => {
            let row = bind_columns(
                &table,
                &["spot_id", "file_name", "content_type", "data"],
                &columns,
                &values,
            )?;
            let text = |name: &'static str| -> Result<String, SqlError> {
                optional_string(&row, name)?.ok_or(SqlError::MissingValue(name))
            };
            Ok(Command::InsertUpload {
                spot_id: text("spot_id")?,
                file_name: text("file_name")?,
                content_type: text("content_type")?,
                data: parse_bytea(&text("data")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection)?;

    match table.as_str() {
        "whitelist" => {
            only_filters(&filters, &["wallet"])?;
            let wallet = lookup(&filters, "wallet").ok_or(SqlError::MissingFilter("wallet"))?;
            Ok(Command::DeleteWhitelist {
                wallet: parse_string(wallet)?,
            })
        }
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
    let filters = where_filters(&select.selection)?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            selection: selection_from(&filters)?,
        }),
        "selection" => Ok(Command::SelectSelection {
            selection: selection_from(&filters)?,
        }),
        "spots" => {
            only_filters(&filters, &["id", "owner_wallet"])?;
            let filter = match (lookup(&filters, "id"), lookup(&filters, "owner_wallet")) {
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("filter spots by id or owner_wallet, not both".into()));
                }
                (Some(id), None) => SpotFilter::Id(parse_ulid_expr(id)?),
                (None, Some(owner)) => SpotFilter::Owner(parse_string(owner)?),
                (None, None) => SpotFilter::All,
            };
            Ok(Command::SelectSpots { filter })
        }
        "stats" => {
            only_filters(&filters, &[])?;
            Ok(Command::SelectStats)
        }
        "leaderboard" => {
            only_filters(&filters, &["owner_wallet"])?;
            Ok(Command::SelectLeaderboard {
                owner_wallet: lookup(&filters, "owner_wallet").map(parse_string).transpose()?,
            })
        }
        "whitelist" => {
            only_filters(&filters, &["wallet"])?;
            let wallet = lookup(&filters, "wallet").ok_or(SqlError::MissingFilter("wallet"))?;
            Ok(Command::SelectWhitelist {
                wallet: parse_string(wallet)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn selection_from(filters: &[(String, &Expr)]) -> Result<Selection, SqlError> {
    only_filters(filters, &["start_x", "start_y", "end_x", "end_y"])?;
    let coord = |name: &'static str| -> Result<Coord, SqlError> {
        let expr = lookup(filters, name).ok_or(SqlError::MissingFilter(name))?;
        parse_i64_expr(expr)
    };
    Ok(Selection::new(
        coord("start_x")?,
        coord("start_y")?,
        coord("end_x")?,
        coord("end_y")?,
    ))
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Flatten `col = value [AND ...]` into `(column, value)` pairs.
fn where_filters(selection: &Option<Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if out.iter().any(|(c, _)| *c == col) {
                return Err(SqlError::Unsupported(format!("duplicate filter on {col}")));
            }
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

fn only_filters(filters: &[(String, &Expr)], allowed: &[&str]) -> Result<(), SqlError> {
    match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((col, _)) => Err(SqlError::UnknownColumn(col.clone())),
        None => Ok(()),
    }
}

fn lookup<'a>(pairs: &[(String, &'a Expr)], name: &str) -> Option<&'a Expr> {
    pairs.iter().find(|(c, _)| c == name).map(|(_, e)| *e)
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

/// The single VALUES row of an INSERT.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Pair each value with its column, by name when a column list is given,
/// positionally against `known` otherwise.
fn bind_columns<'a>(
    table: &str,
    known: &[&'static str],
    columns: &[String],
    values: &'a [Expr],
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    if columns.is_empty() {
        if values.len() > known.len() {
            return Err(SqlError::WrongArity(table.to_string(), known.len(), values.len()));
        }
        return Ok(known.iter().map(|c| c.to_string()).zip(values.iter()).collect());
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), values.len()));
    }
    let mut row: Vec<(String, &Expr)> = Vec::with_capacity(columns.len());
    for (col, value) in columns.iter().zip(values) {
        if !known.contains(&col.as_str()) {
            return Err(SqlError::UnknownColumn(col.clone()));
        }
        if row.iter().any(|(c, _)| c == col) {
            return Err(SqlError::Parse(format!("column {col} given twice")));
        }
        row.push((col.clone(), value));
    }
    Ok(row)
}

fn required_i64(row: &[(String, &Expr)], name: &'static str) -> Result<i64, SqlError> {
    let expr = lookup(row, name).ok_or(SqlError::MissingValue(name))?;
    if is_null(expr) {
        return Err(SqlError::MissingValue(name));
    }
    parse_i64_expr(expr)
}

fn optional_string(row: &[(String, &Expr)], name: &str) -> Result<Option<String>, SqlError> {
    match lookup(row, name) {
        None => Ok(None),
        Some(expr) if is_null(expr) => Ok(None),
        Some(expr) => parse_string(expr).map(Some),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::InvalidValue(format!("expected string literal, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad id {s:?}: {e}")))
}

/// Integer literal, quoted integer, or a negated one. Fractions are rejected.
fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|_| SqlError::InvalidValue(format!("expected integer, got {s:?}"))),
            _ => Err(SqlError::InvalidValue(format!("expected integer, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::InvalidValue("integer out of range".into()))
    } else {
        Err(SqlError::InvalidValue(format!("expected integer, got {expr}")))
    }
}

/// bytea text input: `\x` followed by hex digits, or the raw string bytes.
fn parse_bytea(s: &str) -> Result<Vec<u8>, SqlError> {
    let Some(hex) = s.strip_prefix("\\x") else {
        return Ok(s.as_bytes().to_vec());
    };
    if hex.len() % 2 != 0 {
        return Err(SqlError::InvalidValue("odd number of hex digits in bytea".into()));
    }
    let digit = |b: u8| char::from(b).to_digit(16);
    hex.as_bytes()
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| match (digit(pair[0]), digit(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi * 16 + lo) as u8),
            _ => Err(SqlError::InvalidValue(format!("bad hex in bytea at {}", i * 2))),
        })
        .collect()
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(String, usize, usize),
    MissingFilter(&'static str),
    MissingValue(&'static str),
    /// A literal of the wrong type, such as a fraction where an integer belongs.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingValue(col) => write!(f, "missing value: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
