use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map};

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn patch_obj<'a>(
    req: &'a Request,
) -> Result<&'a Map<String, serde_json::Value>, serde_json::Value> {
    req.params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| err(&req.id, "bad_params", "patch must be an object", None))
}

pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Existence check scoped to a parent row, e.g. a student inside a class.
pub fn row_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    parent: Option<(&str, &str)>,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = match parent {
        Some((col, parent_id)) => conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ? AND {} = ?", table, col),
                (id, parent_id),
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
                r.get(0)
            })
            .optional()?,
    };
    Ok(found.is_some())
}

pub fn next_sort_order(
    conn: &Connection,
    table: &str,
    parent_col: &str,
    parent_id: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM {} WHERE {} = ?",
            table, parent_col
        ),
        [parent_id],
        |r| r.get(0),
    )
}

pub fn parse_score(v: &serde_json::Value, key: &str) -> Result<Option<f64>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number or null", key))?;
    if !n.is_finite() || !(0.0..=100.0).contains(&n) {
        return Err(format!("{} must be within 0..=100", key));
    }
    Ok(Some(n))
}

#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Trimmed string; empty becomes NULL.
    Text,
    /// Trimmed string that must not be empty.
    Required,
    /// ISO `YYYY-MM-DD`.
    Date,
    Int { min: i64, max: i64 },
    Bool,
    /// Manual bobot; null clears it back to automatic.
    Weight,
    /// 0..=100, null allowed.
    Score,
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub key: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

pub const fn field(key: &'static str, column: &'static str, kind: FieldKind) -> Field {
    Field { key, column, kind }
}

fn field_value(f: &Field, v: &serde_json::Value) -> Result<Value, String> {
    match f.kind {
        FieldKind::Text => {
            if v.is_null() {
                return Ok(Value::Null);
            }
            let s = v
                .as_str()
                .ok_or_else(|| format!("{} must be string or null", f.key))?
                .trim();
            Ok(if s.is_empty() {
                Value::Null
            } else {
                Value::Text(s.to_string())
            })
        }
        FieldKind::Required => {
            let s = v
                .as_str()
                .ok_or_else(|| format!("{} must be string", f.key))?
                .trim();
            if s.is_empty() {
                return Err(format!("{} must not be empty", f.key));
            }
            Ok(Value::Text(s.to_string()))
        }
        FieldKind::Date => {
            if v.is_null() {
                return Ok(Value::Null);
            }
            let s = v
                .as_str()
                .ok_or_else(|| format!("{} must be a YYYY-MM-DD string or null", f.key))?
                .trim();
            if s.is_empty() {
                return Ok(Value::Null);
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| format!("{} must be a YYYY-MM-DD date", f.key))?;
            Ok(Value::Text(s.to_string()))
        }
        FieldKind::Int { min, max } => {
            let n = v
                .as_i64()
                .ok_or_else(|| format!("{} must be integer", f.key))?;
            if !(min..=max).contains(&n) {
                return Err(format!("{} must be in {}..={}", f.key, min, max));
            }
            Ok(Value::Integer(n))
        }
        FieldKind::Bool => {
            let b = v
                .as_bool()
                .ok_or_else(|| format!("{} must be boolean", f.key))?;
            Ok(Value::Integer(i64::from(b)))
        }
        FieldKind::Weight | FieldKind::Score => {
            Ok(parse_score(v, f.key)?.map(Value::Real).unwrap_or(Value::Null))
        }
        FieldKind::OneOf(allowed) => {
            let s = v
                .as_str()
                .ok_or_else(|| format!("{} must be string", f.key))?
                .trim()
                .to_ascii_lowercase();
            if !allowed.contains(&s.as_str()) {
                return Err(format!("{} must be one of: {}", f.key, allowed.join(", ")));
            }
            Ok(Value::Text(s))
        }
    }
}

/// Validate the keys of `obj` that appear in `fields`. Unknown keys are rejected.
pub fn collect_fields(
    obj: &Map<String, serde_json::Value>,
    fields: &[Field],
) -> Result<Vec<(&'static str, Value)>, String> {
    for key in obj.keys() {
        if !fields.iter().any(|f| f.key == key) {
            return Err(format!("unknown field: {}", key));
        }
    }
    let mut out = Vec::new();
    for f in fields {
        if let Some(v) = obj.get(f.key) {
            out.push((f.column, field_value(f, v)?));
        }
    }
    Ok(out)
}

/// `Required` fields must be present when creating a row.
pub fn check_required(
    obj: &Map<String, serde_json::Value>,
    fields: &[Field],
) -> Result<(), String> {
    for f in fields {
        if matches!(f.kind, FieldKind::Required) && !obj.contains_key(f.key) {
            return Err(format!("missing {}", f.key));
        }
    }
    Ok(())
}

pub fn insert_row(
    conn: &Connection,
    table: &str,
    mut values: Vec<(&'static str, Value)>,
    fixed: Vec<(&'static str, Value)>,
) -> rusqlite::Result<usize> {
    values.extend(fixed);
    let cols = values.iter().map(|(c, _)| *c).collect::<Vec<_>>().join(", ");
    let placeholders = std::iter::repeat("?")
        .take(values.len())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("INSERT INTO {}({}) VALUES({})", table, cols, placeholders);
    conn.execute(&sql, params_from_iter(values.into_iter().map(|(_, v)| v)))
}

pub fn update_row(
    conn: &Connection,
    table: &str,
    id: &str,
    values: Vec<(&'static str, Value)>,
) -> rusqlite::Result<usize> {
    if values.is_empty() {
        return Ok(0);
    }
    let sets = values
        .iter()
        .map(|(c, _)| format!("{} = ?", c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("UPDATE {} SET {} WHERE id = ?", table, sets);
    let mut bind: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
    bind.push(Value::Text(id.to_string()));
    conn.execute(&sql, params_from_iter(bind))
}

pub fn bad_params(req: &Request, msg: impl Into<String>) -> serde_json::Value {
    err(&req.id, "bad_params", msg, None)
}

pub fn db_failed(req: &Request, code: &str, e: rusqlite::Error, table: &str) -> serde_json::Value {
    err(&req.id, code, e.to_string(), Some(json!({ "table": table })))
}
