use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, collect_fields, db_conn, db_failed, field, patch_obj, required_str, row_exists,
    Field, FieldKind,
};
use crate::ipc::types::{AppState, Request};
use crate::rapor;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde_json::json;

const EXTRAS_FIELDS: &[Field] = &[
    field("sick", "sick", FieldKind::Int { min: 0, max: 366 }),
    field("permitted", "permitted", FieldKind::Int { min: 0, max: 366 }),
    field("absent", "absent", FieldKind::Int { min: 0, max: 366 }),
    field("homeroomNote", "homeroom_note", FieldKind::Text),
    field("promotion", "promotion", FieldKind::Text),
];

fn student_in_class(
    state: &AppState,
    req: &Request,
) -> Result<(String, String), serde_json::Value> {
    let conn = db_conn(state, req)?;
    let class_id = required_str(req, "classId")?;
    let student_id = required_str(req, "studentId")?;
    match row_exists(conn, "students", &student_id, Some(("class_id", &class_id))) {
        Ok(true) => Ok((class_id, student_id)),
        Ok(false) => Err(err(&req.id, "not_found", "student not found", None)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_extras_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (class_id, student_id) = match student_in_class(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match rapor::load_extras(conn, &class_id, &student_id) {
        Ok(extras) => ok(&req.id, json!({ "extras": extras })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_extras_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let (class_id, student_id) = match student_in_class(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut values = match collect_fields(patch, EXTRAS_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    // The note column is NOT NULL; a cleared note is stored empty.
    for (col, v) in values.iter_mut() {
        if *col == "homeroom_note" && matches!(v, Value::Null) {
            *v = Value::Text(String::new());
        }
    }

    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO student_extras(class_id, student_id) VALUES(?, ?)",
        (&class_id, &student_id),
    ) {
        return db_failed(req, "db_insert_failed", e, "student_extras");
    }
    if !values.is_empty() {
        let sets = values
            .iter()
            .map(|(c, _)| format!("{} = ?", c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE student_extras SET {} WHERE class_id = ? AND student_id = ?",
            sets
        );
        let mut bind: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
        bind.push(Value::Text(class_id.clone()));
        bind.push(Value::Text(student_id.clone()));
        if let Err(e) = conn.execute(&sql, params_from_iter(bind)) {
            return db_failed(req, "db_update_failed", e, "student_extras");
        }
    }

    match rapor::load_extras(conn, &class_id, &student_id) {
        Ok(extras) => ok(&req.id, json!({ "extras": extras })),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "extras.get" => Some(handle_extras_get(state, req)),
        "extras.update" => Some(handle_extras_update(state, req)),
        _ => None,
    }
}
