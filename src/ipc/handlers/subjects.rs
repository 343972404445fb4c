use crate::calc::{self, WeightChange};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, check_required, collect_fields, db_conn, db_failed, field, insert_row,
    next_sort_order, patch_obj, required_str, row_exists, update_row, Field, FieldKind,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

pub const SUBJECT_GROUPS: &[&str] = &["wajib", "pilihan", "mulok"];

const SUBJECT_FIELDS: &[Field] = &[
    field("name", "name", FieldKind::Required),
    field("shortName", "short_name", FieldKind::Text),
    field("group", "subject_group", FieldKind::OneOf(SUBJECT_GROUPS)),
    field("kktp", "kktp", FieldKind::Score),
    field("sasWeight", "sas_weight", FieldKind::Weight),
];

fn name_taken(
    conn: &Connection,
    class_id: &str,
    name: &str,
    except_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE class_id = ? AND name = ?",
            (class_id, name),
            |r| r.get(0),
        )
        .optional()?;
    Ok(matches!(found, Some(id) if Some(id.as_str()) != except_id))
}

fn text_value<'a>(values: &'a [(&'static str, Value)], column: &str) -> Option<&'a str> {
    values.iter().find_map(|(c, v)| match v {
        Value::Text(s) if *c == column => Some(s.as_str()),
        _ => None,
    })
}

fn real_value(values: &[(&'static str, Value)], column: &str) -> Option<Option<f64>> {
    values.iter().find_map(|(c, v)| {
        if *c != column {
            return None;
        }
        match v {
            Value::Real(n) => Some(Some(*n)),
            Value::Integer(n) => Some(Some(*n as f64)),
            _ => Some(None),
        }
    })
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT
           sj.id,
           sj.name,
           sj.short_name,
           sj.subject_group,
           sj.kktp,
           sj.sas_weight,
           sj.sort_order,
           (SELECT COUNT(*) FROM objectives o WHERE o.subject_id = sj.id) AS objective_count
         FROM subjects sj
         WHERE sj.class_id = ?
         ORDER BY sj.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "shortName": row.get::<_, Option<String>>(2)?,
                "group": row.get::<_, String>(3)?,
                "kktp": row.get::<_, Option<f64>>(4)?,
                "sasWeight": row.get::<_, Option<f64>>(5)?,
                "sortOrder": row.get::<_, i64>(6)?,
                "objectiveCount": row.get::<_, i64>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(subject) = req.params.get("subject").and_then(|v| v.as_object()) else {
        return bad_params(req, "subject must be an object");
    };
    if let Err(msg) = check_required(subject, SUBJECT_FIELDS) {
        return bad_params(req, msg);
    }
    let values = match collect_fields(subject, SUBJECT_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };

    match row_exists(conn, "classes", &class_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let name = text_value(&values, "name").unwrap_or_default().to_string();
    match name_taken(conn, &class_id, &name, None) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "bad_params",
                "a subject with this name already exists in the class",
                Some(json!({ "name": name })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    // A new subject has no objectives yet, so only the SAS weight can overflow.
    if let Some(sas) = real_value(&values, "sas_weight") {
        if let Err(e) = calc::subject_weights(&[], sas) {
            return calc_err(&req.id, e);
        }
    }

    let sort_order = match next_sort_order(conn, "subjects", "class_id", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = insert_row(
        conn,
        "subjects",
        values,
        vec![
            ("id", Value::Text(subject_id.clone())),
            ("class_id", Value::Text(class_id.clone())),
            ("sort_order", Value::Integer(sort_order)),
        ],
    ) {
        return db_failed(req, "db_insert_failed", e, "subjects");
    }

    info!(class_id = %class_id, subject_id = %subject_id, "subject created");
    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let values = match collect_fields(patch, SUBJECT_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };

    match row_exists(conn, "subjects", &subject_id, Some(("class_id", &class_id))) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(name) = text_value(&values, "name") {
        match name_taken(conn, &class_id, name, Some(&subject_id)) {
            Ok(false) => {}
            Ok(true) => {
                return err(
                    &req.id,
                    "bad_params",
                    "a subject with this name already exists in the class",
                    Some(json!({ "name": name })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(sas) = real_value(&values, "sas_weight") {
        if let Err(e) = calc::check_subject_budget(conn, &subject_id, WeightChange::Sas(sas)) {
            return calc_err(&req.id, e);
        }
    }

    if let Err(e) = update_row(conn, "subjects", &subject_id, values) {
        return db_failed(req, "db_update_failed", e, "subjects");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "subjects", &subject_id, Some(("class_id", &class_id))) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let steps: [(&str, &str); 4] = [
        (
            "objective_scores",
            "DELETE FROM objective_scores
             WHERE objective_id IN (SELECT id FROM objectives WHERE subject_id = ?)",
        ),
        ("sas_scores", "DELETE FROM sas_scores WHERE subject_id = ?"),
        ("objectives", "DELETE FROM objectives WHERE subject_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&subject_id]) {
            let _ = tx.rollback();
            return db_failed(req, "db_delete_failed", e, table);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    info!(class_id = %class_id, subject_id = %subject_id, "subject deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
