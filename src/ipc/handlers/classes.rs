use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    bad_params, check_required, collect_fields, db_conn, db_failed, field, insert_row,
    patch_obj, required_str, row_exists, update_row, Field, FieldKind,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const CLASS_FIELDS: &[Field] = &[
    field("name", "name", FieldKind::Required),
    field("phase", "phase", FieldKind::Text),
    field("gradeLevel", "grade_level", FieldKind::Int { min: 1, max: 12 }),
    field("semester", "semester", FieldKind::Int { min: 1, max: 2 }),
    field("academicYear", "academic_year", FieldKind::Text),
    field("homeroomName", "homeroom_name", FieldKind::Text),
    field("homeroomNip", "homeroom_nip", FieldKind::Text),
    field("reportPlace", "report_place", FieldKind::Text),
    field("reportDate", "report_date", FieldKind::Date),
];

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.phase,
           c.semester,
           c.academic_year,
           c.homeroom_name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM subjects sj WHERE sj.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.sort_order, c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let phase: Option<String> = row.get(2)?;
            let semester: i64 = row.get(3)?;
            let academic_year: Option<String> = row.get(4)?;
            let homeroom_name: Option<String> = row.get(5)?;
            let student_count: i64 = row.get(6)?;
            let subject_count: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "phase": phase,
                "semester": semester,
                "academicYear": academic_year,
                "homeroomName": homeroom_name,
                "studentCount": student_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(params) = req.params.as_object() else {
        return bad_params(req, "params must be an object");
    };
    if let Err(msg) = check_required(params, CLASS_FIELDS) {
        return bad_params(req, msg);
    }
    let values = match collect_fields(params, CLASS_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM classes",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = insert_row(
        conn,
        "classes",
        values,
        vec![
            ("id", Value::Text(class_id.clone())),
            ("sort_order", Value::Integer(sort_order)),
        ],
    ) {
        return db_failed(req, "db_insert_failed", e, "classes");
    }

    info!(class_id = %class_id, "class created");
    ok(&req.id, json!({ "classId": class_id }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let values = match collect_fields(patch, CLASS_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    match row_exists(conn, "classes", &class_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = update_row(conn, "classes", &class_id, values) {
        return db_failed(req, "db_update_failed", e, "classes");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "classes", &class_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // No ON DELETE CASCADE; children go first.
    let steps: [(&str, &str); 7] = [
        (
            "objective_scores",
            "DELETE FROM objective_scores
             WHERE objective_id IN (
               SELECT o.id
               FROM objectives o
               JOIN subjects sj ON sj.id = o.subject_id
               WHERE sj.class_id = ?
             )",
        ),
        (
            "sas_scores",
            "DELETE FROM sas_scores
             WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        ),
        (
            "objectives",
            "DELETE FROM objectives
             WHERE subject_id IN (SELECT id FROM subjects WHERE class_id = ?)",
        ),
        ("subjects", "DELETE FROM subjects WHERE class_id = ?"),
        ("student_extras", "DELETE FROM student_extras WHERE class_id = ?"),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return db_failed(req, "db_delete_failed", e, table);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    info!(class_id = %class_id, "class deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
