use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, check_required, collect_fields, db_conn, db_failed, field, insert_row,
    next_sort_order, now_stamp, patch_obj, required_str, row_exists, update_row, Field,
    FieldKind,
};
use crate::ipc::types::{AppState, Request};
use crate::rapor;
use rusqlite::types::Value;
use serde_json::json;
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

const STUDENT_FIELDS: &[Field] = &[
    field("name", "name", FieldKind::Required),
    field("nis", "nis", FieldKind::Text),
    field("nisn", "nisn", FieldKind::Text),
    field("gender", "gender", FieldKind::OneOf(&["l", "p"])),
    field("birthPlace", "birth_place", FieldKind::Text),
    field("birthDate", "birth_date", FieldKind::Date),
    field("religion", "religion", FieldKind::Text),
    field("address", "address", FieldKind::Text),
    field("fatherName", "father_name", FieldKind::Text),
    field("fatherJob", "father_job", FieldKind::Text),
    field("motherName", "mother_name", FieldKind::Text),
    field("motherJob", "mother_job", FieldKind::Text),
    field("guardianName", "guardian_name", FieldKind::Text),
    field("guardianJob", "guardian_job", FieldKind::Text),
    field("guardianAddress", "guardian_address", FieldKind::Text),
    field("parentAddress", "parent_address", FieldKind::Text),
    field("admissionDate", "admission_date", FieldKind::Date),
    field("admittedClass", "admitted_class", FieldKind::Text),
    field("previousSchool", "previous_school", FieldKind::Text),
    field("active", "active", FieldKind::Bool),
];

/// Gender is stored upper-case (`L`/`P`) after the lower-case membership check.
fn normalize_gender(values: &mut [(&'static str, Value)]) {
    for (col, v) in values.iter_mut() {
        if *col == "gender" {
            if let Value::Text(s) = v {
                *s = s.to_ascii_uppercase();
            }
        }
    }
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, nis, nisn, name, gender, birth_place, birth_date, active, sort_order, updated_at
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            let gender: Option<String> = row.get(4)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "nis": row.get::<_, Option<String>>(1)?,
                "nisn": row.get::<_, Option<String>>(2)?,
                "name": row.get::<_, String>(3)?,
                "genderLabel": rapor::gender_label(gender.as_deref()),
                "gender": gender,
                "birthPlace": row.get::<_, Option<String>>(5)?,
                "birthDate": row.get::<_, Option<String>>(6)?,
                "active": row.get::<_, i64>(7)? != 0,
                "sortOrder": row.get::<_, i64>(8)?,
                "updatedAt": row.get::<_, Option<String>>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match rapor::load_student_bio(conn, &class_id, &student_id) {
        Ok(bio) => ok(&req.id, json!({ "student": bio })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(student) = req.params.get("student").and_then(|v| v.as_object()) else {
        return bad_params(req, "student must be an object");
    };
    if let Err(msg) = check_required(student, STUDENT_FIELDS) {
        return bad_params(req, msg);
    }
    let mut values = match collect_fields(student, STUDENT_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    normalize_gender(&mut values);

    match row_exists(conn, "classes", &class_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let sort_order = match next_sort_order(conn, "students", "class_id", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = insert_row(
        conn,
        "students",
        values,
        vec![
            ("id", Value::Text(student_id.clone())),
            ("class_id", Value::Text(class_id.clone())),
            ("sort_order", Value::Integer(sort_order)),
            ("updated_at", Value::Text(now_stamp())),
        ],
    ) {
        return db_failed(req, "db_insert_failed", e, "students");
    }

    info!(class_id = %class_id, student_id = %student_id, "student created");
    ok(
        &req.id,
        json!({ "studentId": student_id, "sortOrder": sort_order }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut values = match collect_fields(patch, STUDENT_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    normalize_gender(&mut values);

    match row_exists(conn, "students", &student_id, Some(("class_id", &class_id))) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if values.is_empty() {
        return ok(&req.id, json!({ "ok": true }));
    }
    values.push(("updated_at", Value::Text(now_stamp())));
    if let Err(e) = update_row(conn, "students", &student_id, values) {
        return db_failed(req, "db_update_failed", e, "students");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(arr) = req
        .params
        .get("orderedStudentIds")
        .and_then(|v| v.as_array())
    else {
        return bad_params(req, "missing/invalid orderedStudentIds");
    };
    let mut ordered: Vec<String> = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return bad_params(req, "orderedStudentIds must be strings");
        };
        ordered.push(s.to_string());
    }

    let mut stmt = match conn.prepare("SELECT id FROM students WHERE class_id = ?") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let current: HashSet<String> = match stmt
        .query_map([&class_id], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<HashSet<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Must be a permutation of the class roster.
    let given: HashSet<&String> = ordered.iter().collect();
    if given.len() != ordered.len()
        || ordered.len() != current.len()
        || !ordered.iter().all(|id| current.contains(id))
    {
        return err(
            &req.id,
            "bad_params",
            "orderedStudentIds must list every student of the class exactly once",
            Some(json!({ "expected": current.len(), "received": ordered.len() })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (i, student_id) in ordered.iter().enumerate() {
        if let Err(e) = tx.execute(
            "UPDATE students SET sort_order = ? WHERE id = ? AND class_id = ?",
            (i as i64, student_id, &class_id),
        ) {
            let _ = tx.rollback();
            return db_failed(req, "db_update_failed", e, "students");
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "students", &student_id, Some(("class_id", &class_id))) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let steps: [(&str, &str); 4] = [
        ("objective_scores", "DELETE FROM objective_scores WHERE student_id = ?"),
        ("sas_scores", "DELETE FROM sas_scores WHERE student_id = ?"),
        ("student_extras", "DELETE FROM student_extras WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return db_failed(req, "db_delete_failed", e, table);
        }
    }

    // Close the gap so sort_order stays dense.
    let mut stmt = match tx.prepare("SELECT id FROM students WHERE class_id = ? ORDER BY sort_order")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let remaining: Vec<String> = match stmt
        .query_map([&class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);
    for (i, id) in remaining.iter().enumerate() {
        if let Err(e) = tx.execute(
            "UPDATE students SET sort_order = ? WHERE id = ?",
            (i as i64, id),
        ) {
            let _ = tx.rollback();
            return db_failed(req, "db_update_failed", e, "students");
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    info!(class_id = %class_id, student_id = %student_id, "student deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.reorder" => Some(handle_students_reorder(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
