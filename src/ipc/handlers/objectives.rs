use crate::calc::{self, WeightChange};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{
    bad_params, check_required, collect_fields, db_conn, db_failed, field, insert_row,
    next_sort_order, patch_obj, required_str, row_exists, update_row, Field, FieldKind,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

const OBJECTIVE_FIELDS: &[Field] = &[
    field("code", "code", FieldKind::Required),
    field("description", "description", FieldKind::Required),
    field("weight", "weight", FieldKind::Weight),
];

fn weight_of(values: &[(&'static str, Value)]) -> Option<Option<f64>> {
    values.iter().find_map(|(c, v)| match (*c, v) {
        ("weight", Value::Real(n)) => Some(Some(*n)),
        ("weight", _) => Some(None),
        _ => None,
    })
}

fn handle_objectives_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "subjects", &subject_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    // Effective bobot alongside the stored manual value.
    let effective = match effective_weights(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, code, description, weight, sort_order
         FROM objectives
         WHERE subject_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let effective_weight = effective.as_ref().and_then(|m| m.get(&id).copied());
            Ok(json!({
                "id": id,
                "code": row.get::<_, String>(1)?,
                "description": row.get::<_, String>(2)?,
                "weight": row.get::<_, Option<f64>>(3)?,
                "effectiveWeight": effective_weight,
                "sortOrder": row.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(objectives) => ok(&req.id, json!({ "objectives": objectives })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// `None` when the stored weights are over budget; the list still renders.
fn effective_weights(
    conn: &rusqlite::Connection,
    subject_id: &str,
) -> Result<Option<HashMap<String, f64>>, calc::CalcError> {
    let stored_sas: Option<f64> = conn
        .query_row(
            "SELECT sas_weight FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .map_err(calc::CalcError::db)?;
    match calc::check_subject_budget(conn, subject_id, WeightChange::Sas(stored_sas)) {
        Ok(w) => Ok(Some(
            w.objectives.into_iter().map(|s| (s.key, s.weight)).collect(),
        )),
        Err(e) if e.code == "weight_budget_exceeded" || e.code == "bad_weight" => Ok(None),
        Err(e) => Err(e),
    }
}

fn handle_objectives_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(objective) = req.params.get("objective").and_then(|v| v.as_object()) else {
        return bad_params(req, "objective must be an object");
    };
    if let Err(msg) = check_required(objective, OBJECTIVE_FIELDS) {
        return bad_params(req, msg);
    }
    let values = match collect_fields(objective, OBJECTIVE_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };

    match row_exists(conn, "subjects", &subject_id, None) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let objective_id = Uuid::new_v4().to_string();
    let manual = weight_of(&values).flatten();
    if let Err(e) = calc::check_subject_budget(
        conn,
        &subject_id,
        WeightChange::Objective {
            id: &objective_id,
            manual,
        },
    ) {
        return calc_err(&req.id, e);
    }

    let sort_order = match next_sort_order(conn, "objectives", "subject_id", &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = insert_row(
        conn,
        "objectives",
        values,
        vec![
            ("id", Value::Text(objective_id.clone())),
            ("subject_id", Value::Text(subject_id.clone())),
            ("sort_order", Value::Integer(sort_order)),
        ],
    ) {
        return db_failed(req, "db_insert_failed", e, "objectives");
    }

    info!(subject_id = %subject_id, objective_id = %objective_id, "objective created");
    ok(&req.id, json!({ "objectiveId": objective_id }))
}

fn handle_objectives_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let objective_id = match required_str(req, "objectiveId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let values = match collect_fields(patch, OBJECTIVE_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };

    match row_exists(
        conn,
        "objectives",
        &objective_id,
        Some(("subject_id", &subject_id)),
    ) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "objective not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Some(manual) = weight_of(&values) {
        if let Err(e) = calc::check_subject_budget(
            conn,
            &subject_id,
            WeightChange::Objective {
                id: &objective_id,
                manual,
            },
        ) {
            return calc_err(&req.id, e);
        }
    }

    if let Err(e) = update_row(conn, "objectives", &objective_id, values) {
        return db_failed(req, "db_update_failed", e, "objectives");
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_objectives_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let objective_id = match required_str(req, "objectiveId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(
        conn,
        "objectives",
        &objective_id,
        Some(("subject_id", &subject_id)),
    ) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "objective not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM objective_scores WHERE objective_id = ?",
        [&objective_id],
    ) {
        let _ = tx.rollback();
        return db_failed(req, "db_delete_failed", e, "objective_scores");
    }
    if let Err(e) = tx.execute("DELETE FROM objectives WHERE id = ?", [&objective_id]) {
        let _ = tx.rollback();
        return db_failed(req, "db_delete_failed", e, "objectives");
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    info!(subject_id = %subject_id, objective_id = %objective_id, "objective deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "objectives.list" => Some(handle_objectives_list(state, req)),
        "objectives.create" => Some(handle_objectives_create(state, req)),
        "objectives.update" => Some(handle_objectives_update(state, req)),
        "objectives.delete" => Some(handle_objectives_delete(state, req)),
        _ => None,
    }
}
