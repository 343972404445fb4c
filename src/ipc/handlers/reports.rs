use crate::calc;
use crate::config;
use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::rapor::{self, ClassSheets};
use serde_json::json;

fn handle_cover_model(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match rapor::build_cover(conn, &class_id, &student_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_biodata_model(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match rapor::build_biodata(conn, &class_id, &student_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_rapor_model(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match rapor::build_rapor(conn, &class_id, &student_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn batch_student_ids(state: &AppState, req: &Request, class_id: &str) -> Result<Vec<String>, serde_json::Value> {
    let conn = db_conn(state, req)?;
    let roster = calc::load_students(conn, class_id).map_err(|e| calc_err(&req.id, e))?;

    let Some(raw) = req.params.get("studentIds") else {
        let include_inactive = req
            .params
            .get("includeInactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        return Ok(roster
            .into_iter()
            .filter(|s| include_inactive || s.active)
            .map(|s| s.id)
            .collect());
    };

    // Explicit subsets are still emitted in roster order.
    let Some(arr) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "studentIds must be an array", None));
    };
    let mut wanted = std::collections::HashSet::new();
    for v in arr {
        let Some(id) = v.as_str() else {
            return Err(err(&req.id, "bad_params", "studentIds must be strings", None));
        };
        if !roster.iter().any(|s| s.id == id) {
            return Err(err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "studentId": id })),
            ));
        }
        wanted.insert(id.to_string());
    }
    Ok(roster
        .into_iter()
        .filter(|s| wanted.contains(&s.id))
        .map(|s| s.id)
        .collect())
}

fn handle_rapor_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let concurrency = match req.params.get("concurrency") {
        None => state.batch_concurrency,
        Some(v) => match v.as_u64() {
            Some(n) => config::clamp_concurrency(n as usize),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "concurrency must be a positive integer",
                    None,
                )
            }
        },
    };

    let sheets = match ClassSheets::load(conn, &class_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    let student_ids = match batch_student_ids(state, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match rapor::build_rapor_batch(&db::db_path(workspace), &sheets, &student_ids, concurrency) {
        Ok(models) => ok(
            &req.id,
            json!({
                "classId": class_id,
                "count": models.len(),
                "concurrency": concurrency,
                "models": models
            }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_leger_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match rapor::build_leger(conn, &class_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.coverModel" => Some(handle_cover_model(state, req)),
        "reports.biodataModel" => Some(handle_biodata_model(state, req)),
        "reports.raporModel" => Some(handle_rapor_model(state, req)),
        "reports.raporBatch" => Some(handle_rapor_batch(state, req)),
        "reports.legerModel" => Some(handle_leger_model(state, req)),
        _ => None,
    }
}
