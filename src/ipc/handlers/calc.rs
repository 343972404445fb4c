use crate::calc::{self, WeightChange, WeightSlot};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, parse_score, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn parse_slots(raw: &[serde_json::Value]) -> Result<Vec<WeightSlot>, String> {
    let mut slots = Vec::with_capacity(raw.len());
    for (i, v) in raw.iter().enumerate() {
        let key = v
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| format!("slots[{}].key must be a string", i))?;
        let manual = match v.get("manual") {
            None => None,
            Some(m) if m.is_null() => None,
            // Range errors are reported by the distribution itself.
            Some(m) => Some(
                m.as_f64()
                    .ok_or_else(|| format!("slots[{}].manual must be a number or null", i))?,
            ),
        };
        slots.push(WeightSlot::new(key, manual));
    }
    Ok(slots)
}

/// Either a free-form preview over `slots`, or the stored weights of `subjectId`.
fn handle_calc_weights(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(raw) = req.params.get("slots") {
        let Some(arr) = raw.as_array() else {
            return err(&req.id, "bad_params", "slots must be an array", None);
        };
        let slots = match parse_slots(arr) {
            Ok(v) => v,
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        };
        return match calc::distribute_weights(&slots) {
            Ok(shares) => {
                let total: f64 = shares.iter().map(|s| s.weight).sum();
                ok(
                    &req.id,
                    json!({ "weights": shares, "total": calc::round_off_2_decimal(total) }),
                )
            }
            Err(e) => calc_err(&req.id, e),
        };
    }

    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sas: Option<Option<f64>> = match conn
        .query_row(
            "SELECT sas_weight FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(sas) = sas else {
        return err(&req.id, "not_found", "subject not found", None);
    };
    match calc::check_subject_budget(conn, &subject_id, WeightChange::Sas(sas)) {
        Ok(w) => ok(
            &req.id,
            json!({ "objectives": w.objectives, "sas": w.sas, "total": calc::round_off_2_decimal(w.total()) }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_calc_subject_finals(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match calc::compute_subject_finals(conn, &class_id, &subject_id) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_calc_student_finals(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match calc::compute_student_finals(conn, &class_id, &student_id) {
        Ok(subjects) => ok(
            &req.id,
            json!({ "studentId": student_id, "subjects": subjects }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

/// Score preview without touching the workspace: `scores[]` against `weights[]`.
fn handle_calc_preview(req: &Request) -> serde_json::Value {
    let Some(pairs) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items[]", None);
    };
    let mut parsed = Vec::with_capacity(pairs.len());
    for (i, item) in pairs.iter().enumerate() {
        let score = match parse_score(
            item.get("score").unwrap_or(&serde_json::Value::Null),
            "score",
        ) {
            Ok(v) => v,
            Err(msg) => return err(&req.id, "bad_params", msg, Some(json!({ "index": i }))),
        };
        let Some(weight) = item.get("weight").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                "weight must be a number",
                Some(json!({ "index": i })),
            );
        };
        parsed.push((score, weight));
    }
    let na = calc::weighted_average(parsed);
    ok(
        &req.id,
        json!({ "na": na, "naRounded": na.map(calc::round_half_up) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.weights" => Some(handle_calc_weights(state, req)),
        "calc.subjectFinals" => Some(handle_calc_subject_finals(state, req)),
        "calc.studentFinals" => Some(handle_calc_student_finals(state, req)),
        "calc.preview" => Some(handle_calc_preview(req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_slots_reads_keys_and_optional_manual() {
        let raw = vec![
            json!({ "key": "TP1", "manual": 30 }),
            json!({ "key": "TP2" }),
            json!({ "key": "SAS", "manual": null }),
        ];
        let slots = parse_slots(&raw).expect("slots");
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].manual, Some(30.0));
        assert_eq!(slots[1].manual, None);
        assert_eq!(slots[2].key, "SAS");

        assert!(parse_slots(&[json!({ "manual": 10 })]).is_err());
        assert!(parse_slots(&[json!({ "key": "x", "manual": "ten" })]).is_err());
    }
}
