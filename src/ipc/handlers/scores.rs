use crate::calc::{self, CalcError, GradingSettings, SAS_KEY};
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::helpers::{db_conn, now_stamp, parse_score, required_str, row_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashSet;
use tracing::info;

const BULK_UPDATE_MAX_EDITS: usize = 5000;

struct EditErr {
    code: &'static str,
    message: String,
}

fn write_score(
    conn: &Connection,
    subject_id: &str,
    column: &str,
    student_id: &str,
    score: Option<f64>,
) -> rusqlite::Result<()> {
    let stamp = now_stamp();
    match (column == SAS_KEY, score) {
        (true, Some(v)) => conn.execute(
            "INSERT INTO sas_scores(subject_id, student_id, score, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(subject_id, student_id) DO UPDATE SET
               score = excluded.score,
               updated_at = excluded.updated_at",
            (subject_id, student_id, v, &stamp),
        )?,
        (true, None) => conn.execute(
            "DELETE FROM sas_scores WHERE subject_id = ? AND student_id = ?",
            (subject_id, student_id),
        )?,
        (false, Some(v)) => conn.execute(
            "INSERT INTO objective_scores(objective_id, student_id, score, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(objective_id, student_id) DO UPDATE SET
               score = excluded.score,
               updated_at = excluded.updated_at",
            (column, student_id, v, &stamp),
        )?,
        (false, None) => conn.execute(
            "DELETE FROM objective_scores WHERE objective_id = ? AND student_id = ?",
            (column, student_id),
        )?,
    };
    Ok(())
}

fn handle_scores_grid(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let grid = (|| -> Result<serde_json::Value, CalcError> {
        let grading = GradingSettings::load(conn)?;
        let sheet = calc::load_subject_sheet(conn, &class_id, &subject_id, &grading)?;
        let students = calc::load_students(conn, &class_id)?;

        let mut columns: Vec<serde_json::Value> = sheet
            .objectives
            .iter()
            .zip(&sheet.weights.objectives)
            .map(|(o, w)| {
                json!({
                    "key": o.id,
                    "label": o.code,
                    "description": o.description,
                    "weight": w.weight,
                    "manual": w.manual
                })
            })
            .collect();
        columns.push(json!({
            "key": SAS_KEY,
            "label": SAS_KEY,
            "description": "Sumatif Akhir Semester",
            "weight": sheet.weights.sas.weight,
            "manual": sheet.weights.sas.manual
        }));

        let rows: Vec<serde_json::Value> = students
            .iter()
            .map(|s| {
                let mut cells: Vec<Option<f64>> = sheet
                    .objectives
                    .iter()
                    .map(|o| sheet.objective_score(&o.id, &s.id))
                    .collect();
                cells.push(sheet.sas_score(&s.id));
                let fin = sheet.final_for(&s.id);
                json!({
                    "studentId": s.id,
                    "name": s.name,
                    "active": s.active,
                    "cells": cells,
                    "na": fin.na,
                    "naRounded": fin.na_rounded
                })
            })
            .collect();

        Ok(json!({
            "subject": sheet.subject,
            "columns": columns,
            "rows": rows
        }))
    })();

    match grid {
        Ok(v) => ok(&req.id, v),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_scores_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > BULK_UPDATE_MAX_EDITS {
        return err(
            &req.id,
            "bad_params",
            format!(
                "bulk payload exceeds max edits: {} > {}",
                edits_arr.len(),
                BULK_UPDATE_MAX_EDITS
            ),
            Some(json!({ "max": BULK_UPDATE_MAX_EDITS })),
        );
    }

    match row_exists(conn, "subjects", &subject_id, Some(("class_id", &class_id))) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let id_set = |sql: &str, key: &str| -> rusqlite::Result<HashSet<String>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map([key], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    };
    let students = match id_set("SELECT id FROM students WHERE class_id = ?", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let objectives = match id_set("SELECT id FROM objectives WHERE subject_id = ?", &subject_id)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let applied = (|| -> Result<(), EditErr> {
            let obj = edit.as_object().ok_or_else(|| EditErr {
                code: "bad_params",
                message: "edit must be an object".to_string(),
            })?;
            let student_id = obj
                .get("studentId")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EditErr {
                    code: "bad_params",
                    message: "missing studentId".to_string(),
                })?;
            let column = obj
                .get("column")
                .and_then(|v| v.as_str())
                .ok_or_else(|| EditErr {
                    code: "bad_params",
                    message: "missing column".to_string(),
                })?;
            let score = parse_score(
                obj.get("value").unwrap_or(&serde_json::Value::Null),
                "value",
            )
            .map_err(|message| EditErr {
                code: "bad_params",
                message,
            })?;
            if !students.contains(student_id) {
                return Err(EditErr {
                    code: "not_found",
                    message: "student not found".to_string(),
                });
            }
            if column != SAS_KEY && !objectives.contains(column) {
                return Err(EditErr {
                    code: "not_found",
                    message: "objective not found".to_string(),
                });
            }
            write_score(&tx, &subject_id, column, student_id, score).map_err(|e| EditErr {
                code: "db_update_failed",
                message: e.to_string(),
            })
        })();

        match applied {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    info!(
        subject_id = %subject_id,
        updated,
        rejected = errors.len(),
        "scores bulk update"
    );
    let mut result = json!({ "ok": true, "updated": updated });
    if !errors.is_empty() {
        result["rejected"] = json!(errors.len());
        result["errors"] = json!(errors);
    }
    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.grid" => Some(handle_scores_grid(state, req)),
        "scores.bulkUpdate" => Some(handle_scores_bulk_update(state, req)),
        _ => None,
    }
}
