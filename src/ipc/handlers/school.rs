use crate::ipc::error::{calc_err, ok};
use crate::ipc::helpers::{
    bad_params, collect_fields, db_conn, db_failed, field, patch_obj, update_row, Field, FieldKind,
};
use crate::ipc::types::{AppState, Request};
use crate::rapor;
use serde_json::json;
use tracing::info;

const SCHOOL_FIELDS: &[Field] = &[
    field("name", "name", FieldKind::Required),
    field("npsn", "npsn", FieldKind::Text),
    field("nss", "nss", FieldKind::Text),
    field("address", "address", FieldKind::Text),
    field("village", "village", FieldKind::Text),
    field("district", "district", FieldKind::Text),
    field("city", "city", FieldKind::Text),
    field("province", "province", FieldKind::Text),
    field("postalCode", "postal_code", FieldKind::Text),
    field("phone", "phone", FieldKind::Text),
    field("email", "email", FieldKind::Text),
    field("website", "website", FieldKind::Text),
    field("principalName", "principal_name", FieldKind::Text),
    field("principalNip", "principal_nip", FieldKind::Text),
];

fn handle_school_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match rapor::load_school(conn) {
        Ok(school) => ok(&req.id, json!({ "school": school })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_school_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let patch = match patch_obj(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let values = match collect_fields(patch, SCHOOL_FIELDS) {
        Ok(v) => v,
        Err(msg) => return bad_params(req, msg),
    };
    if let Err(e) = update_row(conn, "schools", "default", values) {
        return db_failed(req, "db_update_failed", e, "schools");
    }
    info!(fields = patch.len(), "school profile updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "school.get" => Some(handle_school_get(state, req)),
        "school.update" => Some(handle_school_update(state, req)),
        _ => None,
    }
}
