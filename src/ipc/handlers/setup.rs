use crate::calc::{GradingSettings, GRADING_SETTINGS_KEY};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::rapor::{PrintSettings, PRINT_SETTINGS_KEY};
use rusqlite::Connection;
use serde_json::{json, Map, Value};
use tracing::info;

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Print,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "print" => Some(Self::Print),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => GRADING_SETTINGS_KEY,
            Self::Print => PRINT_SETTINGS_KEY,
        }
    }

    /// Numeric keys with their accepted range.
    fn numeric_keys(self) -> &'static [(&'static str, f64, f64)] {
        match self {
            Self::Grading => &[
                ("defaultKktp", 0.0, 100.0),
                ("bandA", 0.0, 100.0),
                ("bandB", 0.0, 100.0),
                ("bandC", 0.0, 100.0),
            ],
            Self::Print => &[
                ("pageHeight", 50.0, 500.0),
                ("headerHeight", 0.0, 500.0),
                ("continuationHeaderHeight", 0.0, 500.0),
                ("footerHeight", 0.0, 500.0),
                ("lineHeight", 1.0, 30.0),
                ("cellPadding", 0.0, 20.0),
                ("minRowHeight", 1.0, 100.0),
                ("subjectChars", 5.0, 200.0),
                ("descriptionChars", 10.0, 400.0),
            ],
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!(GradingSettings::default()),
        SetupSection::Print => json!(PrintSettings::default()),
    }
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut merged = default_section(section);
    if let Some(stored) = db::settings_get_json(conn, section.key())? {
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), stored.as_object()) {
            for (k, v) in src {
                if dst.contains_key(k) {
                    dst.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Ok(merged)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    let ranges = section.numeric_keys();
    for (k, v) in patch {
        let Some((key, min, max)) = ranges.iter().find(|(key, _, _)| *key == k.as_str()) else {
            return Err(format!("unknown setup key: {}", k));
        };
        let n = v
            .as_f64()
            .ok_or_else(|| format!("{} must be a number", key))?;
        if !n.is_finite() || n < *min || n > *max {
            return Err(format!("{} must be in {}..={}", key, min, max));
        }
        if n.fract() == 0.0 {
            obj.insert(k.clone(), json!(n as i64));
        } else if key.ends_with("Chars") {
            return Err(format!("{} must be an integer", key));
        } else {
            obj.insert(k.clone(), json!(n));
        }
    }

    // Cross-field rules.
    let num = |o: &Map<String, Value>, k: &str| o.get(k).and_then(|v| v.as_f64()).unwrap_or(0.0);
    match section {
        SetupSection::Grading => {
            let (a, b, c) = (num(obj, "bandA"), num(obj, "bandB"), num(obj, "bandC"));
            if !(a > b && b > c) {
                return Err("predicate bands must satisfy bandA > bandB > bandC".to_string());
            }
        }
        SetupSection::Print => {
            let page = num(obj, "pageHeight");
            if num(obj, "headerHeight") >= page || num(obj, "continuationHeaderHeight") >= page {
                return Err("header heights must be smaller than pageHeight".to_string());
            }
        }
    }
    Ok(())
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let print = match load_section(conn, SetupSection::Print) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "grading": grading, "print": print }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section_raw, "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
