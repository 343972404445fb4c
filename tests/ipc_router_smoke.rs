mod test_support;

use serde_json::json;
use test_support::{request, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("rapor-router-smoke");
    let bundle_out = workspace.join("smoke-backup.raporbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let mut n = 0;
    let mut call = |method: &str, params: serde_json::Value| {
        n += 1;
        let resp = request(&mut stdin, &mut reader, &n.to_string(), method, params);
        if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            let code = resp
                .pointer("/error/code")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            assert_ne!(code, "not_implemented", "unknown method {}", method);
        }
        resp
    };

    let health = call("health", json!({}));
    assert!(health.pointer("/result/version").is_some());

    call("workspace.select", json!({ "path": workspace.to_string_lossy() }));
    call("setup.get", json!({}));
    call("school.get", json!({}));
    call("school.update", json!({ "patch": { "name": "SD Negeri 1 Contoh" } }));

    let class = call("classes.create", json!({ "name": "4A", "semester": 1 }));
    let class_id = class
        .pointer("/result/classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    call("classes.list", json!({}));
    call("classes.update", json!({ "classId": class_id, "patch": { "phase": "B" } }));

    let student = call(
        "students.create",
        json!({ "classId": class_id, "student": { "name": "Ani", "gender": "P" } }),
    );
    let student_id = student
        .pointer("/result/studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    call("students.list", json!({ "classId": class_id }));
    call(
        "students.update",
        json!({ "classId": class_id, "studentId": student_id, "patch": { "nis": "1001" } }),
    );
    call(
        "students.reorder",
        json!({ "classId": class_id, "orderedStudentIds": [student_id] }),
    );

    let subject = call(
        "subjects.create",
        json!({ "classId": class_id, "subject": { "name": "Matematika", "group": "wajib" } }),
    );
    let subject_id = subject
        .pointer("/result/subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    call("subjects.list", json!({ "classId": class_id }));
    call(
        "subjects.update",
        json!({ "classId": class_id, "subjectId": subject_id, "patch": { "kktp": 70 } }),
    );
    call(
        "objectives.create",
        json!({
            "subjectId": subject_id,
            "objective": { "code": "TP1", "description": "Menghitung pecahan" }
        }),
    );
    call("objectives.list", json!({ "subjectId": subject_id }));
    call("scores.grid", json!({ "classId": class_id, "subjectId": subject_id }));
    call(
        "scores.bulkUpdate",
        json!({
            "classId": class_id,
            "subjectId": subject_id,
            "edits": [{ "studentId": student_id, "column": "SAS", "value": 80 }]
        }),
    );
    call("extras.get", json!({ "classId": class_id, "studentId": student_id }));
    call(
        "extras.update",
        json!({ "classId": class_id, "studentId": student_id, "patch": { "sick": 1 } }),
    );
    call("calc.weights", json!({ "subjectId": subject_id }));
    call("calc.subjectFinals", json!({ "classId": class_id, "subjectId": subject_id }));
    call("calc.studentFinals", json!({ "classId": class_id, "studentId": student_id }));
    for method in [
        "reports.coverModel",
        "reports.biodataModel",
        "reports.raporModel",
    ] {
        call(method, json!({ "classId": class_id, "studentId": student_id }));
    }
    call("reports.raporBatch", json!({ "classId": class_id }));
    call("reports.legerModel", json!({ "classId": class_id }));
    call(
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    call(
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle_out.to_string_lossy() }),
    );

    let unknown = call("nope.method", json!({}));
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn requests_before_workspace_select_report_no_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(&mut stdin, &mut reader, "1", "students.list", json!({ "classId": "x" }));
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("no_workspace")
    );
    let classes = request_ok(&mut stdin, &mut reader, "2", "classes.list", json!({}));
    assert_eq!(classes["classes"], json!([]));
}

#[test]
fn unparseable_line_gets_bad_json_and_loop_continues() {
    use std::io::{BufRead, Write};

    let (_child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let v: serde_json::Value = serde_json::from_str(line.trim()).expect("json reply");
    assert_eq!(v["ok"], json!(false));
    assert_eq!(v.pointer("/error/code").and_then(|c| c.as_str()), Some("bad_json"));

    let health = request_ok(&mut stdin, &mut reader, "h", "health", json!({}));
    assert!(!str_field(&health, "version").is_empty());
}
