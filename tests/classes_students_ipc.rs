mod test_support;

use serde_json::json;
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

#[test]
fn class_delete_removes_every_dependent_row() {
    let workspace = temp_dir("rapor-class-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let keep = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "3A" })),
        "classId",
    );
    let doomed = str_field(
        &request_ok(&mut stdin, &mut reader, "3", "classes.create", json!({ "name": "3B" })),
        "classId",
    );
    let student = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "students.create",
            json!({ "classId": doomed, "student": { "name": "Ani" } }),
        ),
        "studentId",
    );
    let subject = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "5",
            "subjects.create",
            json!({ "classId": doomed, "subject": { "name": "Seni Rupa" } }),
        ),
        "subjectId",
    );
    let objective = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "6",
            "objectives.create",
            json!({ "subjectId": subject, "objective": { "code": "TP1", "description": "Menggambar" } }),
        ),
        "objectiveId",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "scores.bulkUpdate",
        json!({
            "classId": doomed,
            "subjectId": subject,
            "edits": [
                { "studentId": student, "column": objective, "value": 88 },
                { "studentId": student, "column": "SAS", "value": 90 }
            ]
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "extras.update",
        json!({ "classId": doomed, "studentId": student, "patch": { "absent": 2 } }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "classes.delete",
        json!({ "classId": doomed }),
    );
    let listed = request_ok(&mut stdin, &mut reader, "10", "classes.list", json!({}));
    let ids: Vec<&str> = listed["classes"]
        .as_array()
        .expect("classes")
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(ids, vec![keep.as_str()]);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "classes.delete",
        json!({ "classId": doomed }),
    );
    assert_eq!(code, "not_found");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "12",
        "objectives.list",
        json!({ "subjectId": subject }),
    );
    assert_eq!(code, "not_found");

    drop(stdin);
    let conn = rusqlite::Connection::open(workspace.join("rapor.sqlite3")).expect("open db");
    for table in [
        "objective_scores",
        "sas_scores",
        "objectives",
        "subjects",
        "student_extras",
        "students",
    ] {
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0, "{} should be empty", table);
    }
    drop(conn);
    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn students_crud_reorder_and_extras() {
    let workspace = temp_dir("rapor-students");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "2",
            "classes.create",
            json!({ "name": "2C", "gradeLevel": 2 }),
        ),
        "classId",
    );

    let mut ids = Vec::new();
    for (i, name) in ["Ani", "Budi", "Citra"].iter().enumerate() {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "students.create",
            json!({ "classId": class_id, "student": { "name": name, "gender": "p" } }),
        );
        assert_eq!(created["sortOrder"], json!(i));
        ids.push(str_field(&created, "studentId"));
    }

    let bad = [
        json!({ "classId": class_id, "student": { "gender": "L" } }),
        json!({ "classId": class_id, "student": { "name": "X", "gender": "M" } }),
        json!({ "classId": class_id, "student": { "name": "X", "birthDate": "17-08-2013" } }),
        json!({ "classId": class_id, "student": { "name": "X", "shoeSize": 40 } }),
    ];
    for (i, params) in bad.into_iter().enumerate() {
        let code = request_err(
            &mut stdin,
            &mut reader,
            &format!("bad{}", i),
            "students.create",
            params,
        );
        assert_eq!(code, "bad_params");
    }
    let code = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "classId": "missing", "student": { "name": "X" } }),
    );
    assert_eq!(code, "not_found");

    let code = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "students.reorder",
        json!({ "classId": class_id, "orderedStudentIds": [ids[0], ids[1]] }),
    );
    assert_eq!(code, "bad_params");
    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.reorder",
        json!({ "classId": class_id, "orderedStudentIds": [ids[2], ids[0], ids[1]] }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.delete",
        json!({ "classId": class_id, "studentId": ids[0] }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.list",
        json!({ "classId": class_id }),
    );
    let rows = listed["students"].as_array().expect("students");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], json!("Citra"));
    assert_eq!(rows[0]["gender"], json!("P"));
    assert_eq!(rows[0]["genderLabel"], json!("Perempuan"));
    assert_eq!(rows[1]["name"], json!("Budi"));
    assert_eq!(rows[1]["sortOrder"], json!(1));

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "extras.get",
        json!({ "classId": class_id, "studentId": ids[1] }),
    );
    assert_eq!(empty["extras"]["sick"], json!(0));
    assert_eq!(empty["extras"]["homeroomNote"], json!(""));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "extras.update",
        json!({
            "classId": class_id,
            "studentId": ids[1],
            "patch": { "sick": 3, "homeroomNote": "Rajin membaca.", "promotion": "Naik ke kelas 3" }
        }),
    );
    assert_eq!(updated["extras"]["sick"], json!(3));
    assert_eq!(updated["extras"]["promotion"], json!("Naik ke kelas 3"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "10",
        "extras.update",
        json!({ "classId": class_id, "studentId": ids[1], "patch": { "sick": -1 } }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "extras.get",
        json!({ "classId": class_id, "studentId": ids[0] }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn subjects_reject_duplicates_and_cascade_on_delete() {
    let workspace = temp_dir("rapor-subjects");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = str_field(
        &request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "6A" })),
        "classId",
    );
    let mtk = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "3",
            "subjects.create",
            json!({ "classId": class_id, "subject": { "name": "Matematika", "group": "Wajib" } }),
        ),
        "subjectId",
    );
    let bjawa = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "4",
            "subjects.create",
            json!({ "classId": class_id, "subject": { "name": "Bahasa Jawa", "group": "mulok" } }),
        ),
        "subjectId",
    );

    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "classId": class_id, "subject": { "name": "Matematika" } }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.update",
        json!({ "classId": class_id, "subjectId": bjawa, "patch": { "name": "Matematika" } }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.create",
        json!({ "classId": class_id, "subject": { "name": "Tari", "group": "ekstra" } }),
    );
    assert_eq!(code, "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "objectives.create",
        json!({ "subjectId": mtk, "objective": { "code": "TP1", "description": "Pecahan" } }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "subjects.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["subjects"][0]["group"], json!("wajib"));
    assert_eq!(listed["subjects"][0]["objectiveCount"], json!(1));
    assert_eq!(listed["subjects"][1]["sortOrder"], json!(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "subjects.delete",
        json!({ "classId": class_id, "subjectId": mtk }),
    );
    let code = request_err(
        &mut stdin,
        &mut reader,
        "11",
        "objectives.list",
        json!({ "subjectId": mtk }),
    );
    assert_eq!(code, "not_found");
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "subjects.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["subjects"].as_array().map(|s| s.len()), Some(1));
    assert_eq!(listed["subjects"][0]["id"], json!(bjawa));

    let _ = std::fs::remove_dir_all(&workspace);
}
