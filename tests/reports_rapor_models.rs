mod test_support;

use serde_json::json;
use std::io::BufReader;
use std::process::{ChildStdin, ChildStdout};
use test_support::{request_err, request_ok, spawn_sidecar, str_field, temp_dir};

struct Seeded {
    class_id: String,
    student_ids: Vec<String>,
}

fn seed_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    students: &[&str],
    subjects: usize,
) -> Seeded {
    let class = request_ok(
        stdin,
        reader,
        "seed-class",
        "classes.create",
        json!({
            "name": "6A",
            "semester": 2,
            "academicYear": "2024/2025",
            "homeroomName": "Sri Wahyuni",
            "reportPlace": "Bandung",
            "reportDate": "2025-06-20"
        }),
    );
    let class_id = str_field(&class, "classId");
    let mut student_ids = Vec::new();
    for (i, name) in students.iter().enumerate() {
        let s = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.create",
            json!({ "classId": class_id, "student": { "name": name, "gender": "L" } }),
        );
        student_ids.push(str_field(&s, "studentId"));
    }
    for i in 0..subjects {
        request_ok(
            stdin,
            reader,
            &format!("seed-subject-{}", i),
            "subjects.create",
            json!({ "classId": class_id, "subject": { "name": format!("Mapel {:02}", i + 1) } }),
        );
    }
    Seeded {
        class_id,
        student_ids,
    }
}

fn small_page_setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    // First page holds 60, continuation 90; unscored subject rows are 8 tall.
    request_ok(
        stdin,
        reader,
        "setup",
        "setup.update",
        json!({
            "section": "print",
            "patch": {
                "pageHeight": 100,
                "headerHeight": 40,
                "continuationHeaderHeight": 10,
                "footerHeight": 30,
                "lineHeight": 5,
                "cellPadding": 1,
                "minRowHeight": 8
            }
        }),
    );
}

fn page_subject_names(model: &serde_json::Value) -> Vec<Vec<String>> {
    model["pages"]
        .as_array()
        .expect("pages")
        .iter()
        .map(|p| {
            p["rows"]
                .as_array()
                .expect("rows")
                .iter()
                .filter_map(|r| r["row"]["subjectName"].as_str().map(str::to_string))
                .collect()
        })
        .collect()
}

#[test]
fn rapor_rows_are_packed_greedily_and_footer_lands_last() {
    let workspace = temp_dir("rapor-pagination");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    small_page_setup(&mut stdin, &mut reader);
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani"], 10);

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.raporModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    let pages = page_subject_names(&model);
    assert_eq!(model["pageCount"], json!(2));
    assert_eq!(pages[0].len(), 7);
    assert_eq!(pages[1].len(), 3);
    let flat: Vec<String> = pages.concat();
    let expected: Vec<String> = (1..=10).map(|i| format!("Mapel {:02}", i)).collect();
    assert_eq!(flat, expected);
    assert_eq!(model["pages"][0]["first"], json!(true));
    assert_eq!(model["pages"][1]["hasFooter"], json!(true));
    assert_eq!(model["pages"][0]["hasFooter"], json!(false));
    assert_eq!(model["footer"]["showPromotion"], json!(true));
    assert_eq!(model["footer"]["signature"]["date"], json!("20 Juni 2025"));
    assert_eq!(model["student"]["genderLabel"], json!("Laki-laki"));

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn footer_that_does_not_fit_gets_its_own_page() {
    let workspace = temp_dir("rapor-pagination-footer");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    small_page_setup(&mut stdin, &mut reader);
    // 7 rows fill page one, 11 rows leave 2 on page two.
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani"], 18);

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.raporModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    assert_eq!(model["pageCount"], json!(3));
    let pages = page_subject_names(&model);
    assert_eq!(pages[0].len(), 7);
    assert_eq!(pages[1].len(), 11);
    assert!(pages[2].is_empty());
    assert_eq!(model["pages"][2]["hasFooter"], json!(true));

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn group_headings_appear_only_with_several_groups() {
    let workspace = temp_dir("rapor-groups");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani"], 2);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "classId": seeded.class_id, "subject": { "name": "Bahasa Sunda", "group": "mulok" } }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.raporModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    let kinds: Vec<&str> = model["pages"][0]["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .filter_map(|r| r["row"]["kind"].as_str())
        .collect();
    assert_eq!(kinds, vec!["group", "subject", "subject", "group", "subject"]);
    assert_eq!(model["pages"][0]["rows"][4]["row"]["no"], json!(1));

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn group_heading_moves_to_the_page_of_its_first_subject() {
    let workspace = temp_dir("rapor-groups-keep");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    small_page_setup(&mut stdin, &mut reader);
    // Heading + 5 subjects use 48 of 60: the next heading would fit alone,
    // its first subject would not.
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani"], 5);
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "classId": seeded.class_id, "subject": { "name": "Bahasa Sunda", "group": "mulok" } }),
    );

    let model = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.raporModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    let kinds: Vec<Vec<String>> = model["pages"]
        .as_array()
        .expect("pages")
        .iter()
        .map(|p| {
            p["rows"]
                .as_array()
                .expect("rows")
                .iter()
                .filter_map(|r| r["row"]["kind"].as_str().map(str::to_string))
                .collect()
        })
        .collect();
    assert_eq!(model["pageCount"], json!(2));
    assert_eq!(kinds[0].last().map(String::as_str), Some("subject"));
    assert_eq!(kinds[0].len(), 6);
    assert_eq!(kinds[1], vec!["group".to_string(), "subject".to_string()]);
    assert_eq!(page_subject_names(&model)[1], vec!["Bahasa Sunda".to_string()]);

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn batch_keeps_roster_order_for_any_worker_count() {
    let workspace = temp_dir("rapor-batch-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let names = ["Ani", "Budi", "Citra", "Dewi", "Eko", "Fajar", "Gita"];
    let seeded = seed_class(&mut stdin, &mut reader, &names, 3);

    // Reverse the roster, then deactivate one student.
    let reversed: Vec<String> = seeded.student_ids.iter().rev().cloned().collect();
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.reorder",
        json!({ "classId": seeded.class_id, "orderedStudentIds": reversed }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({
            "classId": seeded.class_id,
            "studentId": seeded.student_ids[2],
            "patch": { "active": false }
        }),
    );

    let expected: Vec<&str> = names.iter().rev().copied().filter(|n| *n != "Citra").collect();
    for (i, concurrency) in [1, 3, 16].into_iter().enumerate() {
        let batch = request_ok(
            &mut stdin,
            &mut reader,
            &format!("batch-{}", i),
            "reports.raporBatch",
            json!({ "classId": seeded.class_id, "concurrency": concurrency }),
        );
        let got: Vec<&str> = batch["models"]
            .as_array()
            .expect("models")
            .iter()
            .filter_map(|m| m["student"]["name"].as_str())
            .collect();
        assert_eq!(got, expected, "concurrency {}", concurrency);
    }

    let subset = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.raporBatch",
        json!({
            "classId": seeded.class_id,
            "studentIds": [seeded.student_ids[0], seeded.student_ids[6]]
        }),
    );
    assert_eq!(subset["models"][0]["student"]["name"], json!("Gita"));
    assert_eq!(subset["models"][1]["student"]["name"], json!("Ani"));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "reports.raporBatch",
        json!({ "classId": seeded.class_id, "studentIds": ["nobody"] }),
    );
    assert_eq!(code, "not_found");

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn leger_ranks_ties_together() {
    let workspace = temp_dir("rapor-leger");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani", "Budi", "Citra", "Dewi"], 1);
    let subjects = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.list",
        json!({ "classId": seeded.class_id }),
    );
    let subject_id = str_field(&subjects["subjects"][0], "id");

    let sas = [Some(90), Some(80), Some(90), None];
    let edits: Vec<serde_json::Value> = seeded
        .student_ids
        .iter()
        .zip(sas)
        .filter_map(|(id, v)| v.map(|v| json!({ "studentId": id, "column": "SAS", "value": v })))
        .collect();
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.bulkUpdate",
        json!({ "classId": seeded.class_id, "subjectId": subject_id, "edits": edits }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "3b",
        "subjects.update",
        json!({ "classId": seeded.class_id, "subjectId": subject_id, "patch": { "shortName": "MP1" } }),
    );

    let leger = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.legerModel",
        json!({ "classId": seeded.class_id }),
    );
    let ranks: Vec<serde_json::Value> = leger["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|r| r["rank"].clone())
        .collect();
    assert_eq!(ranks, vec![json!(1), json!(3), json!(1), json!(null)]);
    assert_eq!(leger["rows"][0]["total"], json!(90));
    assert_eq!(leger["rows"][3]["average"], json!(null));
    assert_eq!(leger["subjects"][0]["shortName"], json!("MP1"));
    assert_eq!(leger["subjects"][0]["name"], json!("Mapel 01"));

    let _ = std::fs::remove_dir_all(&workspace);
}

#[test]
fn cover_and_biodata_models_format_identity() {
    let workspace = temp_dir("rapor-cover-biodata");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "school.update",
        json!({ "patch": { "name": "SD Negeri 3 Cimahi", "principalName": "Drs. Hasan" } }),
    );
    let seeded = seed_class(&mut stdin, &mut reader, &["Ani"], 0);
    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.update",
        json!({
            "classId": seeded.class_id,
            "studentId": seeded.student_ids[0],
            "patch": {
                "nisn": "0123456789",
                "birthPlace": "Cimahi",
                "birthDate": "2013-08-17",
                "admissionDate": "2019-07-15"
            }
        }),
    );

    let cover = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "reports.coverModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    assert_eq!(cover["school"]["name"], json!("SD Negeri 3 Cimahi"));
    assert_eq!(cover["studentName"], json!("Ani"));
    assert_eq!(cover["nisn"], json!("0123456789"));

    let bio = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.biodataModel",
        json!({ "classId": seeded.class_id, "studentId": seeded.student_ids[0] }),
    );
    assert_eq!(bio["student"]["birthLine"], json!("Cimahi, 17 Agustus 2013"));
    assert_eq!(bio["signature"]["date"], json!("15 Juli 2019"));
    assert_eq!(bio["signature"]["principal"]["name"], json!("Drs. Hasan"));

    let _ = std::fs::remove_dir_all(&workspace);
}
