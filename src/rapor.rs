//! Print models for the cover, biodata and rapor documents, plus the class leger.

use crate::calc::{self, CalcError, GradingSettings, SubjectSheet};
use crate::db;
use crate::layout::{self, Cell, LayoutConfig, RowSpec};
use chrono::{Datelike, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info};

pub const PRINT_SETTINGS_KEY: &str = "setup.print";

const MONTHS_ID: [&str; 12] = [
    "Januari",
    "Februari",
    "Maret",
    "April",
    "Mei",
    "Juni",
    "Juli",
    "Agustus",
    "September",
    "Oktober",
    "November",
    "Desember",
];

const GROUP_ORDER: [(&str, &str); 3] = [
    ("wajib", "Mata Pelajaran Wajib"),
    ("pilihan", "Mata Pelajaran Pilihan"),
    ("mulok", "Muatan Lokal"),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrintSettings {
    #[serde(flatten)]
    pub layout: LayoutConfig,
    /// Characters per line in the subject name column.
    pub subject_chars: usize,
    /// Characters per line in the achievement description column.
    pub description_chars: usize,
}

impl Default for PrintSettings {
    fn default() -> Self {
        Self {
            layout: LayoutConfig::default(),
            subject_chars: 24,
            description_chars: 72,
        }
    }
}

impl PrintSettings {
    pub fn load(conn: &Connection) -> Result<Self, CalcError> {
        let raw = db::settings_get_json(conn, PRINT_SETTINGS_KEY)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }
}

/// `2012-03-04` -> `4 Maret 2012`. Unparseable input is returned unchanged.
pub fn format_long_date(iso: &str) -> String {
    match NaiveDate::parse_from_str(iso.trim(), "%Y-%m-%d") {
        Ok(d) => format!(
            "{} {} {}",
            d.day(),
            MONTHS_ID[d.month0() as usize],
            d.year()
        ),
        Err(_) => iso.to_string(),
    }
}

pub fn gender_label(code: Option<&str>) -> &'static str {
    match code.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
        Some("L") => "Laki-laki",
        Some("P") => "Perempuan",
        _ => "",
    }
}

pub fn semester_label(semester: i64) -> &'static str {
    if semester == 2 {
        "2 (Genap)"
    } else {
        "1 (Ganjil)"
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolInfo {
    pub name: String,
    pub npsn: Option<String>,
    pub nss: Option<String>,
    pub address: Option<String>,
    pub village: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub principal_name: Option<String>,
    pub principal_nip: Option<String>,
}

pub fn load_school(conn: &Connection) -> Result<SchoolInfo, CalcError> {
    let school = conn
        .query_row(
            "SELECT name, npsn, nss, address, village, district, city, province, postal_code,
                    phone, email, website, principal_name, principal_nip
             FROM schools
             WHERE id = 'default'",
            [],
            |r| {
                Ok(SchoolInfo {
                    name: r.get(0)?,
                    npsn: r.get(1)?,
                    nss: r.get(2)?,
                    address: r.get(3)?,
                    village: r.get(4)?,
                    district: r.get(5)?,
                    city: r.get(6)?,
                    province: r.get(7)?,
                    postal_code: r.get(8)?,
                    phone: r.get(9)?,
                    email: r.get(10)?,
                    website: r.get(11)?,
                    principal_name: r.get(12)?,
                    principal_nip: r.get(13)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    Ok(school.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub phase: Option<String>,
    pub grade_level: Option<i64>,
    pub semester: i64,
    pub semester_label: &'static str,
    pub academic_year: String,
    pub homeroom_name: Option<String>,
    pub homeroom_nip: Option<String>,
    pub report_place: Option<String>,
    pub report_date: Option<String>,
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassInfo, CalcError> {
    let class = conn
        .query_row(
            "SELECT id, name, phase, grade_level, semester, COALESCE(academic_year, ''),
                    homeroom_name, homeroom_nip, report_place, report_date
             FROM classes
             WHERE id = ?",
            [class_id],
            |r| {
                let semester: i64 = r.get(4)?;
                Ok(ClassInfo {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    phase: r.get(2)?,
                    grade_level: r.get(3)?,
                    semester,
                    semester_label: semester_label(semester),
                    academic_year: r.get(5)?,
                    homeroom_name: r.get(6)?,
                    homeroom_nip: r.get(7)?,
                    report_place: r.get(8)?,
                    report_date: r.get(9)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    class.ok_or_else(|| CalcError::new("not_found", "class not found"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBio {
    pub id: String,
    pub nis: Option<String>,
    pub nisn: Option<String>,
    pub name: String,
    pub gender: Option<String>,
    pub gender_label: &'static str,
    pub birth_place: Option<String>,
    pub birth_date: Option<String>,
    /// Tempat, tanggal lahir as printed.
    pub birth_line: String,
    pub religion: Option<String>,
    pub address: Option<String>,
    pub father_name: Option<String>,
    pub father_job: Option<String>,
    pub mother_name: Option<String>,
    pub mother_job: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_job: Option<String>,
    pub guardian_address: Option<String>,
    pub parent_address: Option<String>,
    pub admission_date: Option<String>,
    pub admission_date_long: String,
    pub admitted_class: Option<String>,
    pub previous_school: Option<String>,
    pub active: bool,
    pub sort_order: i64,
}

pub fn load_student_bio(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<StudentBio, CalcError> {
    let bio = conn
        .query_row(
            "SELECT id, nis, nisn, name, gender, birth_place, birth_date, religion, address,
                    father_name, father_job, mother_name, mother_job,
                    guardian_name, guardian_job, guardian_address, parent_address,
                    admission_date, admitted_class, previous_school, active, sort_order
             FROM students
             WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| {
                let gender: Option<String> = r.get(4)?;
                let birth_place: Option<String> = r.get(5)?;
                let birth_date: Option<String> = r.get(6)?;
                let admission_date: Option<String> = r.get(17)?;
                let birth_line = [
                    birth_place.clone().unwrap_or_default(),
                    birth_date
                        .as_deref()
                        .map(format_long_date)
                        .unwrap_or_default(),
                ]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
                Ok(StudentBio {
                    id: r.get(0)?,
                    nis: r.get(1)?,
                    nisn: r.get(2)?,
                    name: r.get(3)?,
                    gender_label: gender_label(gender.as_deref()),
                    gender,
                    birth_place,
                    birth_line,
                    birth_date,
                    religion: r.get(7)?,
                    address: r.get(8)?,
                    father_name: r.get(9)?,
                    father_job: r.get(10)?,
                    mother_name: r.get(11)?,
                    mother_job: r.get(12)?,
                    guardian_name: r.get(13)?,
                    guardian_job: r.get(14)?,
                    guardian_address: r.get(15)?,
                    parent_address: r.get(16)?,
                    admission_date_long: admission_date
                        .as_deref()
                        .map(format_long_date)
                        .unwrap_or_default(),
                    admission_date,
                    admitted_class: r.get(18)?,
                    previous_school: r.get(19)?,
                    active: r.get::<_, i64>(20)? != 0,
                    sort_order: r.get(21)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    bio.ok_or_else(|| CalcError::new("not_found", "student not found"))
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentExtras {
    pub sick: i64,
    pub permitted: i64,
    pub absent: i64,
    pub homeroom_note: String,
    pub promotion: Option<String>,
}

pub fn load_extras(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<StudentExtras, CalcError> {
    let extras = conn
        .query_row(
            "SELECT sick, permitted, absent, homeroom_note, promotion
             FROM student_extras
             WHERE class_id = ? AND student_id = ?",
            (class_id, student_id),
            |r| {
                Ok(StudentExtras {
                    sick: r.get(0)?,
                    permitted: r.get(1)?,
                    absent: r.get(2)?,
                    homeroom_note: r.get(3)?,
                    promotion: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    Ok(extras.unwrap_or_default())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    pub name: Option<String>,
    pub nip: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
    pub place: String,
    pub date: String,
    pub homeroom: Signer,
    pub principal: Signer,
}

fn signature_block(school: &SchoolInfo, class: &ClassInfo) -> SignatureBlock {
    SignatureBlock {
        place: class
            .report_place
            .clone()
            .or_else(|| school.city.clone())
            .unwrap_or_default(),
        date: class
            .report_date
            .as_deref()
            .map(format_long_date)
            .unwrap_or_default(),
        homeroom: Signer {
            name: class.homeroom_name.clone(),
            nip: class.homeroom_nip.clone(),
        },
        principal: Signer {
            name: school.principal_name.clone(),
            nip: school.principal_nip.clone(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverModel {
    pub school: SchoolInfo,
    pub class: ClassInfo,
    pub student_name: String,
    pub nis: Option<String>,
    pub nisn: Option<String>,
}

pub fn build_cover(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<CoverModel, CalcError> {
    let class = load_class(conn, class_id)?;
    let bio = load_student_bio(conn, class_id, student_id)?;
    Ok(CoverModel {
        school: load_school(conn)?,
        class,
        student_name: bio.name,
        nis: bio.nis,
        nisn: bio.nisn,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BiodataModel {
    pub school: SchoolInfo,
    pub class: ClassInfo,
    pub student: StudentBio,
    pub signature: SignatureBlock,
}

pub fn build_biodata(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<BiodataModel, CalcError> {
    let school = load_school(conn)?;
    let class = load_class(conn, class_id)?;
    let student = load_student_bio(conn, class_id, student_id)?;
    let mut signature = signature_block(&school, &class);
    // Biodata is signed on the admission date when known.
    if !student.admission_date_long.is_empty() {
        signature.date = student.admission_date_long.clone();
    }
    Ok(BiodataModel {
        school,
        class,
        student,
        signature,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RaporRow {
    #[serde(rename_all = "camelCase")]
    Group { label: String },
    #[serde(rename_all = "camelCase")]
    Subject {
        no: usize,
        subject_id: String,
        subject_name: String,
        na: Option<i64>,
        predicate: Option<&'static str>,
        description: String,
    },
}

impl RaporRow {
    fn row_spec(&self, print: &PrintSettings) -> RowSpec {
        match self {
            RaporRow::Group { label } => RowSpec {
                cells: vec![Cell::new(label.clone(), print.subject_chars + print.description_chars)],
                keep_with_next: true,
            },
            RaporRow::Subject {
                subject_name,
                description,
                ..
            } => RowSpec {
                cells: vec![
                    Cell::new(subject_name.clone(), print.subject_chars),
                    Cell::new(description.clone(), print.description_chars),
                ],
                keep_with_next: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRow {
    pub top: f64,
    pub height: f64,
    pub oversized: bool,
    pub row: RaporRow,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaporPage {
    pub index: usize,
    pub first: bool,
    pub rows: Vec<PageRow>,
    pub has_footer: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaporFooter {
    pub attendance: StudentExtras,
    pub show_promotion: bool,
    pub signature: SignatureBlock,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaporModel {
    pub school: SchoolInfo,
    pub class: ClassInfo,
    pub student: StudentBio,
    pub page_count: usize,
    pub pages: Vec<RaporPage>,
    pub footer: RaporFooter,
}

/// Everything about a class that every student's rapor shares.
#[derive(Debug, Clone)]
pub struct ClassSheets {
    pub school: SchoolInfo,
    pub class: ClassInfo,
    pub print: PrintSettings,
    pub grading: GradingSettings,
    pub sheets: Vec<SubjectSheet>,
}

impl ClassSheets {
    pub fn load(conn: &Connection, class_id: &str) -> Result<Self, CalcError> {
        let class = load_class(conn, class_id)?;
        let grading = GradingSettings::load(conn)?;
        let mut sheets = Vec::new();
        for subject_id in calc::load_subject_ids(conn, class_id)? {
            sheets.push(calc::load_subject_sheet(conn, class_id, &subject_id, &grading)?);
        }
        Ok(Self {
            school: load_school(conn)?,
            class,
            print: PrintSettings::load(conn)?,
            grading,
            sheets,
        })
    }

    fn rows_for(&self, student_id: &str) -> Vec<RaporRow> {
        let present: Vec<&str> = GROUP_ORDER
            .iter()
            .map(|(g, _)| *g)
            .filter(|g| self.sheets.iter().any(|s| s.subject.group == *g))
            .collect();
        let with_headings = present.len() > 1;

        let mut rows = Vec::new();
        for (group, label) in GROUP_ORDER {
            let members: Vec<&SubjectSheet> = self
                .sheets
                .iter()
                .filter(|s| s.subject.group == group)
                .collect();
            if members.is_empty() {
                continue;
            }
            if with_headings {
                rows.push(RaporRow::Group {
                    label: label.to_string(),
                });
            }
            for (i, sheet) in members.into_iter().enumerate() {
                let score = sheet.final_for(student_id);
                rows.push(RaporRow::Subject {
                    no: i + 1,
                    subject_id: sheet.subject.id.clone(),
                    subject_name: sheet.subject.name.clone(),
                    na: score.na_rounded,
                    predicate: score.na_rounded.map(|n| self.grading.predicate(n as f64)),
                    description: sheet.description_for(student_id).text,
                });
            }
        }
        rows
    }

    fn footer_layout(&self, extras: &StudentExtras) -> LayoutConfig {
        let mut cfg = self.print.layout;
        if cfg.footer_height > 0.0 && !extras.homeroom_note.trim().is_empty() {
            let note_lines = layout::estimate_lines(
                &extras.homeroom_note,
                self.print.subject_chars + self.print.description_chars,
            );
            cfg.footer_height += (note_lines.saturating_sub(1) as f64) * cfg.line_height;
        }
        cfg
    }

    pub fn build_rapor(&self, conn: &Connection, student_id: &str) -> Result<RaporModel, CalcError> {
        let student = load_student_bio(conn, &self.class.id, student_id)?;
        let extras = load_extras(conn, &self.class.id, student_id)?;

        let rows = self.rows_for(student_id);
        let specs: Vec<RowSpec> = rows.iter().map(|r| r.row_spec(&self.print)).collect();
        let cfg = self.footer_layout(&extras);
        let (_, pagination) = layout::paginate_rows(&specs, &cfg);

        let pages: Vec<RaporPage> = pagination
            .pages
            .iter()
            .map(|p| RaporPage {
                index: p.index,
                first: p.first,
                has_footer: p.has_footer,
                rows: p
                    .rows
                    .iter()
                    .filter_map(|placed| {
                        rows.get(placed.index).map(|row| PageRow {
                            top: placed.top,
                            height: placed.height,
                            oversized: placed.oversized,
                            row: row.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();

        debug!(
            student_id,
            rows = rows.len(),
            pages = pages.len(),
            "rapor paginated"
        );

        Ok(RaporModel {
            school: self.school.clone(),
            class: self.class.clone(),
            student,
            page_count: pages.len(),
            pages,
            footer: RaporFooter {
                attendance: extras,
                show_promotion: self.class.semester == 2,
                signature: signature_block(&self.school, &self.class),
                height: cfg.footer_height,
            },
        })
    }
}

pub fn build_rapor(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<RaporModel, CalcError> {
    ClassSheets::load(conn, class_id)?.build_rapor(conn, student_id)
}

/// Build rapor models for `student_ids` with at most `concurrency` in flight.
///
/// Each worker owns a read-only connection and pulls the next index from a
/// shared counter; results are returned in input order.
pub fn build_rapor_batch(
    db_file: &Path,
    sheets: &ClassSheets,
    student_ids: &[String],
    concurrency: usize,
) -> Result<Vec<RaporModel>, CalcError> {
    let started = Instant::now();
    let workers = concurrency.clamp(1, student_ids.len().max(1));

    let mut conns = Vec::with_capacity(workers);
    for _ in 0..workers {
        conns.push(
            db::open_db_readonly(db_file)
                .map_err(|e| CalcError::new("db_open_failed", e.to_string()))?,
        );
    }

    let next = AtomicUsize::new(0);
    let parts: Vec<Vec<(usize, Result<RaporModel, CalcError>)>> = std::thread::scope(|scope| {
        let handles: Vec<_> = conns
            .into_iter()
            .map(|conn| {
                let next = &next;
                scope.spawn(move || {
                    let mut out = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(student_id) = student_ids.get(i) else {
                            break;
                        };
                        out.push((i, sheets.build_rapor(&conn, student_id)));
                    }
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let mut slots: Vec<Option<Result<RaporModel, CalcError>>> =
        (0..student_ids.len()).map(|_| None).collect();
    for (i, r) in parts.into_iter().flatten() {
        if let Some(slot) = slots.get_mut(i) {
            *slot = Some(r);
        }
    }

    let mut models = Vec::with_capacity(slots.len());
    for (i, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(Ok(m)) => models.push(m),
            Some(Err(e)) => return Err(e),
            None => {
                return Err(CalcError::new("batch_worker_failed", "rapor worker stopped early")
                    .with_details(serde_json::json!({ "studentId": student_ids[i] })))
            }
        }
    }

    info!(
        class_id = %sheets.class.id,
        students = models.len(),
        workers,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rapor batch built"
    );
    Ok(models)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegerSubject {
    pub id: String,
    pub name: String,
    pub short_name: String,
    pub group: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegerRow {
    pub student_id: String,
    pub name: String,
    pub nis: Option<String>,
    pub active: bool,
    pub scores: Vec<Option<i64>>,
    pub total: i64,
    pub average: Option<f64>,
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegerModel {
    pub class: ClassInfo,
    pub subjects: Vec<LegerSubject>,
    pub rows: Vec<LegerRow>,
}

/// Competition ranking on total, descending: equal totals share a rank and
/// the next rank skips accordingly. Rows with `None` are left unranked.
pub fn competition_ranks(totals: &[Option<i64>]) -> Vec<Option<usize>> {
    totals
        .iter()
        .map(|t| {
            t.map(|mine| {
                1 + totals
                    .iter()
                    .flatten()
                    .filter(|other| **other > mine)
                    .count()
            })
        })
        .collect()
}

pub fn build_leger(conn: &Connection, class_id: &str) -> Result<LegerModel, CalcError> {
    let sheets = ClassSheets::load(conn, class_id)?;
    let students = calc::load_students(conn, class_id)?;

    let subjects: Vec<LegerSubject> = sheets
        .sheets
        .iter()
        .map(|s| LegerSubject {
            id: s.subject.id.clone(),
            name: s.subject.name.clone(),
            short_name: s
                .subject
                .short_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| s.subject.name.clone()),
            group: s.subject.group.clone(),
        })
        .collect();

    let mut rows: Vec<LegerRow> = students
        .iter()
        .map(|st| {
            let scores: Vec<Option<i64>> = sheets
                .sheets
                .iter()
                .map(|s| s.final_for(&st.id).na_rounded)
                .collect();
            let present: Vec<i64> = scores.iter().flatten().copied().collect();
            let total: i64 = present.iter().sum();
            LegerRow {
                student_id: st.id.clone(),
                name: st.name.clone(),
                nis: st.nis.clone(),
                active: st.active,
                average: if present.is_empty() {
                    None
                } else {
                    Some(calc::round_off_2_decimal(total as f64 / present.len() as f64))
                },
                total,
                scores,
                rank: None,
            }
        })
        .collect();

    let rankable: Vec<Option<i64>> = rows
        .iter()
        .map(|r| (r.active && r.average.is_some()).then_some(r.total))
        .collect();
    for (row, rank) in rows.iter_mut().zip(competition_ranks(&rankable)) {
        row.rank = rank;
    }

    Ok(LegerModel {
        class: sheets.class,
        subjects,
        rows,
    })
}
