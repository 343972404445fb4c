use crate::db;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every subject distributes this many bobot points across its categories.
pub const WEIGHT_BUDGET: f64 = 100.0;
const WEIGHT_EPSILON: f64 = 1e-9;

pub const SAS_KEY: &str = "SAS";

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Half-up rounding to an integer, as printed on the rapor.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

pub fn round_off_2_decimal(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightSlot {
    pub key: String,
    pub manual: Option<f64>,
}

impl WeightSlot {
    pub fn new(key: impl Into<String>, manual: Option<f64>) -> Self {
        Self {
            key: key.into(),
            manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightShare {
    pub key: String,
    pub weight: f64,
    pub manual: bool,
}

/// Split the 100-point bobot budget across `slots`.
///
/// Manual values are kept as given. Whatever remains of the budget is divided
/// evenly among slots without a manual value. When every slot is manual the
/// total may fall short of the budget; nothing is scaled.
pub fn distribute_weights(slots: &[WeightSlot]) -> Result<Vec<WeightShare>, CalcError> {
    let mut manual_total = 0.0_f64;
    let mut unset = 0_usize;
    for s in slots {
        match s.manual {
            Some(w) => {
                if !w.is_finite() || !(0.0..=WEIGHT_BUDGET).contains(&w) {
                    return Err(CalcError::new(
                        "bad_weight",
                        format!("bobot for {} must be within 0..=100", s.key),
                    )
                    .with_details(serde_json::json!({ "key": s.key, "weight": w })));
                }
                manual_total += w;
            }
            None => unset += 1,
        }
    }

    if manual_total > WEIGHT_BUDGET + WEIGHT_EPSILON {
        return Err(CalcError::new(
            "weight_budget_exceeded",
            format!("manual bobot total {} exceeds {}", manual_total, WEIGHT_BUDGET),
        )
        .with_details(serde_json::json!({ "manualTotal": manual_total })));
    }

    let share = if unset > 0 {
        (WEIGHT_BUDGET - manual_total).max(0.0) / (unset as f64)
    } else {
        0.0
    };

    Ok(slots
        .iter()
        .map(|s| WeightShare {
            key: s.key.clone(),
            weight: s.manual.unwrap_or(share),
            manual: s.manual.is_some(),
        })
        .collect())
}

/// Σ(score·weight) / Σweight over present scores with positive weight.
pub fn weighted_average<I>(pairs: I) -> Option<f64>
where
    I: IntoIterator<Item = (Option<f64>, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (score, weight) in pairs {
        let Some(score) = score else {
            continue;
        };
        if weight <= 0.0 {
            continue;
        }
        sum += score * weight;
        denom += weight;
    }
    if denom > 0.0 {
        Some(sum / denom)
    } else {
        None
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectWeights {
    pub objectives: Vec<WeightShare>,
    pub sas: WeightShare,
}

impl SubjectWeights {
    pub fn total(&self) -> f64 {
        self.objectives.iter().map(|w| w.weight).sum::<f64>() + self.sas.weight
    }
}

/// Objectives first, then the SAS slot, all drawing from one budget.
pub fn subject_weights(
    objectives: &[(String, Option<f64>)],
    sas_manual: Option<f64>,
) -> Result<SubjectWeights, CalcError> {
    let mut slots: Vec<WeightSlot> = objectives
        .iter()
        .map(|(key, manual)| WeightSlot::new(key.clone(), *manual))
        .collect();
    slots.push(WeightSlot::new(SAS_KEY, sas_manual));

    let mut shares = distribute_weights(&slots)?;
    let sas = shares.pop().ok_or_else(|| {
        CalcError::new("server_error", "weight distribution lost the SAS slot")
    })?;
    Ok(SubjectWeights {
        objectives: shares,
        sas,
    })
}

/// Proposed change to one weight slot of a subject.
#[derive(Debug, Clone, Copy)]
pub enum WeightChange<'a> {
    Objective { id: &'a str, manual: Option<f64> },
    Sas(Option<f64>),
}

/// Re-run the distribution with `change` applied, so an edit that would
/// overflow the budget is refused before it is written.
pub fn check_subject_budget(
    conn: &Connection,
    subject_id: &str,
    change: WeightChange<'_>,
) -> Result<SubjectWeights, CalcError> {
    let sas_stored: Option<f64> = conn
        .query_row(
            "SELECT sas_weight FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?
        .ok_or_else(|| CalcError::new("not_found", "subject not found"))?;

    let mut stmt = conn
        .prepare("SELECT id, weight FROM objectives WHERE subject_id = ? ORDER BY sort_order")
        .map_err(CalcError::db)?;
    let mut objectives: Vec<(String, Option<f64>)> = stmt
        .query_map([subject_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let mut sas = sas_stored;
    match change {
        WeightChange::Objective { id, manual } => {
            match objectives.iter_mut().find(|(oid, _)| oid == id) {
                Some(slot) => slot.1 = manual,
                None => objectives.push((id.to_string(), manual)),
            }
        }
        WeightChange::Sas(manual) => sas = manual,
    }
    subject_weights(&objectives, sas)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalScore {
    pub na: Option<f64>,
    pub na_rounded: Option<i64>,
    pub objective_avg: Option<f64>,
    pub sas: Option<f64>,
    pub scored_count: usize,
    pub missing_count: usize,
}

/// NA for one student in one subject. `objective_scores` is aligned with
/// `weights.objectives`.
pub fn compute_final(
    objective_scores: &[Option<f64>],
    sas: Option<f64>,
    weights: &SubjectWeights,
) -> FinalScore {
    let pairs = objective_scores
        .iter()
        .copied()
        .zip(weights.objectives.iter().map(|w| w.weight))
        .chain(std::iter::once((sas, weights.sas.weight)));
    let na = weighted_average(pairs);

    let present: Vec<f64> = objective_scores.iter().flatten().copied().collect();
    let objective_avg = if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    };

    let scored_count = present.len() + usize::from(sas.is_some());
    let missing_count = objective_scores.len() + 1 - scored_count;

    FinalScore {
        na: na.map(round_off_2_decimal),
        na_rounded: na.map(round_half_up),
        objective_avg: objective_avg.map(round_off_2_decimal),
        sas,
        scored_count,
        missing_count,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    pub mastered: Option<String>,
    pub needs_help: Option<String>,
    pub text: String,
}

fn lowercase_first(s: &str) -> String {
    let t = s.trim().trim_end_matches('.');
    let mut chars = t.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn join_objectives(items: &[&str]) -> String {
    items
        .iter()
        .map(|d| lowercase_first(d))
        .filter(|d| !d.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Competency text printed beside NA, built from per-objective scores.
pub fn describe_achievement(objectives: &[(&str, Option<f64>)], kktp: f64) -> Description {
    let scored: Vec<(&str, f64)> = objectives
        .iter()
        .filter_map(|(d, s)| s.map(|v| (*d, v)))
        .collect();
    if scored.is_empty() {
        return Description::default();
    }

    let max = scored.iter().map(|(_, v)| *v).fold(f64::MIN, f64::max);
    let min = scored.iter().map(|(_, v)| *v).fold(f64::MAX, f64::min);

    let mastered = if max >= kktp {
        let best: Vec<&str> = scored
            .iter()
            .filter(|(_, v)| *v == max)
            .map(|(d, _)| *d)
            .collect();
        Some(format!(
            "Menunjukkan penguasaan yang baik dalam {}.",
            join_objectives(&best)
        ))
    } else {
        None
    };

    let needs_help = if min < kktp || min < max {
        let worst: Vec<&str> = scored
            .iter()
            .filter(|(_, v)| *v == min)
            .map(|(d, _)| *d)
            .collect();
        Some(format!("Perlu bantuan dalam {}.", join_objectives(&worst)))
    } else {
        None
    };

    let text = [mastered.as_deref(), needs_help.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    Description {
        mastered,
        needs_help,
        text,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GradingSettings {
    pub default_kktp: f64,
    pub band_a: f64,
    pub band_b: f64,
    pub band_c: f64,
}

impl Default for GradingSettings {
    fn default() -> Self {
        Self {
            default_kktp: 75.0,
            band_a: 90.0,
            band_b: 80.0,
            band_c: 70.0,
        }
    }
}

pub const GRADING_SETTINGS_KEY: &str = "setup.grading";

impl GradingSettings {
    pub fn load(conn: &Connection) -> Result<Self, CalcError> {
        let raw = db::settings_get_json(conn, GRADING_SETTINGS_KEY)
            .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        Ok(raw
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default())
    }

    pub fn predicate(&self, score: f64) -> &'static str {
        if score >= self.band_a {
            "A"
        } else if score >= self.band_b {
            "B"
        } else if score >= self.band_c {
            "C"
        } else {
            "D"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveDef {
    pub id: String,
    pub code: String,
    pub description: String,
    pub weight: Option<f64>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectDef {
    pub id: String,
    pub name: String,
    pub short_name: Option<String>,
    pub group: String,
    pub kktp: f64,
    pub sas_weight: Option<f64>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub name: String,
    pub nis: Option<String>,
    pub nisn: Option<String>,
    pub sort_order: i64,
    pub active: bool,
}

/// Subject definition, its objectives and every score recorded against them.
#[derive(Debug, Clone)]
pub struct SubjectSheet {
    pub subject: SubjectDef,
    pub objectives: Vec<ObjectiveDef>,
    pub weights: SubjectWeights,
    objective_scores: HashMap<(String, String), f64>,
    sas_scores: HashMap<String, f64>,
}

impl SubjectSheet {
    pub fn objective_score(&self, objective_id: &str, student_id: &str) -> Option<f64> {
        self.objective_scores
            .get(&(objective_id.to_string(), student_id.to_string()))
            .copied()
    }

    pub fn sas_score(&self, student_id: &str) -> Option<f64> {
        self.sas_scores.get(student_id).copied()
    }

    pub fn final_for(&self, student_id: &str) -> FinalScore {
        let scores: Vec<Option<f64>> = self
            .objectives
            .iter()
            .map(|o| self.objective_score(&o.id, student_id))
            .collect();
        compute_final(&scores, self.sas_score(student_id), &self.weights)
    }

    pub fn description_for(&self, student_id: &str) -> Description {
        let items: Vec<(&str, Option<f64>)> = self
            .objectives
            .iter()
            .map(|o| {
                (
                    o.description.as_str(),
                    self.objective_score(&o.id, student_id),
                )
            })
            .collect();
        describe_achievement(&items, self.subject.kktp)
    }
}

pub fn load_students(conn: &Connection, class_id: &str) -> Result<Vec<StudentRef>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, nis, nisn, sort_order, active
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(CalcError::db)?;
    let students = stmt
        .query_map([class_id], |r| {
            Ok(StudentRef {
                id: r.get(0)?,
                name: r.get(1)?,
                nis: r.get(2)?,
                nisn: r.get(3)?,
                sort_order: r.get(4)?,
                active: r.get::<_, i64>(5)? != 0,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(students)
}

pub fn load_subject_ids(conn: &Connection, class_id: &str) -> Result<Vec<String>, CalcError> {
    let mut stmt = conn
        .prepare("SELECT id FROM subjects WHERE class_id = ? ORDER BY sort_order")
        .map_err(CalcError::db)?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;
    Ok(ids)
}

pub fn load_subject_sheet(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
    grading: &GradingSettings,
) -> Result<SubjectSheet, CalcError> {
    let subject: Option<SubjectDef> = conn
        .query_row(
            "SELECT id, name, short_name, subject_group, kktp, sas_weight, sort_order
             FROM subjects
             WHERE id = ? AND class_id = ?",
            (subject_id, class_id),
            |r| {
                Ok(SubjectDef {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    short_name: r.get(2)?,
                    group: r.get(3)?,
                    kktp: r
                        .get::<_, Option<f64>>(4)?
                        .unwrap_or(grading.default_kktp),
                    sas_weight: r.get(5)?,
                    sort_order: r.get(6)?,
                })
            },
        )
        .optional()
        .map_err(CalcError::db)?;
    let Some(subject) = subject else {
        return Err(CalcError::new("not_found", "subject not found"));
    };

    let mut obj_stmt = conn
        .prepare(
            "SELECT id, code, description, weight, sort_order
             FROM objectives
             WHERE subject_id = ?
             ORDER BY sort_order",
        )
        .map_err(CalcError::db)?;
    let objectives: Vec<ObjectiveDef> = obj_stmt
        .query_map([subject_id], |r| {
            Ok(ObjectiveDef {
                id: r.get(0)?,
                code: r.get(1)?,
                description: r.get(2)?,
                weight: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CalcError::db)?;

    let weights = subject_weights(
        &objectives
            .iter()
            .map(|o| (o.id.clone(), o.weight))
            .collect::<Vec<_>>(),
        subject.sas_weight,
    )
    .map_err(|e| {
        let details = serde_json::json!({
            "subjectId": subject.id,
            "subjectName": subject.name,
            "cause": e.details.clone(),
        });
        e.with_details(details)
    })?;

    let mut objective_scores: HashMap<(String, String), f64> = HashMap::new();
    if !objectives.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(objectives.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT objective_id, student_id, score
             FROM objective_scores
             WHERE objective_id IN ({})",
            placeholders
        );
        let bind: Vec<Value> = objectives
            .iter()
            .map(|o| Value::Text(o.id.clone()))
            .collect();
        let mut stmt = conn.prepare(&sql).map_err(CalcError::db)?;
        let rows = stmt
            .query_map(params_from_iter(bind), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })
            .map_err(CalcError::db)?;
        for row in rows {
            let (objective_id, student_id, score) = row.map_err(CalcError::db)?;
            objective_scores.insert((objective_id, student_id), score);
        }
    }

    let mut sas_scores: HashMap<String, f64> = HashMap::new();
    let mut sas_stmt = conn
        .prepare("SELECT student_id, score FROM sas_scores WHERE subject_id = ?")
        .map_err(CalcError::db)?;
    let rows = sas_stmt
        .query_map([subject_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })
        .map_err(CalcError::db)?;
    for row in rows {
        let (student_id, score) = row.map_err(CalcError::db)?;
        sas_scores.insert(student_id, score);
    }

    Ok(SubjectSheet {
        subject,
        objectives,
        weights,
        objective_scores,
        sas_scores,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSubjectFinal {
    pub student_id: String,
    pub name: String,
    pub active: bool,
    #[serde(flatten)]
    pub score: FinalScore,
    pub predicate: Option<&'static str>,
    pub description: Description,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectFinalsModel {
    pub subject: SubjectDef,
    pub objectives: Vec<ObjectiveDef>,
    pub weights: SubjectWeights,
    pub students: Vec<StudentSubjectFinal>,
}

pub fn compute_subject_finals(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> Result<SubjectFinalsModel, CalcError> {
    let grading = GradingSettings::load(conn)?;
    let sheet = load_subject_sheet(conn, class_id, subject_id, &grading)?;
    let students = load_students(conn, class_id)?;

    let rows = students
        .iter()
        .map(|s| {
            let score = sheet.final_for(&s.id);
            StudentSubjectFinal {
                student_id: s.id.clone(),
                name: s.name.clone(),
                active: s.active,
                predicate: score.na_rounded.map(|n| grading.predicate(n as f64)),
                description: sheet.description_for(&s.id),
                score,
            }
        })
        .collect();

    Ok(SubjectFinalsModel {
        subject: sheet.subject,
        objectives: sheet.objectives,
        weights: sheet.weights,
        students: rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub group: String,
    pub kktp: f64,
    #[serde(flatten)]
    pub score: FinalScore,
    pub predicate: Option<&'static str>,
    pub description: Description,
}

/// All subject results for one student, in subject sort order.
pub fn compute_student_finals(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
) -> Result<Vec<SubjectResult>, CalcError> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND class_id = ?",
            (student_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(CalcError::db)?;
    if exists.is_none() {
        return Err(CalcError::new("not_found", "student not found"));
    }

    let grading = GradingSettings::load(conn)?;
    let mut out = Vec::new();
    for subject_id in load_subject_ids(conn, class_id)? {
        let sheet = load_subject_sheet(conn, class_id, &subject_id, &grading)?;
        let score = sheet.final_for(student_id);
        out.push(SubjectResult {
            subject_id: sheet.subject.id.clone(),
            subject_name: sheet.subject.name.clone(),
            group: sheet.subject.group.clone(),
            kktp: sheet.subject.kktp,
            predicate: score.na_rounded.map(|n| grading.predicate(n as f64)),
            description: sheet.description_for(student_id),
            score,
        });
    }
    Ok(out)
}
