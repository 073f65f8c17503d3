//! Course grade summaries: per-assessment marks and percentages for each
//! student, plus weighted totals per marking scheme for staff.

use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::rubric::round2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    Student { student_id: String },
    Staff,
}

impl Viewer {
    pub fn is_student(&self) -> bool {
        matches!(self, Viewer::Student { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentKind {
    Assignment,
    GradeEntryForm,
}

impl AssessmentKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assignment" => Some(AssessmentKind::Assignment),
            "grade_entry_form" => Some(AssessmentKind::GradeEntryForm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssessmentKind::Assignment => "assignment",
            AssessmentKind::GradeEntryForm => "grade_entry_form",
        }
    }
}

/// Max mark per assessment, computed once per request. Assignments sum their
/// non-bonus criteria; grade entry forms sum their non-bonus items.
#[derive(Debug, Clone, Default)]
pub struct MaxMarks {
    pub assignments: HashMap<String, f64>,
    pub grade_entry_forms: HashMap<String, f64>,
}

impl MaxMarks {
    pub fn get(&self, kind: AssessmentKind, assessment_id: &str) -> Option<f64> {
        match kind {
            AssessmentKind::Assignment => self.assignments.get(assessment_id).copied(),
            AssessmentKind::GradeEntryForm => self.grade_entry_forms.get(assessment_id).copied(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentRecord {
    pub id: String,
    pub id_number: Option<String>,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    pub hidden: bool,
}

/// A visible grade, in creation order; later records for the same
/// (student, assessment) replace earlier ones.
#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub student_id: String,
    pub assessment_id: String,
    pub kind: AssessmentKind,
    pub mark: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MarkingWeight {
    pub assessment_id: String,
    pub kind: AssessmentKind,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct MarkingScheme {
    pub id: String,
    pub name: String,
    pub weights: Vec<MarkingWeight>,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryInput {
    pub students: Vec<StudentRecord>,
    pub grades: Vec<GradeRecord>,
    pub schemes: Vec<MarkingScheme>,
    pub max_marks: MaxMarks,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssessmentMark {
    pub mark: Option<f64>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedMark {
    pub mark: f64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: String,
    pub id_number: Option<String>,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    pub hidden: bool,
    pub assessment_marks: BTreeMap<String, AssessmentMark>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted_marks: Option<BTreeMap<String, WeightedMark>>,
}

/// `round(mark * 100 / max_mark, 2)`; absent when either side is absent or
/// the max mark is zero.
pub fn percentage(mark: Option<f64>, max_mark: Option<f64>) -> Option<f64> {
    match (mark, max_mark) {
        (Some(m), Some(max)) if max != 0.0 => Some(round2(m * 100.0 / max)),
        _ => None,
    }
}

pub fn weighted_total(
    scheme: &MarkingScheme,
    marks: &BTreeMap<String, AssessmentMark>,
    max_marks: &MaxMarks,
) -> f64 {
    let mut total = 0.0;
    for w in &scheme.weights {
        let max_mark = max_marks.get(w.kind, &w.assessment_id);
        let mark = marks.get(&w.assessment_id).and_then(|m| m.mark);
        match (w.weight, mark, max_mark) {
            (Some(weight), Some(mark), Some(max)) if max != 0.0 => {
                total += mark * weight / max;
            }
            _ => {}
        }
    }
    round2(total)
}

pub fn course_summary(viewer: &Viewer, input: &SummaryInput) -> Vec<StudentSummary> {
    let mut rows: HashMap<&str, StudentSummary> = input
        .students
        .iter()
        .filter(|s| match viewer {
            Viewer::Student { student_id } => &s.id == student_id,
            Viewer::Staff => true,
        })
        .map(|s| {
            (
                s.id.as_str(),
                StudentSummary {
                    id: s.id.clone(),
                    id_number: s.id_number.clone(),
                    user_name: s.user_name.clone(),
                    first_name: s.first_name.clone(),
                    last_name: s.last_name.clone(),
                    hidden: s.hidden,
                    assessment_marks: BTreeMap::new(),
                    weighted_marks: None,
                },
            )
        })
        .collect();

    for g in &input.grades {
        let Some(row) = rows.get_mut(g.student_id.as_str()) else {
            continue;
        };
        let max_mark = input.max_marks.get(g.kind, &g.assessment_id);
        row.assessment_marks.insert(
            g.assessment_id.clone(),
            AssessmentMark {
                mark: g.mark,
                percentage: percentage(g.mark, max_mark),
            },
        );
    }

    if !viewer.is_student() {
        for row in rows.values_mut() {
            let weighted = input
                .schemes
                .iter()
                .map(|scheme| {
                    (
                        scheme.id.clone(),
                        WeightedMark {
                            mark: weighted_total(scheme, &row.assessment_marks, &input.max_marks),
                            name: scheme.name.clone(),
                        },
                    )
                })
                .collect();
            row.weighted_marks = Some(weighted);
        }
    }

    let mut out: Vec<StudentSummary> = rows.into_values().collect();
    out.sort_by(|a, b| a.user_name.cmp(&b.user_name));
    out
}

pub fn load_max_marks(conn: &Connection) -> anyhow::Result<MaxMarks> {
    let mut stmt = conn.prepare(
        "SELECT assessment_id, SUM(max_mark) FROM criteria
         WHERE bonus = 0 GROUP BY assessment_id",
    )?;
    let assignments = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT assessment_id, SUM(out_of) FROM grade_entry_items
         WHERE bonus = 0 GROUP BY assessment_id",
    )?;
    let grade_entry_forms = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(MaxMarks {
        assignments,
        grade_entry_forms,
    })
}

/// Loads everything `course_summary` needs. Only each grouping's current
/// (newest) result counts. Students see it only once it is released; staff
/// see it either way.
pub fn load_summary_input(conn: &Connection, viewer: &Viewer) -> anyhow::Result<SummaryInput> {
    let student_filter: Option<&str> = match viewer {
        Viewer::Student { student_id } => Some(student_id.as_str()),
        Viewer::Staff => None,
    };
    let released_only = viewer.is_student() as i64;

    let mut stmt = conn.prepare(
        "SELECT id, id_number, user_name, first_name, last_name, hidden
         FROM students WHERE (?1 IS NULL OR id = ?1) ORDER BY user_name",
    )?;
    let students = stmt
        .query_map([student_filter], |r| {
            Ok(StudentRecord {
                id: r.get(0)?,
                id_number: r.get(1)?,
                user_name: r.get(2)?,
                first_name: r.get(3)?,
                last_name: r.get(4)?,
                hidden: r.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grades = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT g.student_id, g.assessment_id,
                (SELECT SUM(m.mark) FROM marks m WHERE m.result_id = r.id)
         FROM results r
         JOIN groupings g ON g.id = r.grouping_id
         WHERE r.id = (SELECT cur.id FROM results cur
                       WHERE cur.grouping_id = r.grouping_id
                       ORDER BY cur.created_at DESC, cur.rowid DESC LIMIT 1)
           AND (?1 = 0 OR r.released_to_students = 1)
           AND (?2 IS NULL OR g.student_id = ?2)
         ORDER BY r.created_at, r.rowid",
    )?;
    let rows = stmt.query_map((released_only, student_filter), |r| {
        Ok(GradeRecord {
            student_id: r.get(0)?,
            assessment_id: r.get(1)?,
            kind: AssessmentKind::Assignment,
            mark: r.get(2)?,
        })
    })?;
    for row in rows {
        grades.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, assessment_id, total_grade
         FROM grade_entry_students
         WHERE (?1 = 0 OR released_to_student = 1)
           AND (?2 IS NULL OR student_id = ?2)
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map((released_only, student_filter), |r| {
        Ok(GradeRecord {
            student_id: r.get(0)?,
            assessment_id: r.get(1)?,
            kind: AssessmentKind::GradeEntryForm,
            mark: r.get(2)?,
        })
    })?;
    for row in rows {
        grades.push(row?);
    }

    let schemes = if viewer.is_student() {
        Vec::new()
    } else {
        load_schemes(conn)?
    };

    Ok(SummaryInput {
        students,
        grades,
        schemes,
        max_marks: load_max_marks(conn)?,
    })
}

fn load_schemes(conn: &Connection) -> anyhow::Result<Vec<MarkingScheme>> {
    let mut stmt = conn.prepare("SELECT id, name FROM marking_schemes ORDER BY rowid")?;
    let mut schemes = stmt
        .query_map([], |r| {
            Ok(MarkingScheme {
                id: r.get(0)?,
                name: r.get(1)?,
                weights: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT w.assessment_id, a.kind, w.weight
         FROM marking_weights w
         JOIN assessments a ON a.id = w.assessment_id
         WHERE w.marking_scheme_id = ?
         ORDER BY a.sort_order",
    )?;
    for scheme in &mut schemes {
        let rows = stmt.query_map([&scheme.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        })?;
        for row in rows {
            let (assessment_id, kind, weight) = row?;
            let Some(kind) = AssessmentKind::parse(&kind) else {
                tracing::warn!(assessment_id = %assessment_id, kind = %kind, "skipping weight for unknown assessment kind");
                continue;
            };
            scheme.weights.push(MarkingWeight {
                assessment_id,
                kind,
                weight,
            });
        }
    }
    Ok(schemes)
}
