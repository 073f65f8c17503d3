use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::roster::student_exists;
use crate::ipc::params::{opt_bool, opt_f64, req_f64, req_non_empty, req_str};
use crate::ipc::types::{AppState, Request};
use crate::summaries::AssessmentKind;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn assessment_kind(
    conn: &Connection,
    assessment_id: &str,
) -> Result<AssessmentKind, HandlerErr> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM assessments WHERE id = ?",
            [assessment_id],
            |r| r.get(0),
        )
        .optional()?;
    kind.as_deref()
        .and_then(AssessmentKind::parse)
        .ok_or_else(|| {
            HandlerErr::not_found("assessment not found")
                .with_details(json!({ "assessmentId": assessment_id }))
        })
}

fn handle_assessments_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let kind_raw = req_str(req, "kind")?;
    let Some(kind) = AssessmentKind::parse(&kind_raw) else {
        return Err(HandlerErr::bad_params("kind must be one of: assignment, grade_entry_form")
            .with_details(json!({ "kind": kind_raw })));
    };
    let short_identifier = req_non_empty(req, "shortIdentifier")?;
    let description = req_str(req, "description").unwrap_or_default();

    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM assessments",
        [],
        |r| r.get(0),
    )?;
    let assessment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessments(id, kind, short_identifier, description, sort_order)
         VALUES(?, ?, ?, ?, ?)",
        (&assessment_id, kind.as_str(), &short_identifier, &description, sort_order),
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => HandlerErr::new("conflict", "short identifier already taken"),
        _ => HandlerErr::new("db_insert_failed", e.to_string()),
    })?;

    Ok(json!({ "assessmentId": assessment_id }))
}

fn handle_assessments_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, kind, short_identifier, description, sort_order
         FROM assessments ORDER BY sort_order",
    )?;
    let assessments = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let short_identifier: String = row.get(2)?;
            let description: String = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "kind": kind,
                "shortIdentifier": short_identifier,
                "description": description,
                "sortOrder": sort_order
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "assessments": assessments }))
}

fn require_grade_entry_form(conn: &Connection, assessment_id: &str) -> Result<(), HandlerErr> {
    match assessment_kind(conn, assessment_id)? {
        AssessmentKind::GradeEntryForm => Ok(()),
        AssessmentKind::Assignment => Err(HandlerErr::bad_params(
            "assessment is not a grade entry form",
        )),
    }
}

fn handle_grade_entry_item_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    let name = req_non_empty(req, "name")?;
    let out_of = req_f64(req, "outOf")?;
    if out_of < 0.0 {
        return Err(HandlerErr::bad_params("outOf must be >= 0").with_details(json!({ "outOf": out_of })));
    }
    let bonus = opt_bool(req, "bonus")?.unwrap_or(false);
    require_grade_entry_form(conn, &assessment_id)?;

    let item_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_entry_items(id, assessment_id, name, out_of, bonus) VALUES(?, ?, ?, ?, ?)",
        (&item_id, &assessment_id, &name, out_of, bonus as i64),
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => HandlerErr::new("conflict", "item name already used"),
        _ => HandlerErr::new("db_insert_failed", e.to_string()),
    })?;
    Ok(json!({ "itemId": item_id }))
}

fn handle_grade_entry_set_grade(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    let student_id = req_str(req, "studentId")?;
    let total_grade = opt_f64(req, "totalGrade")?;
    let released = opt_bool(req, "released")?.unwrap_or(false);
    require_grade_entry_form(conn, &assessment_id)?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    conn.execute(
        "INSERT INTO grade_entry_students(id, assessment_id, student_id, total_grade, released_to_student)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
           total_grade = excluded.total_grade,
           released_to_student = excluded.released_to_student",
        (
            Uuid::new_v4().to_string(),
            &assessment_id,
            &student_id,
            total_grade,
            released as i64,
        ),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "grade_entry_students" }))
    })?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "assessments.create" => handle_assessments_create(state, req),
        "assessments.list" => handle_assessments_list(state, req),
        "gradeEntry.itemCreate" => handle_grade_entry_item_create(state, req),
        "gradeEntry.setGrade" => handle_grade_entry_set_grade(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
