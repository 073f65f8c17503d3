use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::assessments::assessment_kind;
use crate::ipc::handlers::roster::student_exists;
use crate::ipc::params::{opt_bool, opt_f64, req_str};
use crate::ipc::types::{AppState, Request};
use crate::summaries::AssessmentKind;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn grouping_exists(conn: &Connection, grouping_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM groupings WHERE id = ?", [grouping_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn result_released(conn: &Connection, result_id: &str) -> Result<bool, HandlerErr> {
    let released: Option<i64> = conn
        .query_row(
            "SELECT released_to_students FROM results WHERE id = ?",
            [result_id],
            |r| r.get(0),
        )
        .optional()?;
    match released {
        Some(v) => Ok(v != 0),
        None => Err(HandlerErr::not_found("result not found")
            .with_details(json!({ "resultId": result_id }))),
    }
}

/// Returns the existing grouping when the student already has one.
fn handle_groupings_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    let student_id = req_str(req, "studentId")?;
    if assessment_kind(conn, &assessment_id)? != AssessmentKind::Assignment {
        return Err(HandlerErr::bad_params("groupings belong to assignments"));
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM groupings WHERE assessment_id = ? AND student_id = ?",
            (&assessment_id, &student_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(grouping_id) = existing {
        return Ok(json!({ "groupingId": grouping_id, "created": false }));
    }

    let grouping_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO groupings(id, assessment_id, student_id) VALUES(?, ?, ?)",
        (&grouping_id, &assessment_id, &student_id),
    )?;
    Ok(json!({ "groupingId": grouping_id, "created": true }))
}

/// New results start with an empty mark for every criterion.
fn handle_results_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let grouping_id = req_str(req, "groupingId")?;
    if !grouping_exists(conn, &grouping_id)? {
        return Err(HandlerErr::not_found("grouping not found"));
    }

    let result_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO results(id, grouping_id, released_to_students, created_at) VALUES(?, ?, 0, ?)",
        (&result_id, &grouping_id, chrono::Utc::now().to_rfc3339()),
    )?;
    let mut stmt = tx.prepare(
        "SELECT c.id FROM criteria c
         JOIN groupings g ON g.assessment_id = c.assessment_id
         WHERE g.id = ? ORDER BY c.position",
    )?;
    let criterion_ids = stmt
        .query_map([&grouping_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for criterion_id in &criterion_ids {
        tx.execute(
            "INSERT INTO marks(id, result_id, criterion_id, mark) VALUES(?, ?, ?, NULL)",
            (Uuid::new_v4().to_string(), &result_id, criterion_id),
        )?;
    }
    tx.commit()?;

    Ok(json!({ "resultId": result_id, "marks": criterion_ids.len() }))
}

fn handle_results_release(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let result_id = req_str(req, "resultId")?;
    let released = opt_bool(req, "released")?.unwrap_or(true);
    result_released(conn, &result_id)?;
    conn.execute(
        "UPDATE results SET released_to_students = ? WHERE id = ?",
        (released as i64, &result_id),
    )?;
    tracing::info!(result_id = %result_id, released, "result release flag changed");
    Ok(json!({ "released": released }))
}

fn handle_marks_set(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let result_id = req_str(req, "resultId")?;
    let criterion_id = req_str(req, "criterionId")?;
    let mark = opt_f64(req, "mark")?;

    if result_released(conn, &result_id)? {
        return Err(HandlerErr::new(
            "released",
            "result has been released to students",
        ));
    }
    let max_mark: Option<f64> = conn
        .query_row(
            "SELECT c.max_mark FROM criteria c
             JOIN groupings g ON g.assessment_id = c.assessment_id
             JOIN results r ON r.grouping_id = g.id
             WHERE c.id = ? AND r.id = ?",
            (&criterion_id, &result_id),
            |r| r.get(0),
        )
        .optional()?;
    let Some(max_mark) = max_mark else {
        return Err(HandlerErr::not_found("criterion not found for this result"));
    };
    if let Some(m) = mark {
        if m < 0.0 || m > max_mark {
            return Err(HandlerErr::new("validation_failed", "mark must be between 0 and the max mark")
                .with_details(json!({ "mark": m, "maxMark": max_mark })));
        }
    }

    conn.execute(
        "INSERT INTO marks(id, result_id, criterion_id, mark) VALUES(?, ?, ?, ?)
         ON CONFLICT(result_id, criterion_id) DO UPDATE SET mark = excluded.mark",
        (Uuid::new_v4().to_string(), &result_id, &criterion_id, mark),
    )?;
    Ok(json!({ "mark": mark }))
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let result_id = req_str(req, "resultId")?;
    let released = result_released(conn, &result_id)?;

    let mut stmt = conn.prepare(
        "SELECT m.criterion_id, c.name, m.mark, c.max_mark
         FROM marks m JOIN criteria c ON c.id = m.criterion_id
         WHERE m.result_id = ? ORDER BY c.position",
    )?;
    let mut total: Option<f64> = None;
    let marks = stmt
        .query_map([&result_id], |row| {
            let criterion_id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let mark: Option<f64> = row.get(2)?;
            let max_mark: f64 = row.get(3)?;
            Ok((criterion_id, name, mark, max_mark))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(criterion_id, name, mark, max_mark)| {
            if let Some(m) = mark {
                total = Some(total.unwrap_or(0.0) + m);
            }
            json!({
                "criterionId": criterion_id,
                "criterionName": name,
                "mark": mark,
                "maxMark": max_mark
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({ "marks": marks, "totalMark": total, "released": released }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "groupings.create" => handle_groupings_create(state, req),
        "results.create" => handle_results_create(state, req),
        "results.release" => handle_results_release(state, req),
        "marks.set" => handle_marks_set(state, req),
        "marks.list" => handle_marks_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
