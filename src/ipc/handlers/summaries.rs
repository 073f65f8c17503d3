use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params::{opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use crate::summaries::{course_summary, load_summary_input, Viewer};
use serde_json::json;

/// `role` is "student" (with `studentId`) or "staff".
fn parse_viewer(req: &Request) -> Result<Viewer, HandlerErr> {
    let role = req_str(req, "role")?;
    match role.as_str() {
        "staff" | "admin" | "ta" => Ok(Viewer::Staff),
        "student" => {
            let Some(student_id) = opt_str(req, "studentId")? else {
                return Err(HandlerErr::bad_params("students must pass studentId"));
            };
            Ok(Viewer::Student { student_id })
        }
        other => Err(HandlerErr::bad_params("role must be one of: student, staff")
            .with_details(json!({ "role": other }))),
    }
}

fn handle_summaries_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let viewer = parse_viewer(req)?;
    let input = load_summary_input(conn, &viewer)?;
    let students = course_summary(&viewer, &input);
    tracing::debug!(rows = students.len(), staff = !viewer.is_student(), "course summary built");
    Ok(json!({ "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "summaries.get" => handle_summaries_get(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
