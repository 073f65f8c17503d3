use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params::{opt_bool, opt_str, req_non_empty};
use crate::ipc::types::{AppState, Request};
use rusqlite::{ErrorCode, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_students_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let user_name = req_non_empty(req, "userName")?;
    let first_name = req_non_empty(req, "firstName")?;
    let last_name = req_non_empty(req, "lastName")?;
    let id_number = opt_str(req, "idNumber")?;
    let hidden = opt_bool(req, "hidden")?.unwrap_or(false);

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, id_number, user_name, first_name, last_name, hidden)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &id_number, &user_name, &first_name, &last_name, hidden as i64),
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            HandlerErr::new("conflict", "user name already taken")
                .with_details(json!({ "userName": user_name }))
        }
        _ => HandlerErr::new("db_insert_failed", e.to_string())
            .with_details(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id }))
}

fn handle_students_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare(
        "SELECT id, id_number, user_name, first_name, last_name, hidden
         FROM students ORDER BY user_name",
    )?;
    let students = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let id_number: Option<String> = row.get(1)?;
            let user_name: String = row.get(2)?;
            let first_name: String = row.get(3)?;
            let last_name: String = row.get(4)?;
            let hidden: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "idNumber": id_number,
                "userName": user_name,
                "firstName": first_name,
                "lastName": last_name,
                "hidden": hidden != 0
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "students": students }))
}

pub fn student_exists(conn: &rusqlite::Connection, student_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.create" => handle_students_create(state, req),
        "students.list" => handle_students_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
