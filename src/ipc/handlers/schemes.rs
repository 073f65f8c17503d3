use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::assessments::assessment_kind;
use crate::ipc::params::{opt_f64, req_non_empty, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_schemes_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let name = req_non_empty(req, "name")?;
    let scheme_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO marking_schemes(id, name) VALUES(?, ?)",
        (&scheme_id, &name),
    )?;
    Ok(json!({ "schemeId": scheme_id }))
}

fn handle_schemes_set_weight(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let scheme_id = req_str(req, "schemeId")?;
    let assessment_id = req_str(req, "assessmentId")?;
    let weight = opt_f64(req, "weight")?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM marking_schemes WHERE id = ?",
            [&scheme_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("marking scheme not found"));
    }
    assessment_kind(conn, &assessment_id)?;

    conn.execute(
        "INSERT INTO marking_weights(id, marking_scheme_id, assessment_id, weight) VALUES(?, ?, ?, ?)
         ON CONFLICT(marking_scheme_id, assessment_id) DO UPDATE SET weight = excluded.weight",
        (Uuid::new_v4().to_string(), &scheme_id, &assessment_id, weight),
    )?;
    Ok(json!({ "weight": weight }))
}

fn handle_schemes_list(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let mut stmt = conn.prepare("SELECT id, name FROM marking_schemes ORDER BY rowid")?;
    let schemes = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            Ok(json!({ "id": id, "name": name }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "schemes": schemes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "markingSchemes.create" => handle_schemes_create(state, req),
        "markingSchemes.setWeight" => handle_schemes_set_weight(state, req),
        "markingSchemes.list" => handle_schemes_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
