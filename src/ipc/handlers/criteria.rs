use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::assessments::assessment_kind;
use crate::ipc::params::{opt_bool, opt_f64, opt_str, req_f64, req_json, req_non_empty, req_str};
use crate::ipc::types::{AppState, Request};
use crate::rubric::LevelEdit;
use crate::rubric_store::{CriterionPatch, LevelPatch, RubricStore};
use crate::summaries::AssessmentKind;
use serde_json::json;
use std::collections::BTreeMap;

fn require_assignment(conn: &rusqlite::Connection, assessment_id: &str) -> Result<(), HandlerErr> {
    match assessment_kind(conn, assessment_id)? {
        AssessmentKind::Assignment => Ok(()),
        AssessmentKind::GradeEntryForm => Err(HandlerErr::bad_params(
            "criteria belong to assignments, not grade entry forms",
        )),
    }
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    let name = req_non_empty(req, "name")?;
    let max_mark = req_f64(req, "maxMark")?;
    let bonus = opt_bool(req, "bonus")?.unwrap_or(false);
    let levels: Option<Vec<LevelEdit>> = match req.params.get("levels") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(_) => Some(req_json(req, "levels")?),
    };
    require_assignment(conn, &assessment_id)?;

    let criterion = RubricStore::new(conn).create_criterion(
        &assessment_id,
        &name,
        max_mark,
        bonus,
        levels.as_deref(),
    )?;
    Ok(json!({ "criterion": criterion }))
}

fn handle_criteria_list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    require_assignment(conn, &assessment_id)?;
    let store = RubricStore::new(conn);
    let criteria = store.list_criteria(&assessment_id)?;
    let mut released = Vec::with_capacity(criteria.len());
    for c in &criteria {
        released.push(store.is_released(&c.id)?);
    }
    let out: Vec<serde_json::Value> = criteria
        .iter()
        .zip(released)
        .map(|(c, released)| json!({ "criterion": c, "released": released }))
        .collect();
    Ok(json!({ "criteria": out }))
}

fn handle_criteria_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    let patch = CriterionPatch {
        name: opt_str(req, "name")?,
        max_mark: opt_f64(req, "maxMark")?,
        bonus: opt_bool(req, "bonus")?,
    };
    if patch.name.is_none() && patch.max_mark.is_none() && patch.bonus.is_none() {
        return Err(HandlerErr::bad_params("patch must include at least one field"));
    }
    let criterion = RubricStore::new(conn).update_criterion(&criterion_id, &patch)?;
    Ok(json!({ "criterion": criterion }))
}

fn handle_criteria_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    RubricStore::new(conn).delete_criterion(&criterion_id)?;
    Ok(json!({ "ok": true }))
}

fn cell_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Each row is imported on its own; a bad row is reported and skipped.
fn handle_criteria_import_csv_rows(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let assessment_id = req_str(req, "assessmentId")?;
    let rows: Vec<Vec<serde_json::Value>> = req_json(req, "rows")?;
    require_assignment(conn, &assessment_id)?;

    let store = RubricStore::new(conn);
    let mut imported = Vec::new();
    let mut errors = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        match store.upsert_from_csv_row(&assessment_id, &cells) {
            Ok(c) => imported.push(c.id),
            Err(e) => {
                tracing::warn!(row = i, code = e.code(), error = %e, "csv row rejected");
                errors.push(json!({
                    "row": i,
                    "code": e.code(),
                    "message": e.to_string()
                }));
            }
        }
    }
    Ok(json!({ "imported": imported, "errors": errors }))
}

fn handle_criteria_closest_level(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    let mark = req_f64(req, "mark")?;
    let level = RubricStore::new(conn).level_with_mark_closest_to(&criterion_id, mark)?;
    Ok(json!({ "level": level }))
}

fn handle_levels_update_batch(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    let edits: BTreeMap<String, LevelEdit> = req_json(req, "levels")?;
    let edits: Vec<LevelEdit> = edits.into_values().collect();

    let store = RubricStore::new(conn);
    let plan = store.commit_level_batch(&criterion_id, &edits)?;
    Ok(json!({
        "levels": plan.levels,
        "created": plan.created.len(),
        "updated": plan.updated.len(),
        "deleted": plan.deleted.len()
    }))
}

fn handle_levels_set_defaults(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    let criterion = RubricStore::new(conn).set_default_levels(&criterion_id)?;
    Ok(json!({ "criterion": criterion }))
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let criterion_id = req_str(req, "criterionId")?;
    let name = req_non_empty(req, "name")?;
    let description = opt_str(req, "description")?.unwrap_or_default();
    let mark = req_f64(req, "mark")?;
    let level = RubricStore::new(conn).create_level(&criterion_id, &name, &description, mark)?;
    Ok(json!({ "level": level }))
}

fn handle_levels_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let level_id = req_str(req, "levelId")?;
    let patch = LevelPatch {
        name: opt_str(req, "name")?,
        description: opt_str(req, "description")?,
        mark: opt_f64(req, "mark")?,
    };
    let level = RubricStore::new(conn).update_level(&level_id, &patch)?;
    Ok(json!({ "level": level }))
}

fn handle_levels_delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let level_id = req_str(req, "levelId")?;
    RubricStore::new(conn).delete_level(&level_id)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "criteria.create" => handle_criteria_create(state, req),
        "criteria.list" => handle_criteria_list(state, req),
        "criteria.update" => handle_criteria_update(state, req),
        "criteria.delete" => handle_criteria_delete(state, req),
        "criteria.importCsvRows" => handle_criteria_import_csv_rows(state, req),
        "criteria.closestLevel" => handle_criteria_closest_level(state, req),
        "levels.updateBatch" => handle_levels_update_batch(state, req),
        "levels.setDefaults" => handle_levels_set_defaults(state, req),
        "levels.create" => handle_levels_create(state, req),
        "levels.update" => handle_levels_update(state, req),
        "levels.delete" => handle_levels_delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
