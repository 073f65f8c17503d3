use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::results::grouping_exists;
use crate::ipc::params::{opt_bool, opt_i64, opt_str, req_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

/// An extension's duration split the way it is entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionParts {
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
}

impl ExtensionParts {
    /// `None` when the total does not fit in an `i64`.
    pub fn to_seconds(self) -> Option<i64> {
        [
            (self.weeks, WEEK),
            (self.days, DAY),
            (self.hours, HOUR),
            (self.minutes, MINUTE),
        ]
        .into_iter()
        .try_fold(0i64, |total, (n, unit)| total.checked_add(n.checked_mul(unit)?))
    }

    pub fn from_seconds(secs: i64) -> Self {
        let weeks = secs / WEEK;
        let rem = secs % WEEK;
        let days = rem / DAY;
        let rem = rem % DAY;
        Self {
            weeks,
            days,
            hours: rem / HOUR,
            minutes: (rem % HOUR) / MINUTE,
        }
    }
}

fn parts_from_request(req: &Request) -> Result<ExtensionParts, HandlerErr> {
    let mut parts = ExtensionParts::default();
    for (key, slot) in [
        ("weeks", &mut parts.weeks),
        ("days", &mut parts.days),
        ("hours", &mut parts.hours),
        ("minutes", &mut parts.minutes),
    ] {
        let v = opt_i64(req, key)?.unwrap_or(0);
        if v < 0 {
            return Err(HandlerErr::bad_params(format!("{key} must be >= 0")));
        }
        *slot = v;
    }
    Ok(parts)
}

fn extension_json(time_delta: i64, note: Option<String>, apply_penalty: bool) -> serde_json::Value {
    json!({
        "timeDelta": time_delta,
        "parts": ExtensionParts::from_seconds(time_delta),
        "note": note,
        "applyPenalty": apply_penalty
    })
}

fn handle_create_or_update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let grouping_id = req_str(req, "groupingId")?;
    let parts = parts_from_request(req)?;
    let note = opt_str(req, "note")?;
    let apply_penalty = opt_bool(req, "penalty")?.unwrap_or(false);

    if !grouping_exists(conn, &grouping_id)? {
        return Err(HandlerErr::not_found("grouping not found")
            .with_details(json!({ "groupingId": grouping_id })));
    }
    let Some(time_delta) = parts.to_seconds() else {
        return Err(HandlerErr::bad_params("extension too long"));
    };
    if time_delta <= 0 {
        return Err(HandlerErr::bad_params("extension must be longer than zero"));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM extensions WHERE grouping_id = ?",
            [&grouping_id],
            |r| r.get(0),
        )
        .optional()?;
    let now = chrono::Utc::now().to_rfc3339();
    let created = existing.is_none();
    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE extensions SET time_delta = ?, note = ?, apply_penalty = ?, updated_at = ? WHERE id = ?",
                (time_delta, &note, apply_penalty as i64, &now, &id),
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO extensions(id, grouping_id, time_delta, note, apply_penalty, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &grouping_id,
                    time_delta,
                    &note,
                    apply_penalty as i64,
                    &now,
                ),
            )?;
        }
    }
    tracing::info!(grouping_id = %grouping_id, time_delta, created, "extension saved");
    Ok(json!({
        "created": created,
        "extension": extension_json(time_delta, note, apply_penalty)
    }))
}

fn handle_delete_by_grouping(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let grouping_id = req_str(req, "groupingId")?;
    let changed = conn.execute("DELETE FROM extensions WHERE grouping_id = ?", [&grouping_id])?;
    if changed == 0 {
        return Err(HandlerErr::not_found("no extension for this grouping"));
    }
    tracing::info!(grouping_id = %grouping_id, "extension deleted");
    Ok(json!({ "ok": true }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let grouping_id = req_str(req, "groupingId")?;
    let row: Option<(i64, Option<String>, i64)> = conn
        .query_row(
            "SELECT time_delta, note, apply_penalty FROM extensions WHERE grouping_id = ?",
            [&grouping_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    Ok(json!({
        "extension": row.map(|(time_delta, note, penalty)| extension_json(time_delta, note, penalty != 0))
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "extensions.createOrUpdate" => handle_create_or_update(state, req),
        "extensions.deleteByGrouping" => handle_delete_by_grouping(state, req),
        "extensions.get" => handle_get(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
