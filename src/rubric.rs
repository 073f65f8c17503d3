//! Rubric criterion level rules.
//!
//! Everything here is pure: callers load a criterion's levels, ask for a plan,
//! and persist the plan inside one transaction (see `rubric_store`). A plan is
//! only produced when the resulting level set is valid, so a rejected batch
//! never touches storage.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const DEFAULT_LEVEL_NAMES: [&str; 5] = ["Very Poor", "Weak", "Passable", "Good", "Excellent"];

pub const DEFAULT_LEVEL_DESCRIPTIONS: [&str; 5] = [
    "The student's work shows little or no understanding of the criterion.",
    "The student's work shows a weak understanding of the criterion.",
    "The student's work shows an acceptable understanding of the criterion.",
    "The student's work shows a good understanding of the criterion.",
    "The student's work shows an excellent understanding of the criterion.",
];

const MARK_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RubricError {
    #[error("criterion not found: {0}")]
    CriterionNotFound(String),

    #[error("level not found: {0}")]
    LevelNotFound(String),

    #[error("level {0} is referenced more than once in the batch")]
    DuplicateEdit(String),

    #[error("level names must be unique within a criterion (duplicate: {0})")]
    DuplicateLevelName(String),

    #[error("level marks must be unique within a criterion (duplicate: {0})")]
    DuplicateLevelMark(f64),

    #[error("level name must not be empty")]
    EmptyLevelName,

    #[error("level marks must be >= 0 (got {0})")]
    NegativeLevelMark(f64),

    #[error("a rubric criterion needs at least one level")]
    NoLevels,

    #[error("max mark must be a number > 0 (got {0})")]
    InvalidMaxMark(f64),

    #[error("criterion name must not be empty")]
    EmptyCriterionName,

    #[error("criterion name already used in this assignment: {0}")]
    DuplicateCriterionName(String),

    #[error("results using this criterion have been released to students")]
    Released,

    #[error("database error: {0}")]
    Db(String),
}

impl RubricError {
    /// Stable wire code for the IPC envelope.
    pub fn code(&self) -> &'static str {
        match self {
            RubricError::CriterionNotFound(_) | RubricError::LevelNotFound(_) => "not_found",
            RubricError::Released => "released",
            RubricError::Db(_) => "db_failed",
            _ => "validation_failed",
        }
    }
}

impl From<rusqlite::Error> for RubricError {
    fn from(e: rusqlite::Error) -> Self {
        RubricError::Db(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub id: String,
    pub name: String,
    pub description: String,
    pub mark: f64,
    pub mark_overridden: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    pub id: String,
    pub assessment_id: String,
    pub name: String,
    pub max_mark: f64,
    pub position: i64,
    pub bonus: bool,
    pub levels: Vec<Level>,
}

/// One entry of a batch level edit. `id` present means update in place.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LevelEdit {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mark: f64,
    /// Marks the level overridden even when `mark` equals the stored value.
    /// Set by single-level updates and CSV imports that write a mark.
    #[serde(skip)]
    pub pin_mark: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarkRemap {
    Keep,
    Set(f64),
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelBatchPlan {
    /// Final level set, ordered by mark.
    pub levels: Vec<Level>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<Level>,
    /// (old, new) for every surviving level whose mark moved.
    pub mark_changes: Vec<(f64, f64)>,
}

impl LevelBatchPlan {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// What happens to a stored mark currently holding `value`. Resolved
    /// against old level values so swaps don't cascade.
    pub fn remap(&self, value: f64) -> MarkRemap {
        if let Some((_, new)) = self
            .mark_changes
            .iter()
            .find(|(old, _)| same_mark(*old, value))
        {
            return MarkRemap::Set(*new);
        }
        if self.deleted.iter().any(|l| same_mark(l.mark, value)) {
            return MarkRemap::Clear;
        }
        MarkRemap::Keep
    }
}

pub fn same_mark(a: f64, b: f64) -> bool {
    (a - b).abs() < MARK_EPSILON
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Max marks are kept to one decimal place.
pub fn round_max_mark(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn validate_max_mark(x: f64) -> Result<f64, RubricError> {
    let rounded = round_max_mark(x);
    if !x.is_finite() || rounded <= 0.0 {
        return Err(RubricError::InvalidMaxMark(x));
    }
    Ok(rounded)
}

pub fn sort_levels(levels: &mut [Level]) {
    levels.sort_by(|a, b| a.mark.total_cmp(&b.mark).then_with(|| a.name.cmp(&b.name)));
}

pub fn validate_levels(levels: &[Level]) -> Result<(), RubricError> {
    if levels.is_empty() {
        return Err(RubricError::NoLevels);
    }
    let mut names: HashSet<&str> = HashSet::new();
    let mut marks: Vec<f64> = Vec::with_capacity(levels.len());
    for level in levels {
        if level.name.trim().is_empty() {
            return Err(RubricError::EmptyLevelName);
        }
        if !level.mark.is_finite() || level.mark < 0.0 {
            return Err(RubricError::NegativeLevelMark(level.mark));
        }
        if !names.insert(level.name.as_str()) {
            return Err(RubricError::DuplicateLevelName(level.name.clone()));
        }
        if marks.iter().any(|m| same_mark(*m, level.mark)) {
            return Err(RubricError::DuplicateLevelMark(level.mark));
        }
        marks.push(level.mark);
    }
    Ok(())
}

/// Applies `edits` to `current` in memory and validates the outcome as a unit.
pub fn plan_level_batch(
    current: &[Level],
    edits: &[LevelEdit],
    mut new_id: impl FnMut() -> String,
) -> Result<LevelBatchPlan, RubricError> {
    let by_id: HashMap<&str, &Level> = current.iter().map(|l| (l.id.as_str(), l)).collect();
    let mut seen: HashSet<String> = HashSet::new();

    let mut levels: Vec<Level> = Vec::with_capacity(edits.len());
    let mut created = Vec::new();
    let mut updated = Vec::new();
    let mut mark_changes = Vec::new();

    for edit in edits {
        let name = edit.name.trim().to_string();
        match edit.id.as_deref() {
            Some(id) => {
                let Some(existing) = by_id.get(id) else {
                    return Err(RubricError::LevelNotFound(id.to_string()));
                };
                if !seen.insert(id.to_string()) {
                    return Err(RubricError::DuplicateEdit(id.to_string()));
                }
                let moved = !same_mark(existing.mark, edit.mark);
                let next = Level {
                    id: existing.id.clone(),
                    name,
                    description: edit
                        .description
                        .clone()
                        .unwrap_or_else(|| existing.description.clone()),
                    mark: edit.mark,
                    mark_overridden: existing.mark_overridden || moved || edit.pin_mark,
                };
                if moved {
                    mark_changes.push((existing.mark, edit.mark));
                }
                if next != **existing {
                    updated.push(next.id.clone());
                }
                levels.push(next);
            }
            None => {
                let id = new_id();
                created.push(id.clone());
                levels.push(Level {
                    id,
                    name,
                    description: edit.description.clone().unwrap_or_default(),
                    mark: edit.mark,
                    mark_overridden: true,
                });
            }
        }
    }

    validate_levels(&levels)?;

    let deleted: Vec<Level> = current
        .iter()
        .filter(|l| !seen.contains(&l.id))
        .cloned()
        .collect();

    sort_levels(&mut levels);
    Ok(LevelBatchPlan {
        levels,
        created,
        updated,
        deleted,
        mark_changes,
    })
}

/// Scales every level not manually set by `new_max / old_max`.
pub fn plan_rescale(
    current: &[Level],
    old_max: f64,
    new_max: f64,
) -> Result<LevelBatchPlan, RubricError> {
    let mut levels = current.to_vec();
    let mut updated = Vec::new();
    let mut mark_changes = Vec::new();

    if old_max > 0.0 && !same_mark(old_max, new_max) {
        let ratio = new_max / old_max;
        for level in levels.iter_mut().filter(|l| !l.mark_overridden) {
            let scaled = round2(level.mark * ratio);
            if !same_mark(scaled, level.mark) {
                mark_changes.push((level.mark, scaled));
                updated.push(level.id.clone());
                level.mark = scaled;
            }
        }
    }

    validate_levels(&levels)?;
    sort_levels(&mut levels);
    Ok(LevelBatchPlan {
        levels,
        created: Vec::new(),
        updated,
        deleted: Vec::new(),
        mark_changes,
    })
}

/// The five stock levels. With `max_mark` the marks are spread evenly from 0
/// to it; without, they are 0..4.
pub fn default_levels(max_mark: Option<f64>, mut new_id: impl FnMut() -> String) -> Vec<Level> {
    let steps = (DEFAULT_LEVEL_NAMES.len() - 1) as f64;
    DEFAULT_LEVEL_NAMES
        .iter()
        .zip(DEFAULT_LEVEL_DESCRIPTIONS.iter())
        .enumerate()
        .map(|(i, (name, description))| Level {
            id: new_id(),
            name: name.to_string(),
            description: description.to_string(),
            mark: match max_mark {
                Some(max) => round2(i as f64 * max / steps),
                None => i as f64,
            },
            mark_overridden: false,
        })
        .collect()
}

pub fn level_with_mark_closest_to(levels: &[Level], value: f64) -> Option<&Level> {
    levels
        .iter()
        .min_by(|a, b| (a.mark - value).abs().total_cmp(&(b.mark - value).abs()))
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CsvRowError {
    #[error("invalid csv row format: {0}")]
    InvalidLine(String),

    #[error("invalid argument: {0}")]
    Argument(String),
}

impl CsvRowError {
    pub fn code(&self) -> &'static str {
        match self {
            CsvRowError::InvalidLine(_) => "csv_invalid_line",
            CsvRowError::Argument(_) => "bad_argument",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvLevel {
    pub name: String,
    pub description: String,
    pub mark: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CsvCriterionRow {
    pub name: String,
    pub max_mark: f64,
    pub levels: Vec<CsvLevel>,
}

/// Parses `name, max_mark, [level_name, level_description, level_mark]*`.
pub fn parse_csv_row(row: &[String]) -> Result<CsvCriterionRow, CsvRowError> {
    if row.len() < 2 {
        return Err(CsvRowError::InvalidLine(format!(
            "expected at least 2 fields, got {}",
            row.len()
        )));
    }
    let name = row[0].trim().to_string();
    if name.is_empty() {
        return Err(CsvRowError::InvalidLine("criterion name is empty".into()));
    }
    let max_mark = parse_number(&row[1], "max mark")?;

    let rest = &row[2..];
    if rest.is_empty() || rest.len() % 3 != 0 {
        return Err(CsvRowError::InvalidLine(format!(
            "expected (name, description, mark) triples after max mark, got {} fields",
            rest.len()
        )));
    }

    let mut levels = Vec::with_capacity(rest.len() / 3);
    for chunk in rest.chunks(3) {
        let level_name = chunk[0].trim().to_string();
        if level_name.is_empty() {
            return Err(CsvRowError::Argument("level name is empty".into()));
        }
        let mark = parse_number(&chunk[2], "level mark")?;
        if mark < 0.0 {
            return Err(CsvRowError::Argument(format!(
                "level mark must be >= 0 (got {mark})"
            )));
        }
        levels.push(CsvLevel {
            name: level_name,
            description: chunk[1].clone(),
            mark,
        });
    }

    Ok(CsvCriterionRow {
        name,
        max_mark,
        levels,
    })
}

fn parse_number(raw: &str, what: &str) -> Result<f64, CsvRowError> {
    let v = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| CsvRowError::Argument(format!("{what} is not a number: {raw:?}")))?;
    if !v.is_finite() {
        return Err(CsvRowError::Argument(format!("{what} is not finite: {raw:?}")));
    }
    Ok(v)
}

/// Level edits replacing `current` with the imported levels; existing levels
/// are matched by name.
pub fn csv_level_edits(current: &[Level], imported: &[CsvLevel]) -> Vec<LevelEdit> {
    imported
        .iter()
        .map(|lvl| LevelEdit {
            id: current
                .iter()
                .find(|l| l.name == lvl.name)
                .map(|l| l.id.clone()),
            name: lvl.name.clone(),
            description: Some(lvl.description.clone()),
            mark: lvl.mark,
            pin_mark: true,
        })
        .collect()
}
