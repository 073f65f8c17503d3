//! SQLite persistence for rubric criteria and their levels.
//!
//! Every mutation runs as: load, plan in memory (`rubric`), then apply the
//! plan inside a single transaction. Marks stored against the criterion are
//! remapped in the same transaction.

use crate::rubric::{
    self, csv_level_edits, default_levels, parse_csv_row, plan_level_batch, plan_rescale,
    validate_max_mark, Criterion, CsvRowError, Level, LevelBatchPlan, LevelEdit, MarkRemap,
    RubricError,
};
use rusqlite::{Connection, OptionalExtension, Transaction};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CsvImportError {
    #[error(transparent)]
    Row(#[from] CsvRowError),

    #[error(transparent)]
    Rubric(#[from] RubricError),
}

impl CsvImportError {
    pub fn code(&self) -> &'static str {
        match self {
            CsvImportError::Row(e) => e.code(),
            CsvImportError::Rubric(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CriterionPatch {
    pub name: Option<String>,
    pub max_mark: Option<f64>,
    pub bonus: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct LevelPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub mark: Option<f64>,
}

pub struct RubricStore<'a> {
    conn: &'a Connection,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl<'a> RubricStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn load_criterion_with_levels(&self, criterion_id: &str) -> Result<Criterion, RubricError> {
        load_criterion(self.conn, criterion_id)
    }

    pub fn list_criteria(&self, assessment_id: &str) -> Result<Vec<Criterion>, RubricError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM criteria WHERE assessment_id = ? ORDER BY position")?;
        let ids = stmt
            .query_map([assessment_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter().map(|id| load_criterion(self.conn, id)).collect()
    }

    /// True once any result holding a mark for this criterion is released.
    pub fn is_released(&self, criterion_id: &str) -> Result<bool, RubricError> {
        criterion_released(self.conn, criterion_id)
    }

    pub fn create_criterion(
        &self,
        assessment_id: &str,
        name: &str,
        max_mark: f64,
        bonus: bool,
        levels: Option<&[LevelEdit]>,
    ) -> Result<Criterion, RubricError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RubricError::EmptyCriterionName);
        }
        let max_mark = validate_max_mark(max_mark)?;
        let tx = self.conn.unchecked_transaction()?;
        let criterion_id = insert_criterion(&tx, assessment_id, name, max_mark, bonus)?;

        let initial = match levels {
            Some(edits) => plan_level_batch(&[], edits, new_id)?.levels,
            None => default_levels(Some(max_mark), new_id),
        };
        rubric::validate_levels(&initial)?;
        for level in &initial {
            insert_level(&tx, &criterion_id, level)?;
        }
        tx.commit()?;

        tracing::info!(criterion_id = %criterion_id, assessment_id, "criterion created");
        load_criterion(self.conn, &criterion_id)
    }

    /// Updates name/max mark/bonus. A new max mark rescales levels that were
    /// never set by hand and remaps stored marks accordingly.
    pub fn update_criterion(
        &self,
        criterion_id: &str,
        patch: &CriterionPatch,
    ) -> Result<Criterion, RubricError> {
        let current = load_criterion(self.conn, criterion_id)?;
        if criterion_released(self.conn, criterion_id)? {
            return Err(RubricError::Released);
        }

        let name = match patch.name.as_deref().map(str::trim) {
            Some("") => return Err(RubricError::EmptyCriterionName),
            Some(n) => n.to_string(),
            None => current.name.clone(),
        };
        if name != current.name && criterion_name_taken(self.conn, &current.assessment_id, &name)? {
            return Err(RubricError::DuplicateCriterionName(name));
        }
        let max_mark = match patch.max_mark {
            Some(m) => validate_max_mark(m)?,
            None => current.max_mark,
        };
        let bonus = patch.bonus.unwrap_or(current.bonus);

        let plan = plan_rescale(&current.levels, current.max_mark, max_mark)?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE criteria SET name = ?, max_mark = ?, bonus = ? WHERE id = ?",
            (&name, max_mark, bonus as i64, criterion_id),
        )?;
        apply_plan(&tx, criterion_id, &plan)?;
        tx.commit()?;

        if !plan.is_noop() {
            tracing::info!(
                criterion_id,
                old_max = current.max_mark,
                new_max = max_mark,
                rescaled = plan.updated.len(),
                "criterion levels rescaled"
            );
        }
        load_criterion(self.conn, criterion_id)
    }

    pub fn delete_criterion(&self, criterion_id: &str) -> Result<(), RubricError> {
        load_criterion(self.conn, criterion_id)?;
        if criterion_released(self.conn, criterion_id)? {
            return Err(RubricError::Released);
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM marks WHERE criterion_id = ?", [criterion_id])?;
        tx.execute("DELETE FROM levels WHERE criterion_id = ?", [criterion_id])?;
        tx.execute("DELETE FROM criteria WHERE id = ?", [criterion_id])?;
        tx.commit()?;
        tracing::info!(criterion_id, "criterion deleted");
        Ok(())
    }

    /// Reconciles the criterion's levels with `edits` as one unit. Nothing is
    /// written unless the whole resulting level set is valid.
    pub fn commit_level_batch(
        &self,
        criterion_id: &str,
        edits: &[LevelEdit],
    ) -> Result<LevelBatchPlan, RubricError> {
        let current = load_criterion(self.conn, criterion_id)?;
        if criterion_released(self.conn, criterion_id)? {
            return Err(RubricError::Released);
        }
        let plan = plan_level_batch(&current.levels, edits, new_id)?;

        let tx = self.conn.unchecked_transaction()?;
        apply_plan(&tx, criterion_id, &plan)?;
        tx.commit()?;

        tracing::debug!(
            criterion_id,
            created = plan.created.len(),
            updated = plan.updated.len(),
            deleted = plan.deleted.len(),
            "level batch committed"
        );
        Ok(plan)
    }

    /// Replaces all levels with the stock set (marks 0..4) and clears every
    /// override flag. Stored marks are left as they are.
    pub fn set_default_levels(&self, criterion_id: &str) -> Result<Criterion, RubricError> {
        load_criterion(self.conn, criterion_id)?;
        if criterion_released(self.conn, criterion_id)? {
            return Err(RubricError::Released);
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM levels WHERE criterion_id = ?", [criterion_id])?;
        for level in default_levels(None, new_id) {
            insert_level(&tx, criterion_id, &level)?;
        }
        tx.commit()?;
        load_criterion(self.conn, criterion_id)
    }

    pub fn create_level(
        &self,
        criterion_id: &str,
        name: &str,
        description: &str,
        mark: f64,
    ) -> Result<Level, RubricError> {
        let current = load_criterion(self.conn, criterion_id)?;
        let mut edits = keep_edits(&current.levels);
        edits.push(LevelEdit {
            id: None,
            name: name.to_string(),
            description: Some(description.to_string()),
            mark,
            pin_mark: true,
        });
        let plan = self.commit_level_batch(criterion_id, &edits)?;
        let created = plan.created.first().cloned().unwrap_or_default();
        plan.levels
            .into_iter()
            .find(|l| l.id == created)
            .ok_or(RubricError::LevelNotFound(created))
    }

    pub fn update_level(&self, level_id: &str, patch: &LevelPatch) -> Result<Level, RubricError> {
        let criterion_id = level_criterion_id(self.conn, level_id)?;
        let current = load_criterion(self.conn, &criterion_id)?;
        let mut edits = keep_edits(&current.levels);
        for e in edits.iter_mut().filter(|e| e.id.as_deref() == Some(level_id)) {
            if let Some(name) = &patch.name {
                e.name = name.clone();
            }
            if let Some(description) = &patch.description {
                e.description = Some(description.clone());
            }
            if let Some(mark) = patch.mark {
                e.mark = mark;
                e.pin_mark = true;
            }
        }
        let plan = self.commit_level_batch(&criterion_id, &edits)?;
        plan.levels
            .into_iter()
            .find(|l| l.id == level_id)
            .ok_or_else(|| RubricError::LevelNotFound(level_id.to_string()))
    }

    pub fn delete_level(&self, level_id: &str) -> Result<(), RubricError> {
        let criterion_id = level_criterion_id(self.conn, level_id)?;
        let current = load_criterion(self.conn, &criterion_id)?;
        let edits: Vec<LevelEdit> = keep_edits(&current.levels)
            .into_iter()
            .filter(|e| e.id.as_deref() != Some(level_id))
            .collect();
        self.commit_level_batch(&criterion_id, &edits)?;
        Ok(())
    }

    pub fn level_with_mark_closest_to(
        &self,
        criterion_id: &str,
        value: f64,
    ) -> Result<Option<Level>, RubricError> {
        let criterion = load_criterion(self.conn, criterion_id)?;
        Ok(rubric::level_with_mark_closest_to(&criterion.levels, value).cloned())
    }

    /// Creates or updates the criterion named in `row` within the assignment.
    /// An existing criterion gets its levels replaced through the same
    /// plan/validate pipeline as `commit_level_batch`.
    pub fn upsert_from_csv_row(
        &self,
        assessment_id: &str,
        row: &[String],
    ) -> Result<Criterion, CsvImportError> {
        let parsed = parse_csv_row(row)?;
        let max_mark = validate_max_mark(parsed.max_mark)
            .map_err(|e| CsvRowError::Argument(e.to_string()))?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM criteria WHERE assessment_id = ? AND name = ?",
                (assessment_id, &parsed.name),
                |r| r.get(0),
            )
            .optional()
            .map_err(RubricError::from)?;

        let Some(criterion_id) = existing else {
            let edits = csv_level_edits(&[], &parsed.levels);
            return Ok(self.create_criterion(
                assessment_id,
                &parsed.name,
                max_mark,
                false,
                Some(edits.as_slice()),
            )?);
        };

        let current = load_criterion(self.conn, &criterion_id)?;
        if criterion_released(self.conn, &criterion_id)? {
            return Err(RubricError::Released.into());
        }
        let edits = csv_level_edits(&current.levels, &parsed.levels);
        let plan = plan_level_batch(&current.levels, &edits, new_id)?;

        let tx = self.conn.unchecked_transaction().map_err(RubricError::from)?;
        tx.execute(
            "UPDATE criteria SET max_mark = ? WHERE id = ?",
            (max_mark, &criterion_id),
        )
        .map_err(RubricError::from)?;
        apply_plan(&tx, &criterion_id, &plan)?;
        tx.commit().map_err(RubricError::from)?;

        tracing::info!(criterion_id = %criterion_id, levels = plan.levels.len(), "criterion updated from csv row");
        Ok(load_criterion(self.conn, &criterion_id)?)
    }
}

fn keep_edits(levels: &[Level]) -> Vec<LevelEdit> {
    levels
        .iter()
        .map(|l| LevelEdit {
            id: Some(l.id.clone()),
            name: l.name.clone(),
            description: Some(l.description.clone()),
            mark: l.mark,
            pin_mark: false,
        })
        .collect()
}

fn load_criterion(conn: &Connection, criterion_id: &str) -> Result<Criterion, RubricError> {
    let row = conn
        .query_row(
            "SELECT id, assessment_id, name, max_mark, position, bonus FROM criteria WHERE id = ?",
            [criterion_id],
            |r| {
                Ok(Criterion {
                    id: r.get(0)?,
                    assessment_id: r.get(1)?,
                    name: r.get(2)?,
                    max_mark: r.get(3)?,
                    position: r.get(4)?,
                    bonus: r.get::<_, i64>(5)? != 0,
                    levels: Vec::new(),
                })
            },
        )
        .optional()?;
    let Some(mut criterion) = row else {
        return Err(RubricError::CriterionNotFound(criterion_id.to_string()));
    };

    let mut stmt = conn.prepare(
        "SELECT id, name, description, mark, mark_overridden
         FROM levels WHERE criterion_id = ? ORDER BY mark, name",
    )?;
    criterion.levels = stmt
        .query_map([criterion_id], |r| {
            Ok(Level {
                id: r.get(0)?,
                name: r.get(1)?,
                description: r.get(2)?,
                mark: r.get(3)?,
                mark_overridden: r.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(criterion)
}

fn criterion_released(conn: &Connection, criterion_id: &str) -> Result<bool, RubricError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM marks m
             JOIN results r ON r.id = m.result_id
             WHERE m.criterion_id = ? AND r.released_to_students = 1
             LIMIT 1",
            [criterion_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn criterion_name_taken(
    conn: &Connection,
    assessment_id: &str,
    name: &str,
) -> Result<bool, RubricError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM criteria WHERE assessment_id = ? AND name = ?",
            (assessment_id, name),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn level_criterion_id(conn: &Connection, level_id: &str) -> Result<String, RubricError> {
    conn.query_row(
        "SELECT criterion_id FROM levels WHERE id = ?",
        [level_id],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| RubricError::LevelNotFound(level_id.to_string()))
}

fn insert_criterion(
    tx: &Transaction,
    assessment_id: &str,
    name: &str,
    max_mark: f64,
    bonus: bool,
) -> Result<String, RubricError> {
    let kind: Option<String> = tx
        .query_row(
            "SELECT kind FROM assessments WHERE id = ?",
            [assessment_id],
            |r| r.get(0),
        )
        .optional()?;
    match kind.as_deref() {
        Some("assignment") => {}
        _ => return Err(RubricError::CriterionNotFound(format!("assignment {assessment_id}"))),
    }
    if criterion_name_taken(tx, assessment_id, name)? {
        return Err(RubricError::DuplicateCriterionName(name.to_string()));
    }

    let position: i64 = tx.query_row(
        "SELECT COALESCE(MAX(position), 0) + 1 FROM criteria WHERE assessment_id = ?",
        [assessment_id],
        |r| r.get(0),
    )?;
    let criterion_id = new_id();
    tx.execute(
        "INSERT INTO criteria(id, assessment_id, name, max_mark, position, bonus)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&criterion_id, assessment_id, name, max_mark, position, bonus as i64),
    )?;

    // Existing results get an empty mark for the new criterion.
    let mut stmt = tx.prepare(
        "SELECT r.id FROM results r
         JOIN groupings g ON g.id = r.grouping_id
         WHERE g.assessment_id = ?",
    )?;
    let result_ids = stmt
        .query_map([assessment_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for result_id in result_ids {
        tx.execute(
            "INSERT INTO marks(id, result_id, criterion_id, mark) VALUES(?, ?, ?, NULL)",
            (new_id(), &result_id, &criterion_id),
        )?;
    }
    Ok(criterion_id)
}

fn insert_level(tx: &Transaction, criterion_id: &str, level: &Level) -> Result<(), RubricError> {
    tx.execute(
        "INSERT INTO levels(id, criterion_id, name, description, mark, mark_overridden)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &level.id,
            criterion_id,
            &level.name,
            &level.description,
            level.mark,
            level.mark_overridden as i64,
        ),
    )?;
    Ok(())
}

fn apply_plan(tx: &Transaction, criterion_id: &str, plan: &LevelBatchPlan) -> Result<(), RubricError> {
    for level in &plan.deleted {
        tx.execute("DELETE FROM levels WHERE id = ?", [&level.id])?;
    }
    for level in plan.levels.iter().filter(|l| plan.updated.contains(&l.id)) {
        tx.execute(
            "UPDATE levels SET name = ?, description = ?, mark = ?, mark_overridden = ? WHERE id = ?",
            (
                &level.name,
                &level.description,
                level.mark,
                level.mark_overridden as i64,
                &level.id,
            ),
        )?;
    }
    for level in plan.levels.iter().filter(|l| plan.created.contains(&l.id)) {
        insert_level(tx, criterion_id, level)?;
    }

    if plan.mark_changes.is_empty() && plan.deleted.is_empty() {
        return Ok(());
    }
    let mut stmt =
        tx.prepare("SELECT id, mark FROM marks WHERE criterion_id = ? AND mark IS NOT NULL")?;
    let marks = stmt
        .query_map([criterion_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut touched = 0usize;
    for (mark_id, value) in marks {
        match plan.remap(value) {
            MarkRemap::Keep => continue,
            MarkRemap::Set(v) => {
                tx.execute("UPDATE marks SET mark = ? WHERE id = ?", (v, &mark_id))?;
            }
            MarkRemap::Clear => {
                tx.execute("UPDATE marks SET mark = NULL WHERE id = ?", [&mark_id])?;
            }
        }
        touched += 1;
    }
    if touched > 0 {
        tracing::debug!(criterion_id, touched, "marks remapped after level changes");
    }
    Ok(())
}
