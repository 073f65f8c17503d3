use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("markus.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            id_number TEXT,
            user_name TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            hidden INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            short_identifier TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS criteria(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_mark REAL NOT NULL,
            position INTEGER NOT NULL,
            bonus INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(assessment_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criteria_assessment ON criteria(assessment_id)",
        [],
    )?;

    // Level name/mark uniqueness is checked per batch in rubric::plan_level_batch.
    // A table constraint would reject intermediate states of a swap.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS levels(
            id TEXT PRIMARY KEY,
            criterion_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            mark REAL NOT NULL,
            FOREIGN KEY(criterion_id) REFERENCES criteria(id)
        )",
        [],
    )?;
    ensure_levels_mark_overridden(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_levels_criterion ON levels(criterion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groupings(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assessment_id, student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            grouping_id TEXT NOT NULL,
            released_to_students INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grouping_id) REFERENCES groupings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_grouping ON results(grouping_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            result_id TEXT NOT NULL,
            criterion_id TEXT NOT NULL,
            mark REAL,
            FOREIGN KEY(result_id) REFERENCES results(id),
            FOREIGN KEY(criterion_id) REFERENCES criteria(id),
            UNIQUE(result_id, criterion_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_criterion ON marks(criterion_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entry_items(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            name TEXT NOT NULL,
            out_of REAL NOT NULL,
            bonus INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(assessment_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_entry_students(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            total_grade REAL,
            released_to_student INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assessment_id, student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_schemes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_weights(
            id TEXT PRIMARY KEY,
            marking_scheme_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            weight REAL,
            FOREIGN KEY(marking_scheme_id) REFERENCES marking_schemes(id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(marking_scheme_id, assessment_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extensions(
            id TEXT PRIMARY KEY,
            grouping_id TEXT NOT NULL UNIQUE,
            time_delta INTEGER NOT NULL,
            note TEXT,
            apply_penalty INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(grouping_id) REFERENCES groupings(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submission_files(
            id TEXT PRIMARY KEY,
            grouping_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            mime_type TEXT,
            content BLOB NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grouping_id) REFERENCES groupings(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submission_files_grouping ON submission_files(grouping_id)",
        [],
    )?;

    Ok(())
}

// Workspaces created before per-level override tracking existed treat every
// level as scalable.
fn ensure_levels_mark_overridden(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "levels", "mark_overridden")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE levels ADD COLUMN mark_overridden INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
