use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "rapor.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            npsn TEXT,
            nss TEXT,
            address TEXT,
            village TEXT,
            district TEXT,
            city TEXT,
            province TEXT,
            postal_code TEXT,
            phone TEXT,
            email TEXT,
            website TEXT,
            principal_name TEXT,
            principal_nip TEXT
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schools(id, name) VALUES('default', '')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phase TEXT,
            grade_level INTEGER,
            semester INTEGER NOT NULL DEFAULT 1,
            academic_year TEXT,
            homeroom_name TEXT,
            homeroom_nip TEXT,
            report_place TEXT,
            report_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            nis TEXT,
            nisn TEXT,
            name TEXT NOT NULL,
            gender TEXT,
            birth_place TEXT,
            birth_date TEXT,
            religion TEXT,
            address TEXT,
            father_name TEXT,
            father_job TEXT,
            mother_name TEXT,
            mother_job TEXT,
            guardian_name TEXT,
            guardian_job TEXT,
            parent_address TEXT,
            admission_date TEXT,
            admitted_class TEXT,
            previous_school TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_column(&conn, "students", "guardian_address", "TEXT")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            short_name TEXT,
            subject_group TEXT NOT NULL DEFAULT 'wajib',
            kktp REAL,
            sas_weight REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS objectives(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            weight REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_objectives_subject ON objectives(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS objective_scores(
            objective_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(objective_id, student_id),
            FOREIGN KEY(objective_id) REFERENCES objectives(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_objective_scores_student ON objective_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sas_scores(
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT,
            PRIMARY KEY(subject_id, student_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sas_scores_student ON sas_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_extras(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            sick INTEGER NOT NULL DEFAULT 0,
            permitted INTEGER NOT NULL DEFAULT 0,
            absent INTEGER NOT NULL DEFAULT 0,
            homeroom_note TEXT NOT NULL DEFAULT '',
            promotion TEXT,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    Ok(conn)
}

/// Read-only handle for worker threads. The schema must already exist.
pub fn open_db_readonly(db_file: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open_with_flags(
        db_file,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

// Older workspaces predate some columns; add them in place.
fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
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
