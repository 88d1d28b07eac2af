use anyhow::Context;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub idx: usize,
    pub header: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentRow {
    pub id: String,
    pub sort_order: i64,
    pub fields: Vec<String>,
    pub total_score: f64,
    pub average_score: f64,
    pub graded_count: i64,
    pub computed_at: Option<String>,
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("create workspace dir {}", workspace.display()))?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("open {}", db_path.display()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS columns(
            idx INTEGER PRIMARY KEY,
            header TEXT NOT NULL,
            key TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            sort_order INTEGER NOT NULL,
            total_score REAL NOT NULL DEFAULT 0,
            average_score REAL NOT NULL DEFAULT 0,
            graded_count INTEGER NOT NULL DEFAULT 0,
            computed_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_sort ON students(sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_fields(
            student_id TEXT NOT NULL,
            col_idx INTEGER NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY(student_id, col_idx),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(col_idx) REFERENCES columns(idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_fields_col ON student_fields(col_idx)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

/// Storage key for an import header: every non-word character becomes `_`,
/// then surrounding underscores are trimmed. Headers with nothing left get a
/// positional key.
pub fn column_key(header: &str, idx: usize) -> String {
    let replaced: String = header
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    let key = replaced.trim_matches('_');
    if key.is_empty() {
        format!("col{}", idx + 1)
    } else {
        key.to_string()
    }
}

/// Pads with empty strings or truncates so there is exactly one value per
/// column.
pub fn fit_to_columns<S: AsRef<str>>(values: &[S], column_count: usize) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .take(column_count)
        .map(|v| v.as_ref().to_string())
        .collect();
    out.resize(column_count, String::new());
    out
}

pub fn schema_get(conn: &Connection) -> anyhow::Result<Vec<ColumnDef>> {
    let mut stmt = conn.prepare("SELECT idx, header, key FROM columns ORDER BY idx")?;
    let cols = stmt
        .query_map([], |row| {
            let idx: i64 = row.get(0)?;
            Ok(ColumnDef {
                idx: idx as usize,
                header: row.get(1)?,
                key: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(cols)
}

pub fn schema_set(conn: &Connection, headers: &[String]) -> anyhow::Result<Vec<ColumnDef>> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM columns", [], |r| r.get(0))?;
    if existing > 0 {
        anyhow::bail!("column schema already defined");
    }

    let cols: Vec<ColumnDef> = headers
        .iter()
        .enumerate()
        .map(|(idx, h)| ColumnDef {
            idx,
            header: h.trim().to_string(),
            key: column_key(h.trim(), idx),
        })
        .collect();

    let mut seen: HashMap<&str, usize> = HashMap::new();
    for c in &cols {
        if let Some(prev) = seen.insert(c.key.as_str(), c.idx) {
            anyhow::bail!(
                "duplicate column key {:?} (columns {} and {})",
                c.key,
                prev + 1,
                c.idx + 1
            );
        }
    }

    for c in &cols {
        conn.execute(
            "INSERT INTO columns(idx, header, key) VALUES(?, ?, ?)",
            (c.idx as i64, &c.header, &c.key),
        )?;
    }
    Ok(cols)
}

pub fn students_count(conn: &Connection) -> anyhow::Result<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))?)
}

/// Lists records in insertion order. A non-empty `query` keeps only records
/// where one of `search_cols` contains it (SQL LIKE); with no search columns
/// every column is searched.
pub fn students_list(
    conn: &Connection,
    column_count: usize,
    query: Option<&str>,
    search_cols: &[usize],
) -> anyhow::Result<Vec<StudentRow>> {
    let query = query.map(str::trim).filter(|q| !q.is_empty());

    let mut sql = String::from(
        "SELECT s.id, s.sort_order, s.total_score, s.average_score, s.graded_count, s.computed_at
         FROM students s",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(q) = query {
        sql.push_str(
            " WHERE EXISTS (
                SELECT 1 FROM student_fields f
                WHERE f.student_id = s.id AND f.value LIKE ?",
        );
        if !search_cols.is_empty() {
            let list = search_cols
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND f.col_idx IN ({})", list));
        }
        sql.push(')');
        binds.push(format!("%{}%", q));
    }
    sql.push_str(" ORDER BY s.sort_order");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(params_from_iter(binds.iter()), |row| {
            Ok(StudentRow {
                id: row.get(0)?,
                sort_order: row.get(1)?,
                fields: Vec::new(),
                total_score: row.get(2)?,
                average_score: row.get(3)?,
                graded_count: row.get(4)?,
                computed_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut fields = load_all_fields(conn, column_count)?;
    for r in rows.iter_mut() {
        r.fields = fields
            .remove(&r.id)
            .unwrap_or_else(|| vec![String::new(); column_count]);
    }
    Ok(rows)
}

fn load_all_fields(
    conn: &Connection,
    column_count: usize,
) -> anyhow::Result<HashMap<String, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT student_id, col_idx, value FROM student_fields")?;
    let mut rows = stmt.query([])?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    while let Some(row) = rows.next()? {
        let sid: String = row.get(0)?;
        let idx: i64 = row.get(1)?;
        let value: String = row.get(2)?;
        let idx = idx as usize;
        if idx >= column_count {
            continue;
        }
        out.entry(sid)
            .or_insert_with(|| vec![String::new(); column_count])[idx] = value;
    }
    Ok(out)
}

pub fn student_get(
    conn: &Connection,
    column_count: usize,
    student_id: &str,
) -> anyhow::Result<Option<StudentRow>> {
    let row = conn
        .query_row(
            "SELECT id, sort_order, total_score, average_score, graded_count, computed_at
             FROM students WHERE id = ?",
            [student_id],
            |row| {
                Ok(StudentRow {
                    id: row.get(0)?,
                    sort_order: row.get(1)?,
                    fields: Vec::new(),
                    total_score: row.get(2)?,
                    average_score: row.get(3)?,
                    graded_count: row.get(4)?,
                    computed_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    let Some(mut row) = row else {
        return Ok(None);
    };

    let mut fields = vec![String::new(); column_count];
    let mut stmt =
        conn.prepare("SELECT col_idx, value FROM student_fields WHERE student_id = ?")?;
    let mut rows = stmt.query([student_id])?;
    while let Some(r) = rows.next()? {
        let idx: i64 = r.get(0)?;
        if let Some(slot) = fields.get_mut(idx as usize) {
            *slot = r.get(1)?;
        }
    }
    row.fields = fields;
    Ok(Some(row))
}

pub fn student_insert<S: AsRef<str>>(
    conn: &Connection,
    column_count: usize,
    values: &[S],
) -> anyhow::Result<String> {
    let values = fit_to_columns(values, column_count);
    let sort_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students",
        [],
        |r| r.get(0),
    )?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, sort_order, updated_at)
         VALUES(?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&student_id, sort_order),
    )?;
    let mut stmt =
        conn.prepare("INSERT INTO student_fields(student_id, col_idx, value) VALUES(?, ?, ?)")?;
    for (idx, v) in values.iter().enumerate() {
        stmt.execute((&student_id, idx as i64, v))?;
    }
    Ok(student_id)
}

/// Replaces every field of an existing record. Derived totals are left as
/// they were. Returns false when the record does not exist.
pub fn student_update<S: AsRef<str>>(
    conn: &Connection,
    column_count: usize,
    student_id: &str,
    values: &[S],
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE students SET updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?",
        [student_id],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    let values = fit_to_columns(values, column_count);
    let mut stmt = conn.prepare(
        "INSERT INTO student_fields(student_id, col_idx, value) VALUES(?, ?, ?)
         ON CONFLICT(student_id, col_idx) DO UPDATE SET value = excluded.value",
    )?;
    for (idx, v) in values.iter().enumerate() {
        stmt.execute((student_id, idx as i64, v))?;
    }
    Ok(true)
}

pub fn students_delete(conn: &Connection, student_ids: &[String]) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut deleted = 0usize;
    for sid in student_ids {
        tx.execute("DELETE FROM student_fields WHERE student_id = ?", [sid])?;
        deleted += tx.execute("DELETE FROM students WHERE id = ?", [sid])?;
    }
    tx.commit()?;
    Ok(deleted)
}

pub fn student_set_derived(
    conn: &Connection,
    student_id: &str,
    total_score: f64,
    average_score: f64,
    graded_count: usize,
    computed_at: &str,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE students
         SET total_score = ?, average_score = ?, graded_count = ?, computed_at = ?
         WHERE id = ?",
        (
            total_score,
            average_score,
            graded_count as i64,
            computed_at,
            student_id,
        ),
    )?;
    Ok(())
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
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("settings[{key}] is not JSON"))?,
        )),
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
        (key, value.to_string()),
    )?;
    Ok(())
}
