use crate::db;
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: bool,
    pub blank_rows: usize,
    pub schema_created: bool,
    pub columns: Vec<db::ColumnDef>,
}

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("file has no header row")]
    EmptyFile,
    #[error("header does not match workspace columns (expected {expected:?}, found {found:?})")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::EmptyFile => "empty_file",
            ImportError::SchemaMismatch { .. } => "schema_mismatch",
            ImportError::Csv(_) => "bad_csv",
            ImportError::Db(_) | ImportError::Other(_) => "import_failed",
        }
    }
}

/// Reads a CSV file whose first row names the columns.
///
/// The first import fixes the workspace column schema; later imports must
/// carry the same header. With `only_if_empty`, a workspace that already has
/// records is left untouched.
pub fn import_csv(
    conn: &Connection,
    path: &Path,
    only_if_empty: bool,
) -> Result<ImportSummary, ImportError> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut records = rdr.records();
    let headers: Vec<String> = match records.next() {
        Some(rec) => {
            let rec = rec?;
            rec.iter()
                .enumerate()
                .map(|(i, h)| {
                    let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
                    h.trim().to_string()
                })
                .collect()
        }
        None => return Err(ImportError::EmptyFile),
    };
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::EmptyFile);
    }

    let tx = conn.unchecked_transaction()?;
    let existing = db::schema_get(&tx)?;
    let (columns, schema_created) = if existing.is_empty() {
        (db::schema_set(&tx, &headers)?, true)
    } else {
        let expected: Vec<String> = existing.iter().map(|c| c.key.clone()).collect();
        let found: Vec<String> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| db::column_key(h, i))
            .collect();
        if expected != found {
            return Err(ImportError::SchemaMismatch { expected, found });
        }
        (existing, false)
    };

    if only_if_empty && db::students_count(&tx)? > 0 {
        tx.commit()?;
        tracing::info!(path = %path.display(), "workspace already has records; import skipped");
        return Ok(ImportSummary {
            imported: 0,
            skipped: true,
            blank_rows: 0,
            schema_created,
            columns,
        });
    }

    let mut imported = 0usize;
    let mut blank_rows = 0usize;
    for rec in records {
        let rec = rec?;
        if rec.iter().all(|v| v.trim().is_empty()) {
            blank_rows += 1;
            continue;
        }
        let values: Vec<&str> = rec.iter().collect();
        db::student_insert(&tx, columns.len(), &values)?;
        imported += 1;
    }
    tx.commit()?;

    tracing::info!(
        path = %path.display(),
        imported,
        blank_rows,
        schema_created,
        "csv import finished"
    );
    Ok(ImportSummary {
        imported,
        skipped: false,
        blank_rows,
        schema_created,
        columns,
    })
}
