use crate::calc::{self, SortKey};
use crate::db::{self, ColumnDef, StudentRow};
use crate::import;
use crate::ipc::error::{anyhow_err, respond, HandlerErr};
use crate::ipc::helpers::{bool_param, scoring_config, str_param, string_list_param};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn student_json(row: &StudentRow, columns: &[ColumnDef]) -> serde_json::Value {
    let mut values = serde_json::Map::new();
    for (c, v) in columns.iter().zip(row.fields.iter()) {
        values.insert(c.key.clone(), json!(v));
    }
    json!({
        "id": row.id,
        "sortOrder": row.sort_order,
        "values": values,
        "fields": row.fields,
        "totalScore": row.total_score,
        "averageScore": row.average_score,
        "gradedCount": row.graded_count,
        "computedAt": row.computed_at,
    })
}

fn require_schema(conn: &rusqlite::Connection) -> Result<Vec<ColumnDef>, HandlerErr> {
    let columns = db::schema_get(conn).map_err(|e| anyhow_err("db_query_failed", e))?;
    if columns.is_empty() {
        return Err(HandlerErr::new(
            "no_schema",
            "no columns defined; import a CSV file first",
        ));
    }
    Ok(columns)
}

fn parse_sort_key(raw: &str, columns: &[ColumnDef]) -> Result<SortKey, HandlerErr> {
    match raw {
        "totalScore" => Ok(SortKey::TotalScore),
        "averageScore" => Ok(SortKey::AverageScore),
        key => columns
            .iter()
            .find(|c| c.key == key)
            .map(|c| SortKey::Column(c.idx))
            .ok_or_else(|| {
                HandlerErr::new("bad_params", format!("unknown sortBy column: {}", key))
                    .with_details(json!({ "sortBy": key }))
            }),
    }
}

fn import_csv(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let path = PathBuf::from(str_param(req, "path")?);
    let only_if_empty = bool_param(req, "onlyIfEmpty", true);

    match import::import_csv(conn, &path, only_if_empty) {
        Ok(summary) => Ok(json!(summary)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "csv import failed");
            let details = match &e {
                import::ImportError::SchemaMismatch { expected, found } => {
                    Some(json!({ "expected": expected, "found": found }))
                }
                _ => None,
            };
            Err(HandlerErr {
                code: e.code(),
                message: e.to_string(),
                details,
            })
        }
    }
}

fn list(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let columns = db::schema_get(conn).map_err(|e| anyhow_err("db_query_failed", e))?;
    let cfg = scoring_config(conn)?;

    let query = req.params.get("query").and_then(|v| v.as_str());
    let search_cols = cfg.layout.identity_indices(columns.len());
    let mut rows = db::students_list(conn, columns.len(), query, &search_cols)
        .map_err(|e| anyhow_err("db_query_failed", e))?;

    if let Some(sort_by) = req.params.get("sortBy").and_then(|v| v.as_str()) {
        let key = parse_sort_key(sort_by, &columns)?;
        let descending = bool_param(req, "descending", false);
        calc::sort_rows(&mut rows, key, descending);
    }

    let students: Vec<serde_json::Value> =
        rows.iter().map(|r| student_json(r, &columns)).collect();
    Ok(json!({ "students": students }))
}

fn get(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let student_id = str_param(req, "studentId")?;
    let columns = db::schema_get(conn).map_err(|e| anyhow_err("db_query_failed", e))?;
    let row = db::student_get(conn, columns.len(), student_id)
        .map_err(|e| anyhow_err("db_query_failed", e))?
        .ok_or_else(|| {
            HandlerErr::new("not_found", "student not found")
                .with_details(json!({ "studentId": student_id }))
        })?;
    Ok(json!({ "student": student_json(&row, &columns) }))
}

fn create(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let columns = require_schema(conn)?;
    let values = string_list_param(req, "values")?;
    if values.iter().all(|v| v.trim().is_empty()) {
        return Err(HandlerErr::new("bad_params", "values must not all be empty"));
    }

    let student_id = db::student_insert(conn, columns.len(), &values)
        .map_err(|e| anyhow_err("db_insert_failed", e))?;
    tracing::debug!(student_id = %student_id, "student created");
    Ok(json!({ "studentId": student_id }))
}

fn update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let columns = require_schema(conn)?;
    let student_id = str_param(req, "studentId")?;
    let values = string_list_param(req, "values")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| anyhow_err("db_tx_failed", e.into()))?;
    let found = db::student_update(&tx, columns.len(), student_id, &values)
        .map_err(|e| anyhow_err("db_update_failed", e))?;
    if !found {
        return Err(HandlerErr::new("not_found", "student not found")
            .with_details(json!({ "studentId": student_id })));
    }
    tx.commit().map_err(|e| anyhow_err("db_tx_failed", e.into()))?;
    Ok(json!({ "ok": true }))
}

fn delete(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let ids = string_list_param(req, "studentIds")?;
    if ids.is_empty() {
        return Err(HandlerErr::new("bad_params", "studentIds must not be empty"));
    }
    let deleted =
        db::students_delete(conn, &ids).map_err(|e| anyhow_err("db_delete_failed", e))?;
    tracing::info!(requested = ids.len(), deleted, "students deleted");
    Ok(json!({ "deleted": deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.importCsv" => import_csv(state, req),
        "students.list" => list(state, req),
        "students.get" => get(state, req),
        "students.create" => create(state, req),
        "students.update" => update(state, req),
        "students.delete" => delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
