use crate::calc;
use crate::ipc::error::{anyhow_err, respond, HandlerErr};
use crate::ipc::helpers::{scoring_config, str_param, string_list_param};
use crate::ipc::types::{AppState, Request};
use crate::score;
use serde_json::json;

fn recompute(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let cfg = scoring_config(conn)?;
    let summary = calc::recompute_all(conn, &cfg).map_err(|e| anyhow_err("db_update_failed", e))?;
    Ok(json!(summary))
}

/// Aggregates a row the caller holds without touching the store, so an edit
/// form can show what the next recompute would produce.
fn preview(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let cfg = scoring_config(conn)?;
    let values = string_list_param(req, "values")?;

    let agg = calc::aggregate(&values, &cfg.layout, &cfg.lexicon);
    let scores: Vec<serde_json::Value> = cfg
        .layout
        .score_indices(values.len())
        .into_iter()
        .map(|idx| {
            let raw = &values[idx];
            json!({
                "idx": idx,
                "raw": raw,
                "score": score::normalize(raw, &cfg.lexicon),
                "graded": score::is_graded(raw),
            })
        })
        .collect();

    Ok(json!({
        "total": agg.total,
        "average": agg.average,
        "gradedCount": agg.graded_count,
        "scores": scores,
    }))
}

fn normalize(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let cfg = scoring_config(conn)?;
    let raw = str_param(req, "raw")?;
    Ok(json!({ "score": score::normalize(raw, &cfg.lexicon) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "stats.recompute" => recompute(state, req),
        "stats.preview" => preview(state, req),
        "scores.normalize" => normalize(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
