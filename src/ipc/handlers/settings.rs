use crate::config::{self, ScoringConfig};
use crate::ipc::error::{anyhow_err, respond, HandlerErr};
use crate::ipc::helpers::scoring_config;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn settings_json(cfg: &ScoringConfig) -> serde_json::Value {
    json!({
        "lexicon": config::lexicon_json(&cfg.lexicon),
        "identityColumns": cfg.layout.identity_columns,
        "scoreColumns": cfg.layout.score_columns,
    })
}

fn get(state: &mut AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    Ok(settings_json(&scoring_config(conn)?))
}

/// Fields left out of the request keep their stored values. An explicit
/// `scoreColumns: null` goes back to "every column after the identity ones".
fn update(state: &mut AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = state.conn()?;
    let mut layout = scoring_config(conn)?.layout;

    if let Some(lexicon) = req.params.get("lexicon") {
        config::parse_lexicon(lexicon).map_err(|e| anyhow_err("bad_params", e))?;
    }
    let has_layout_change =
        req.params.get("identityColumns").is_some() || req.params.get("scoreColumns").is_some();
    if has_layout_change {
        let mut patch = config::layout_json(&layout);
        if let Some(n) = req.params.get("identityColumns") {
            patch["identityColumns"] = n.clone();
        }
        if let Some(cols) = req.params.get("scoreColumns") {
            patch["scoreColumns"] = cols.clone();
        }
        layout = config::parse_layout(&patch).map_err(|e| anyhow_err("bad_params", e))?;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| anyhow_err("db_tx_failed", e.into()))?;
    if let Some(lexicon) = req.params.get("lexicon") {
        config::save_lexicon(&tx, lexicon).map_err(|e| anyhow_err("db_update_failed", e))?;
    }
    if has_layout_change {
        config::save_layout(&tx, &layout).map_err(|e| anyhow_err("db_update_failed", e))?;
    }
    tx.commit().map_err(|e| anyhow_err("db_tx_failed", e.into()))?;

    let cfg = scoring_config(conn)?;
    tracing::info!(
        lexicon_entries = cfg.lexicon.entries().len(),
        identity_columns = cfg.layout.identity_columns,
        "scoring settings updated"
    );
    Ok(settings_json(&cfg))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "settings.get" => get(state, req),
        "settings.update" => update(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
