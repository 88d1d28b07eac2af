use crate::config::{self, ScoringConfig};
use crate::ipc::error::{anyhow_err, HandlerErr};
use crate::ipc::types::Request;
use rusqlite::Connection;
use serde_json::json;

pub fn scoring_config(conn: &Connection) -> Result<ScoringConfig, HandlerErr> {
    config::load_scoring_config(conn).map_err(|e| anyhow_err("bad_config", e))
}

pub fn str_param<'a>(req: &'a Request, name: &str) -> Result<&'a str, HandlerErr> {
    req.params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing params.{}", name)))
}

pub fn bool_param(req: &Request, name: &str, default: bool) -> bool {
    req.params
        .get(name)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

/// A list of strings; numbers and nulls are accepted and read as text so a
/// UI can send cells as it holds them.
pub fn string_list_param(req: &Request, name: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(items) = req.params.get(name).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new(
            "bad_params",
            format!("missing/invalid params.{}", name),
        ));
    };
    items
        .iter()
        .enumerate()
        .map(|(i, v)| match v {
            serde_json::Value::String(s) => Ok(s.clone()),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            serde_json::Value::Null => Ok(String::new()),
            _ => Err(HandlerErr::new(
                "bad_params",
                format!("params.{}[{}] must be a string", name, i),
            )
            .with_details(json!({ "index": i }))),
        })
        .collect()
}
