use crate::calc::ScoreLayout;
use crate::db;
use crate::score::GradeLexicon;
use anyhow::Context;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;

pub const ENV_WORKSPACE: &str = "GRADEBOOKD_WORKSPACE";
pub const ENV_LOG: &str = "GRADEBOOKD_LOG";

pub const SETTING_LEXICON: &str = "scoring.lexicon";
pub const SETTING_LAYOUT: &str = "scoring.layout";

/// Process-level settings, read once at start-up.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        let workspace = std::env::var_os(ENV_WORKSPACE)
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty());
        let log_filter = std::env::var(ENV_LOG)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "info".to_string());
        Self {
            workspace,
            log_filter,
        }
    }
}

/// Per-workspace scoring rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringConfig {
    pub lexicon: GradeLexicon,
    pub layout: ScoreLayout,
}

pub fn load_scoring_config(conn: &Connection) -> anyhow::Result<ScoringConfig> {
    let lexicon = match db::settings_get_json(conn, SETTING_LEXICON)? {
        Some(v) => parse_lexicon(&v).context(SETTING_LEXICON)?,
        None => GradeLexicon::default(),
    };
    let layout = match db::settings_get_json(conn, SETTING_LAYOUT)? {
        Some(v) => parse_layout(&v).context(SETTING_LAYOUT)?,
        None => ScoreLayout::default(),
    };
    Ok(ScoringConfig { lexicon, layout })
}

pub fn save_lexicon(conn: &Connection, raw: &serde_json::Value) -> anyhow::Result<()> {
    parse_lexicon(raw)?;
    db::settings_set_json(conn, SETTING_LEXICON, raw)
}

pub fn save_layout(conn: &Connection, layout: &ScoreLayout) -> anyhow::Result<()> {
    db::settings_set_json(conn, SETTING_LAYOUT, &layout_json(layout))
}

/// Accepts a preset name ("zh", "en") or an ordered `[[label, score], ...]`
/// list.
pub fn parse_lexicon(v: &serde_json::Value) -> anyhow::Result<GradeLexicon> {
    if let Some(name) = v.as_str() {
        return GradeLexicon::preset(name)
            .with_context(|| format!("unknown lexicon preset {:?}", name));
    }
    let Some(items) = v.as_array() else {
        anyhow::bail!("lexicon must be a preset name or a list of [label, score] pairs");
    };

    let mut entries: Vec<(String, f64)> = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let pair = item.as_array().filter(|a| a.len() == 2);
        let label = pair.and_then(|a| a[0].as_str());
        let score = pair.and_then(|a| a[1].as_f64());
        match (label, score) {
            (Some(l), Some(s)) if !l.is_empty() && s.is_finite() && s >= 0.0 => {
                entries.push((l.to_string(), s));
            }
            _ => anyhow::bail!("lexicon entry {} must be [non-empty label, score >= 0]", i),
        }
    }
    Ok(GradeLexicon::new(entries))
}

pub fn parse_layout(v: &serde_json::Value) -> anyhow::Result<ScoreLayout> {
    let mut layout = ScoreLayout::default();
    if let Some(n) = v.get("identityColumns").filter(|n| !n.is_null()) {
        let Some(n) = n.as_u64() else {
            anyhow::bail!("identityColumns must be a non-negative integer");
        };
        layout.identity_columns = n as usize;
    }
    if let Some(cols) = v.get("scoreColumns").filter(|c| !c.is_null()) {
        let Some(items) = cols.as_array() else {
            anyhow::bail!("scoreColumns must be a list of column indices or null");
        };
        let mut out: Vec<usize> = Vec::with_capacity(items.len());
        for c in items {
            let Some(idx) = c.as_u64() else {
                anyhow::bail!("scoreColumns entries must be non-negative integers");
            };
            let idx = idx as usize;
            if out.contains(&idx) {
                anyhow::bail!("scoreColumns lists column {} more than once", idx);
            }
            out.push(idx);
        }
        layout.score_columns = Some(out);
    }
    Ok(layout)
}

pub fn lexicon_json(lexicon: &GradeLexicon) -> serde_json::Value {
    json!(lexicon
        .entries()
        .iter()
        .map(|(label, score)| json!([label, score]))
        .collect::<Vec<_>>())
}

pub fn layout_json(layout: &ScoreLayout) -> serde_json::Value {
    json!({
        "identityColumns": layout.identity_columns,
        "scoreColumns": layout.score_columns,
    })
}
