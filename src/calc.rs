use crate::config::ScoringConfig;
use crate::db;
use crate::score::{is_graded, normalize, GradeLexicon};
use rusqlite::Connection;
use serde::Serialize;

/// The leading `identity_columns` are never scored. `score_columns`, when
/// set, restricts scoring to those indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreLayout {
    pub identity_columns: usize,
    pub score_columns: Option<Vec<usize>>,
}

impl Default for ScoreLayout {
    fn default() -> Self {
        Self {
            identity_columns: 2,
            score_columns: None,
        }
    }
}

impl ScoreLayout {
    pub fn score_indices(&self, column_count: usize) -> Vec<usize> {
        match &self.score_columns {
            Some(cols) => {
                let mut out: Vec<usize> = Vec::with_capacity(cols.len());
                for &c in cols {
                    if c >= self.identity_columns && c < column_count && !out.contains(&c) {
                        out.push(c);
                    }
                }
                out
            }
            None => (self.identity_columns.min(column_count)..column_count).collect(),
        }
    }

    pub fn identity_indices(&self, column_count: usize) -> Vec<usize> {
        (0..self.identity_columns.min(column_count)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub total: f64,
    pub average: f64,
    pub graded_count: usize,
}

/// Rounds half away from zero to two decimals.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// "0" and failing labels count as graded; blank cells do not. Only the
// average is rounded.
pub fn aggregate<S: AsRef<str>>(
    fields: &[S],
    layout: &ScoreLayout,
    lexicon: &GradeLexicon,
) -> Aggregate {
    let mut total = 0.0;
    let mut graded_count: usize = 0;

    for idx in layout.score_indices(fields.len()) {
        let raw = fields[idx].as_ref();
        if !is_graded(raw) {
            continue;
        }
        total += normalize(raw, lexicon);
        graded_count += 1;
    }

    let average = if graded_count > 0 {
        round_off_2_decimals(total / graded_count as f64)
    } else {
        0.0
    };

    Aggregate {
        total,
        average,
        graded_count,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub students: usize,
    pub graded_fields: usize,
}

/// Recomputes and overwrites the derived totals of every stored record.
pub fn recompute_all(
    conn: &Connection,
    config: &ScoringConfig,
) -> anyhow::Result<RecomputeSummary> {
    let columns = db::schema_get(conn)?;
    let rows = db::students_list(conn, columns.len(), None, &[])?;
    let computed_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let tx = conn.unchecked_transaction()?;
    let mut graded_fields = 0usize;
    for row in &rows {
        let agg = aggregate(&row.fields, &config.layout, &config.lexicon);
        graded_fields += agg.graded_count;
        db::student_set_derived(
            &tx,
            &row.id,
            agg.total,
            agg.average,
            agg.graded_count,
            &computed_at,
        )?;
    }
    tx.commit()?;

    tracing::info!(
        students = rows.len(),
        graded_fields,
        "recomputed student totals"
    );
    Ok(RecomputeSummary {
        students: rows.len(),
        graded_fields,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Column(usize),
    TotalScore,
    AverageScore,
}

fn sort_number(cell: &str) -> Option<f64> {
    cell.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric (blanks as -1) when every non-blank cell reads as a finite
/// number, text otherwise. Stable.
pub fn sort_rows(rows: &mut [db::StudentRow], key: SortKey, descending: bool) {
    let cell = |r: &db::StudentRow| -> String {
        match key {
            SortKey::Column(idx) => r.fields.get(idx).cloned().unwrap_or_default(),
            SortKey::TotalScore => r.total_score.to_string(),
            SortKey::AverageScore => r.average_score.to_string(),
        }
    };

    let numeric = rows.iter().all(|r| {
        let v = cell(r);
        let t = v.trim();
        t.is_empty() || sort_number(t).is_some()
    });

    if numeric {
        let num = |r: &db::StudentRow| -> f64 {
            let v = cell(r);
            let t = v.trim();
            sort_number(t).unwrap_or(-1.0)
        };
        rows.sort_by(|a, b| {
            let ord = num(a).total_cmp(&num(b));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
    } else {
        rows.sort_by(|a, b| {
            let ord = cell(a).cmp(&cell(b));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
    }
}
