//! Shrinks a [`ChatResponse`] to fit a narration prompt.
//!
//! Truncation is deterministic: the same response always produces the same
//! payload.

use serde::Serialize;
use serde_json::Value;

use crate::orchestrator::{ChatResponse, QueryFailure};
use crate::warehouse::Row;

pub const MAX_ROWS: usize = 100;
/// Rows kept with (budgeted) full width; later rows keep [`NARROW_ROW_FIELDS`].
pub const DETAILED_ROWS: usize = 50;
pub const WIDE_ROW_BYTES: usize = 1000;
pub const WIDE_ROW_BUDGET: usize = 500;
pub const NARROW_ROW_FIELDS: usize = 5;
pub const MAX_EXPLANATION_CHARS: usize = 10_000;
/// Prompt size, in estimated tokens, that triggers the aggressive pass.
pub const TOKEN_LIMIT: usize = 120_000;
pub const AGGRESSIVE_EXPLANATION_CHARS: usize = 2_000;
pub const AGGRESSIVE_ROWS: usize = 20;
/// Field appended to a wide row in place of the fields that did not fit.
pub const TRUNCATED_FIELD: &str = "_truncated";

/// What the narration backend actually sees.
#[derive(Debug, Clone, Serialize)]
pub struct NarrationPayload {
    pub question: String,
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub total_rows: usize,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryFailure>,
}

impl NarrationPayload {
    pub fn render(&self) -> String {
        let json = serde_json::to_string_pretty(self).unwrap_or_default();
        format!("Explain the following query result.\n\n{json}")
    }

    /// `chars / 4` of the rendered user message.
    pub fn estimated_tokens(&self) -> usize {
        self.render().chars().count() / 4
    }

    fn record_drop(&mut self) {
        let dropped = self.total_rows - self.rows.len();
        self.note = (dropped > 0).then(|| {
            format!(
                "{dropped} additional rows were omitted; the full result has {} rows.",
                self.total_rows
            )
        });
    }
}

/// Build the narration payload for `response`.
pub fn prepare(response: &ChatResponse) -> NarrationPayload {
    let plan = &response.plan;
    let all_rows = &response.result.rows;

    let rows = all_rows
        .iter()
        .take(MAX_ROWS)
        .enumerate()
        .map(|(i, row)| {
            if i < DETAILED_ROWS {
                budget_wide_row(row)
            } else {
                row.iter()
                    .take(NARROW_ROW_FIELDS)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
        })
        .collect();

    let mut payload = NarrationPayload {
        question: plan.prompt.clone(),
        sql: plan.sql.clone(),
        explanation: plan
            .explanation
            .as_deref()
            .map(|e| cap_chars(e, MAX_EXPLANATION_CHARS)),
        total_rows: all_rows.len(),
        rows,
        note: None,
        error: response.result.error.clone(),
    };
    payload.record_drop();

    if payload.estimated_tokens() > TOKEN_LIMIT {
        payload.explanation = payload
            .explanation
            .as_deref()
            .map(|e| cap_chars(e, AGGRESSIVE_EXPLANATION_CHARS));
        payload.rows.truncate(AGGRESSIVE_ROWS);
        payload.record_drop();
    }
    payload
}

/// Rows over [`WIDE_ROW_BYTES`] keep leading fields until [`WIDE_ROW_BUDGET`]
/// is spent.
fn budget_wide_row(row: &Row) -> Row {
    if json_len(row) <= WIDE_ROW_BYTES {
        return row.clone();
    }

    let mut kept = Row::new();
    let mut spent = 0;
    for (key, value) in row {
        let cost = key.len() + json_len(value);
        if spent + cost > WIDE_ROW_BUDGET {
            break;
        }
        spent += cost;
        kept.insert(key.clone(), value.clone());
    }
    let omitted = row.len() - kept.len();
    kept.insert(
        TRUNCATED_FIELD.to_owned(),
        Value::String(format!("{omitted} fields omitted")),
    );
    kept
}

fn json_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

fn cap_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_owned(),
        None => text.to_owned(),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::analyst::QueryPlan;
    use crate::orchestrator::QueryResult;

    fn response(rows: Vec<Row>, explanation: Option<String>) -> ChatResponse {
        ChatResponse {
            plan: QueryPlan {
                prompt: "Show revenue breakdown by region".into(),
                sql: Some("SELECT * FROM sales".into()),
                explanation,
                request_id: "req-1".into(),
                suggestions: vec![],
            },
            result: QueryResult { rows, error: None },
        }
    }

    fn wide_row(i: usize, fields: usize) -> Row {
        (0..fields)
            .map(|f| (format!("col_{f}"), json!(format!("row{i}-field{f}"))))
            .collect()
    }

    #[test]
    fn row_count_is_capped_with_note() {
        let rows = (0..150).map(|i| wide_row(i, 8)).collect();
        let payload = prepare(&response(rows, None));

        assert_eq!(payload.rows.len(), 100);
        assert_eq!(payload.total_rows, 150);
        assert!(payload.note.as_deref().unwrap().contains("50 additional rows"));
        assert!(payload.rows[..50].iter().all(|r| r.len() == 8));
        assert!(payload.rows[50..].iter().all(|r| r.len() <= 5));
    }

    #[test]
    fn small_results_pass_through_untouched() {
        let rows = vec![
            json!({ "region": "EU", "revenue": 100 }),
            json!({ "region": "US", "revenue": 200 }),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect::<Vec<_>>();
        let payload = prepare(&response(rows.clone(), Some("two regions".into())));

        assert_eq!(payload.rows, rows);
        assert!(payload.note.is_none());
        assert_eq!(payload.explanation.as_deref(), Some("two regions"));
    }

    #[test]
    fn wide_row_keeps_leading_fields_within_budget() {
        let mut row = Row::new();
        for f in 0..20 {
            row.insert(format!("f{f:02}"), json!("x".repeat(90)));
        }
        let payload = prepare(&response(vec![row], None));

        let trimmed = &payload.rows[0];
        let kept: Vec<_> = trimmed.keys().filter(|k| *k != TRUNCATED_FIELD).collect();
        assert_eq!(kept, ["f00", "f01", "f02", "f03", "f04"]);
        assert_eq!(trimmed[TRUNCATED_FIELD], json!("15 fields omitted"));
    }

    #[test]
    fn explanation_is_capped() {
        let payload = prepare(&response(vec![], Some("é".repeat(12_000))));
        assert_eq!(
            payload.explanation.unwrap().chars().count(),
            MAX_EXPLANATION_CHARS
        );
    }

    #[test]
    fn oversized_prompt_triggers_aggressive_pass() {
        // Rows 51..100 keep five 2 KB fields each: ~500 KB, over the token limit.
        let rows = (0..100)
            .map(|i| {
                (0..5)
                    .map(|f| (format!("c{f}"), json!(format!("{i}{}", "y".repeat(2000)))))
                    .collect()
            })
            .collect();
        let payload = prepare(&response(rows, Some("z".repeat(9_000))));

        assert_eq!(payload.rows.len(), AGGRESSIVE_ROWS);
        assert_eq!(
            payload.explanation.unwrap().len(),
            AGGRESSIVE_EXPLANATION_CHARS
        );
        assert!(payload.note.unwrap().contains("80 additional rows"));
    }
}
