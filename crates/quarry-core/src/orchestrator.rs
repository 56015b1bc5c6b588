//! One question, end to end: plan → execute → narrate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::analyst::{Planner, QueryPlan};
use crate::config::RetryPolicy;
use crate::error::GatewayError;
use crate::narrator::{NarrationEvent, NarrationOutcome, NarrationStream, ResponseNarrator};
use crate::warehouse::{ConnectionManager, QueryExecutor, Row};

/// Kind recorded when a plan carried no SQL.
pub const NO_SQL: &str = "no_sql";

/// Why a plan produced no rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFailure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    #[serde(rename = "results")]
    pub rows: Vec<Row>,
    pub error: Option<QueryFailure>,
}

/// A plan together with what executing it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub plan: QueryPlan,
    #[serde(flatten)]
    pub result: QueryResult,
}

/// Result of the synchronous path.
#[derive(Debug, Clone)]
pub struct NarratedAnswer {
    pub response: ChatResponse,
    pub markdown: String,
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Start,
    PlanFetched,
    Executed,
    Narrated { success: bool },
}

impl fmt::Display for RequestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStage::Start => f.write_str("start"),
            RequestStage::PlanFetched => f.write_str("plan_fetched"),
            RequestStage::Executed => f.write_str("executed"),
            RequestStage::Narrated { success: true } => f.write_str("narrated"),
            RequestStage::Narrated { success: false } => f.write_str("narration_failed"),
        }
    }
}

pub struct QueryOrchestrator {
    planner: Arc<dyn Planner>,
    executor: QueryExecutor,
    narrator: Arc<ResponseNarrator>,
    query_timeout: Duration,
    retry: RetryPolicy,
}

impl QueryOrchestrator {
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: QueryExecutor,
        narrator: Arc<ResponseNarrator>,
        query_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            planner,
            executor,
            narrator,
            query_timeout,
            retry,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.executor.connections()
    }

    /// Plan and execute, retrying the pair on connection faults.
    pub async fn prepare(&self, prompt: &str) -> Result<ChatResponse, GatewayError> {
        let mut attempt = 0u32;
        loop {
            match self.plan_and_execute(prompt).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connection_fault() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "request hit a connection fault; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn plan_and_execute(&self, prompt: &str) -> Result<ChatResponse, GatewayError> {
        debug!(stage = %RequestStage::Start, "request stage");
        let plan = self.planner.plan(prompt).await?;
        debug!(stage = %RequestStage::PlanFetched, request_id = %plan.request_id, "request stage");

        let result = match plan.sql.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(sql) => QueryResult {
                rows: self.executor.run(sql, self.query_timeout).await?,
                error: None,
            },
            None => {
                info!(request_id = %plan.request_id, "plan has no SQL; skipping execution");
                QueryResult {
                    rows: Vec::new(),
                    error: Some(QueryFailure {
                        kind: NO_SQL.to_owned(),
                        message: "The analyst did not generate SQL for this question.".to_owned(),
                    }),
                }
            }
        };
        debug!(
            stage = %RequestStage::Executed,
            request_id = %plan.request_id,
            rows = result.rows.len(),
            "request stage"
        );

        Ok(ChatResponse { plan, result })
    }

    /// Synchronous path: the whole narration as one markdown block.
    pub async fn answer(&self, prompt: &str) -> Result<NarratedAnswer, GatewayError> {
        let response = self.prepare(prompt).await?;
        let narrated = self.narrator.enhance(&response).await;
        debug!(
            stage = %RequestStage::Narrated { success: narrated.is_ok() },
            request_id = %response.plan.request_id,
            "request stage"
        );
        Ok(NarratedAnswer {
            markdown: narrated?,
            response,
        })
    }

    /// Streaming path.  Failures before narration arrive as a lone
    /// [`NarrationEvent::Error`].
    pub fn answer_stream(self: &Arc<Self>, prompt: String) -> NarrationStream {
        let (tx, rx) = mpsc::channel(self.narrator.channel_capacity());
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let response = match orchestrator.prepare(&prompt).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "request failed before narration");
                    let _ = tx.send(NarrationEvent::Error(e.to_string())).await;
                    return;
                }
            };

            let request_id = response.plan.request_id.clone();
            if tx.is_closed() {
                info!(request_id = %request_id, "client disconnected; skipping narration");
                return;
            }

            match orchestrator.narrator.stream_into(Arc::new(response), &tx).await {
                NarrationOutcome::Abandoned => {
                    info!(request_id = %request_id, "client disconnected during narration");
                }
                outcome => debug!(
                    stage = %RequestStage::Narrated { success: outcome == NarrationOutcome::Completed },
                    request_id = %request_id,
                    "request stage"
                ),
            }
        });

        rx
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use serde_json::json;
    use tokio::time::Instant;

    use super::*;
    use crate::config::{NarratorConfig, WarehouseConfig};
    use crate::error::WarehouseError;
    use crate::testing::{ScriptedDriver, ScriptedNarration, StaticPlanner, rows};

    const REVENUE_SQL: &str = "SELECT region, revenue FROM sales";

    fn orchestrator(
        planner: &StaticPlanner,
        driver: &ScriptedDriver,
        narration: &ScriptedNarration,
    ) -> Arc<QueryOrchestrator> {
        let manager = ConnectionManager::new(Arc::new(driver.clone()), &WarehouseConfig::default());
        let executor = QueryExecutor::new(
            Arc::new(manager),
            RetryPolicy {
                jitter: Duration::ZERO,
                ..RetryPolicy::exponential()
            },
        );
        let narrator = ResponseNarrator::new(Arc::new(narration.clone()), &NarratorConfig::default());
        Arc::new(QueryOrchestrator::new(
            Arc::new(planner.clone()),
            executor,
            Arc::new(narrator),
            Duration::from_secs(30),
            RetryPolicy::linear(),
        ))
    }

    async fn drain(mut rx: NarrationStream) -> Vec<NarrationEvent> {
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn revenue_question_returns_rows_and_narration() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        driver.push_result(Ok(rows(json!([
            { "region": "EU", "revenue": 100 },
            { "region": "US", "revenue": 200 }
        ]))));
        let narration = ScriptedNarration::new(["US leads with 200."]);

        let answer = orchestrator(&planner, &driver, &narration)
            .answer("Show revenue breakdown by region")
            .await
            .unwrap();

        assert_eq!(answer.response.result.rows.len(), 2);
        assert_eq!(answer.response.plan.sql.as_deref(), Some(REVENUE_SQL));
        assert_eq!(answer.markdown, "US leads with 200.");
        assert_eq!(driver.statements(), vec![REVENUE_SQL.to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_executor_retries_are_retried_by_request_loop() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        for _ in 0..3 {
            driver.push_result(Err(WarehouseError::from_message("connection lost")));
        }
        let narration = ScriptedNarration::new(["ok"]);

        let start = Instant::now();
        let response = orchestrator(&planner, &driver, &narration)
            .prepare("Show revenue breakdown by region")
            .await
            .unwrap();

        assert!(response.result.error.is_none());
        assert_eq!(planner.calls(), 2);
        assert_eq!(driver.executes(), 4);
        // Executor waits 1 s + 2 s, then the request loop waits 1 s.
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn request_loop_gives_up_after_two_retries() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        for _ in 0..9 {
            driver.push_result(Err(WarehouseError::from_message("connection lost")));
        }
        let narration = ScriptedNarration::new(["unused"]);

        let err = orchestrator(&planner, &driver, &narration)
            .answer("Show revenue breakdown by region")
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "connection lost");
        assert_eq!(planner.calls(), 3);
        assert_eq!(driver.executes(), 9);
        assert!(narration.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn query_timeouts_are_retried_by_both_layers() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        driver.set_latency(Duration::from_secs(60));
        let narration = ScriptedNarration::new(["unused"]);

        let start = Instant::now();
        let err = orchestrator(&planner, &driver, &narration)
            .answer("Show revenue breakdown by region")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::QueryTimeout { timeout_ms: 30_000 }));
        assert_eq!(planner.calls(), 3);
        assert_eq!(driver.executes(), 9);
        assert!(narration.requests().is_empty());
        // Per request: three 30 s deadlines plus 1 s + 2 s executor waits;
        // then 1 s and 2 s between requests.
        assert_eq!(start.elapsed(), Duration::from_secs(3 * 93 + 1 + 2));
    }

    #[tokio::test]
    async fn non_connection_failures_are_not_retried() {
        let planner = StaticPlanner::failing("analyst returned 401 Unauthorized: bad token");
        let driver = ScriptedDriver::new();
        let narration = ScriptedNarration::new(["unused"]);

        let err = orchestrator(&planner, &driver, &narration)
            .answer("anything")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Analyst(_)));
        assert_eq!(planner.calls(), 1);
        assert_eq!(driver.connects(), 0);
    }

    #[tokio::test]
    async fn plan_without_sql_is_narrated_not_executed() {
        let planner = StaticPlanner::no_sql("Did you mean revenue or margin?");
        let driver = ScriptedDriver::new();
        let narration = ScriptedNarration::new(["Please clarify."]);

        let answer = orchestrator(&planner, &driver, &narration)
            .answer("how are we doing")
            .await
            .unwrap();

        let failure = answer.response.result.error.unwrap();
        assert_eq!(failure.kind, NO_SQL);
        assert!(answer.response.result.rows.is_empty());
        assert_eq!(driver.executes(), 0);
        assert_eq!(answer.markdown, "Please clarify.");
    }

    #[tokio::test]
    async fn narration_failure_fails_synchronous_answer() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        let narration = ScriptedNarration::new(Vec::<String>::new()).refusing("invalid api key");

        let err = orchestrator(&planner, &driver, &narration)
            .answer("Show revenue breakdown by region")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Narration(m) if m.contains("invalid api key")));
        assert_eq!(planner.calls(), 1);
    }

    #[tokio::test]
    async fn stream_orders_start_chunks_complete() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        let narration = ScriptedNarration::new(["a", "b", "c"]);

        let events = drain(
            orchestrator(&planner, &driver, &narration)
                .answer_stream("Show revenue breakdown by region".into()),
        )
        .await;

        assert!(matches!(events.first(), Some(NarrationEvent::Start(_))));
        assert!(matches!(events.last(), Some(NarrationEvent::Complete)));
        assert_eq!(events.len(), 5);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn stream_failure_before_narration_is_a_lone_error() {
        let planner = StaticPlanner::sql("SELEC 1");
        let driver = ScriptedDriver::new();
        driver.push_result(Err(WarehouseError::from_message(
            "SQL compilation error: syntax error line 1 at position 0 unexpected 'SELEC'",
        )));
        let narration = ScriptedNarration::new(["unused"]);

        let events = drain(
            orchestrator(&planner, &driver, &narration).answer_stream("broken".into()),
        )
        .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], NarrationEvent::Error(m) if m.starts_with("SQL compilation error")));
        assert!(narration.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn narration_is_skipped_when_client_left_during_execution() {
        let planner = StaticPlanner::sql(REVENUE_SQL);
        let driver = ScriptedDriver::new();
        driver.set_latency(Duration::from_secs(2));
        let narration = ScriptedNarration::new(["unused"]);

        let rx = orchestrator(&planner, &driver, &narration).answer_stream("slow".into());
        drop(rx);
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The in-flight statement ran to completion; narration never started.
        assert_eq!(driver.executes(), 1);
        assert!(narration.requests().is_empty());
    }

    #[test]
    fn chat_response_serializes_flat() {
        let response = crate::testing::sample_response();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["sql"], json!(REVENUE_SQL));
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
        assert_eq!(value["error"], serde_json::Value::Null);
        assert_eq!(value["request_id"], json!("req-sample"));
    }
}
