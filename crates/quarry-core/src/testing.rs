//! Scripted stand-ins for the warehouse, analyst and narration services.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for downstream route tests.  Every fake is cheaply cloneable and shares
//! its script and counters between clones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::analyst::{Planner, QueryPlan};
use crate::config::{NarratorConfig, RetryPolicy, WarehouseConfig};
use crate::error::{GatewayError, WarehouseError};
use crate::gateway::GatewayState;
use crate::narrator::{FragmentStream, NarrationBackend, NarrationRequest, ResponseNarrator};
use crate::orchestrator::{ChatResponse, QueryOrchestrator, QueryResult};
use crate::warehouse::{ConnectionManager, QueryExecutor, Row, WarehouseDriver, WarehouseSession};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rows from a JSON array of objects.
pub fn rows(value: Value) -> Vec<Row> {
    value
        .as_array()
        .expect("rows() takes a JSON array")
        .iter()
        .map(|v| v.as_object().cloned().expect("rows() takes an array of objects"))
        .collect()
}

/// The revenue-by-region response used throughout the tests.
pub fn sample_response() -> ChatResponse {
    ChatResponse {
        plan: QueryPlan {
            prompt: "Show revenue breakdown by region".into(),
            sql: Some("SELECT region, revenue FROM sales".into()),
            explanation: Some("This is our interpretation of your question.".into()),
            request_id: "req-sample".into(),
            suggestions: Vec::new(),
        },
        result: QueryResult {
            rows: rows(json!([
                { "region": "EU", "revenue": 100 },
                { "region": "US", "revenue": 200 }
            ])),
            error: None,
        },
    }
}

/// A [`GatewayState`] wired to the given fakes, with production timeouts
/// and jitter-free retries.
pub fn gateway(
    planner: &StaticPlanner,
    driver: &ScriptedDriver,
    narration: &ScriptedNarration,
) -> GatewayState {
    let connections = ConnectionManager::new(Arc::new(driver.clone()), &WarehouseConfig::default());
    let executor = QueryExecutor::new(
        Arc::new(connections),
        RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::exponential()
        },
    );
    let narrator = ResponseNarrator::new(Arc::new(narration.clone()), &NarratorConfig::default());
    GatewayState::new(Arc::new(QueryOrchestrator::new(
        Arc::new(planner.clone()),
        executor,
        Arc::new(narrator),
        Duration::from_secs(30),
        RetryPolicy::linear(),
    )))
}

// ── Warehouse ─────────────────────────────────────────────────────────────────

/// Liveness signal exposed by scripted sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Health query available, answering with the given result.
    Ping(bool),
    /// Only a ready-state flag.
    Flag(bool),
    /// Neither.
    Unknown,
    /// Health query available but never answers.
    Hang,
}

struct DriverScript {
    connect_failures: VecDeque<WarehouseError>,
    results: VecDeque<Result<Vec<Row>, WarehouseError>>,
    default_rows: Vec<Row>,
    liveness: Liveness,
    latency: Duration,
    fail_close: bool,
    statements: Vec<String>,
}

#[derive(Default)]
struct DriverCounters {
    connects: AtomicUsize,
    executes: AtomicUsize,
    closes: AtomicUsize,
}

/// Driver whose sessions replay queued results.
///
/// Statements with nothing queued return the default rows (empty unless
/// set with [`ScriptedDriver::with_rows`]).
#[derive(Clone)]
pub struct ScriptedDriver {
    script: Arc<Mutex<DriverScript>>,
    counters: Arc<DriverCounters>,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(DriverScript {
                connect_failures: VecDeque::new(),
                results: VecDeque::new(),
                default_rows: Vec::new(),
                liveness: Liveness::Unknown,
                latency: Duration::ZERO,
                fail_close: false,
                statements: Vec::new(),
            })),
            counters: Arc::default(),
        }
    }

    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        lock(&self.script).default_rows = rows;
        self
    }

    /// Queue the outcome of the next statement.
    pub fn push_result(&self, result: Result<Vec<Row>, WarehouseError>) {
        lock(&self.script).results.push_back(result);
    }

    /// Make the next connection attempt fail with `err`.
    pub fn fail_connect(&self, err: WarehouseError) {
        lock(&self.script).connect_failures.push_back(err);
    }

    pub fn fail_close(&self) {
        lock(&self.script).fail_close = true;
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        lock(&self.script).liveness = liveness;
    }

    /// Delay applied to every statement.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.script).latency = latency;
    }

    /// Connection attempts, failed ones included.
    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Statements executed, health queries excluded.
    pub fn executes(&self) -> usize {
        self.counters.executes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.script).statements.clone()
    }
}

#[async_trait]
impl WarehouseDriver for ScriptedDriver {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.script).connect_failures.pop_front() {
            return Err(err);
        }
        Ok(Box::new(ScriptedSession {
            driver: self.clone(),
        }))
    }
}

struct ScriptedSession {
    driver: ScriptedDriver,
}

#[async_trait]
impl WarehouseSession for ScriptedSession {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        self.driver.counters.executes.fetch_add(1, Ordering::SeqCst);
        let latency = {
            let mut script = lock(&self.driver.script);
            script.statements.push(sql.to_owned());
            script.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut script = lock(&self.driver.script);
        script
            .results
            .pop_front()
            .unwrap_or_else(|| Ok(script.default_rows.clone()))
    }

    async fn ping(&self) -> Option<Result<(), WarehouseError>> {
        let liveness = lock(&self.driver.script).liveness;
        match liveness {
            Liveness::Hang => std::future::pending().await,
            Liveness::Ping(true) => Some(Ok(())),
            Liveness::Ping(false) => Some(Err(WarehouseError::ConnectionFault(
                "health query failed: session terminated".into(),
            ))),
            _ => None,
        }
    }

    fn is_up(&self) -> Option<bool> {
        match lock(&self.driver.script).liveness {
            Liveness::Flag(up) => Some(up),
            _ => None,
        }
    }

    async fn close(&self) -> Result<(), WarehouseError> {
        self.driver.counters.closes.fetch_add(1, Ordering::SeqCst);
        if lock(&self.driver.script).fail_close {
            return Err(WarehouseError::ConnectionFault("already closed".into()));
        }
        Ok(())
    }
}

// ── Analyst ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum PlanScript {
    Sql(String),
    NoSql(String),
    Fail(String),
}

/// Planner answering every prompt the same way.
#[derive(Clone)]
pub struct StaticPlanner {
    script: PlanScript,
    calls: Arc<AtomicUsize>,
}

impl StaticPlanner {
    pub fn sql(sql: impl Into<String>) -> Self {
        Self::scripted(PlanScript::Sql(sql.into()))
    }

    /// Plans carrying only an explanation.
    pub fn no_sql(explanation: impl Into<String>) -> Self {
        Self::scripted(PlanScript::NoSql(explanation.into()))
    }

    /// Every call fails with [`GatewayError::Analyst`].
    pub fn failing(message: impl Into<String>) -> Self {
        Self::scripted(PlanScript::Fail(message.into()))
    }

    fn scripted(script: PlanScript) -> Self {
        Self {
            script,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, prompt: &str) -> Result<QueryPlan, GatewayError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (sql, explanation) = match &self.script {
            PlanScript::Sql(sql) => (
                Some(sql.clone()),
                "This is our interpretation of your question.".to_owned(),
            ),
            PlanScript::NoSql(explanation) => (None, explanation.clone()),
            PlanScript::Fail(message) => return Err(GatewayError::Analyst(message.clone())),
        };
        Ok(QueryPlan {
            prompt: prompt.to_owned(),
            sql,
            explanation: Some(explanation),
            request_id: format!("req-{n}"),
            suggestions: Vec::new(),
        })
    }
}

// ── Narration ─────────────────────────────────────────────────────────────────

struct NarrationScript {
    fragments: Vec<String>,
    fail_after: Option<(usize, String)>,
    refuse: Option<String>,
    delay: Duration,
    requests: Mutex<Vec<NarrationRequest>>,
    pulled: AtomicUsize,
}

/// Narration backend replaying fixed fragments.
#[derive(Clone)]
pub struct ScriptedNarration {
    script: Arc<NarrationScript>,
}

impl ScriptedNarration {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Arc::new(NarrationScript {
                fragments: fragments.into_iter().map(Into::into).collect(),
                fail_after: None,
                refuse: None,
                delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
                pulled: AtomicUsize::new(0),
            }),
        }
    }

    fn edit(self, f: impl FnOnce(&mut NarrationScript)) -> Self {
        let mut script = Arc::try_unwrap(self.script)
            .unwrap_or_else(|_| panic!("configure ScriptedNarration before cloning it"));
        f(&mut script);
        Self {
            script: Arc::new(script),
        }
    }

    /// Stream `n` fragments, then fail with `message`.
    pub fn failing_after(self, n: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        self.edit(|s| s.fail_after = Some((n, message)))
    }

    /// Reject every call outright.
    pub fn refusing(self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.edit(|s| s.refuse = Some(message))
    }

    /// Pause before each streamed fragment.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.edit(|s| s.delay = delay)
    }

    pub fn requests(&self) -> Vec<NarrationRequest> {
        lock(&self.script.requests).clone()
    }

    /// Fragments handed out by streams so far.
    pub fn fragments_pulled(&self) -> usize {
        self.script.pulled.load(Ordering::SeqCst)
    }

    fn accept(&self, request: NarrationRequest) -> Result<(), GatewayError> {
        lock(&self.script.requests).push(request);
        match &self.script.refuse {
            Some(message) => Err(GatewayError::Narration(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NarrationBackend for ScriptedNarration {
    async fn complete(&self, request: NarrationRequest) -> Result<String, GatewayError> {
        self.accept(request)?;
        Ok(self.script.fragments.concat())
    }

    async fn stream(&self, request: NarrationRequest) -> Result<FragmentStream, GatewayError> {
        self.accept(request)?;
        let script = Arc::clone(&self.script);
        let stream = futures::stream::unfold(0usize, move |i| {
            let script = Arc::clone(&script);
            async move {
                if let Some((n, message)) = &script.fail_after {
                    if i == *n {
                        return Some((Err(GatewayError::Narration(message.clone())), usize::MAX));
                    }
                }
                let fragment = script.fragments.get(i)?.clone();
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                script.pulled.fetch_add(1, Ordering::SeqCst);
                Some((Ok(fragment), i + 1))
            }
        });
        Ok(stream.boxed())
    }
}
