//! Statement execution with a deadline and connection-fault retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::GatewayError;
use crate::warehouse::{ConnectionManager, Row};

/// Runs SQL over the managed connection.
///
/// Connection faults and timeouts are retried: the connection is
/// invalidated, the executor waits `base × 2^attempt` (+ jitter) and tries
/// again on a fresh connection.  Every other failure is returned as-is.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    connections: Arc<ConnectionManager>,
    retry: RetryPolicy,
}

impl QueryExecutor {
    pub fn new(connections: Arc<ConnectionManager>, retry: RetryPolicy) -> Self {
        Self { connections, retry }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Execute `sql`, giving each attempt at most `timeout`.
    pub async fn run(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>, GatewayError> {
        let mut attempt = 0u32;

        loop {
            let lease = self.connections.ensure().await?;
            let connection_id = lease.id();

            let outcome = match tokio::time::timeout(timeout, lease.execute(sql)).await {
                Ok(result) => result.map_err(GatewayError::from),
                Err(_) => {
                    let timeout_ms = timeout.as_millis() as u64;
                    warn!(?connection_id, timeout_ms, "statement exceeded its deadline");
                    Err(GatewayError::QueryTimeout { timeout_ms })
                }
            };

            match outcome {
                Ok(rows) => {
                    debug!(?connection_id, attempt, rows = rows.len(), "statement finished");
                    return Ok(rows);
                }
                Err(e) if e.is_connection_fault() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        ?connection_id,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "connection fault while executing statement; retrying"
                    );
                    lease.invalidate().await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_connection_fault() {
                        lease.invalidate().await;
                    }
                    return Err(e);
                }
            }
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
