//! Process-wide gateway state.
//!
//! The only mutable state shared across requests is the cached token inside
//! [`CredentialSigner`] and the connection slot inside [`ConnectionManager`];
//! both sit behind their own lock.  Everything else here is immutable after
//! construction.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::analyst::{AnalystClient, SemanticModel};
use crate::config::{GatewayConfig, account_base_url};
use crate::error::GatewayError;
use crate::narrator::{ChatCompletionsBackend, ResponseNarrator};
use crate::orchestrator::QueryOrchestrator;
use crate::signer::CredentialSigner;
use crate::warehouse::{ConnectionManager, QueryExecutor, SqlApiDriver};

const ANALYST_PATH: &str = "/api/v2/cortex/analyst/message";

#[derive(Clone)]
pub struct GatewayState {
    orchestrator: Arc<QueryOrchestrator>,
    connections: Arc<ConnectionManager>,
}

impl GatewayState {
    pub fn new(orchestrator: Arc<QueryOrchestrator>) -> Self {
        let connections = Arc::clone(orchestrator.connections());
        Self {
            orchestrator,
            connections,
        }
    }

    /// Build the production graph: one shared HTTP client, the statement
    /// API driver, the analyst client and the chat-completions narrator.
    ///
    /// Fails when no semantic model is available or the narration endpoint
    /// is unset.  Missing key material is only logged here; it fails each
    /// request instead.
    pub async fn from_config(mut config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.narrator.endpoint.is_empty() {
            return Err(GatewayError::Config("narration endpoint is not set".into()));
        }
        if config.warehouse.base_url.is_empty() {
            if config.signer.account.is_empty() {
                return Err(GatewayError::Config("warehouse account is not set".into()));
            }
            config.warehouse.base_url = account_base_url(&config.signer.account);
        }
        if config.analyst.endpoint.is_empty() {
            config.analyst.endpoint = format!(
                "{}{}",
                config.warehouse.base_url.trim_end_matches('/'),
                ANALYST_PATH
            );
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        let signer = Arc::new(CredentialSigner::new(config.signer.clone()));
        match signer.get_token().await {
            Ok(_) => info!(user = %signer.qualified_user(), "key-pair credentials loaded"),
            Err(e) => warn!(error = %e, "credentials unusable; requests will fail until fixed"),
        }

        let model = SemanticModel::load(&config.analyst).await?;

        let driver = SqlApiDriver::new(http.clone(), Arc::clone(&signer), config.warehouse.clone());
        let connections = Arc::new(ConnectionManager::new(Arc::new(driver), &config.warehouse));
        let executor = QueryExecutor::new(connections, config.executor_retry.clone());

        let planner = AnalystClient::new(http.clone(), signer, config.analyst.clone(), model);
        let backend = ChatCompletionsBackend::new(http, config.narrator.clone());
        let narrator = ResponseNarrator::new(Arc::new(backend), &config.narrator);

        info!(
            warehouse = %config.warehouse.base_url,
            analyst = %config.analyst.endpoint,
            narration = %config.narrator.endpoint,
            "gateway ready"
        );

        Ok(Self::new(Arc::new(QueryOrchestrator::new(
            Arc::new(planner),
            executor,
            Arc::new(narrator),
            config.query_timeout,
            config.request_retry.clone(),
        ))))
    }

    pub fn orchestrator(&self) -> &Arc<QueryOrchestrator> {
        &self.orchestrator
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Release the warehouse connection.  Idempotent.
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{self, ScriptedDriver, ScriptedNarration, StaticPlanner};

    #[tokio::test]
    async fn missing_narration_endpoint_is_rejected() {
        let err = GatewayState::from_config(GatewayConfig::default()).await.err().unwrap();
        assert!(matches!(err, GatewayError::Config(m) if m.contains("narration")));
    }

    #[tokio::test]
    async fn missing_semantic_model_fails_startup() {
        let mut config = GatewayConfig::default();
        config.signer.account = "xy12345".into();
        config.narrator.endpoint = "http://127.0.0.1:9/v1/chat/completions".into();

        let err = GatewayState::from_config(config).await.err().unwrap();
        assert!(matches!(err, GatewayError::Config(m) if m.contains("semantic model")));
    }

    #[tokio::test]
    async fn shutdown_releases_connection() {
        let driver = ScriptedDriver::new();
        let state = testing::gateway(
            &StaticPlanner::sql("SELECT 1"),
            &driver,
            &ScriptedNarration::new(["ok"]),
        );

        state.orchestrator().answer("one").await.unwrap();
        assert!(state.connections().is_connected());

        state.shutdown().await;
        state.shutdown().await;
        assert!(!state.connections().is_connected());
        assert_eq!(driver.closes(), 1);
    }
}
