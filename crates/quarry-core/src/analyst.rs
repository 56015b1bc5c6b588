//! Natural-language question → SQL plan, via the analyst service.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AnalystConfig;
use crate::error::GatewayError;
use crate::signer::CredentialSigner;

/// The analyst's answer to one question.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub prompt: String,
    /// Generated SQL; `None` when the analyst could not map the question.
    pub sql: Option<String>,
    pub explanation: Option<String>,
    pub request_id: String,
    /// Follow-up questions offered when the prompt was ambiguous.
    pub suggestions: Vec<String>,
}

/// Anything able to turn a prompt into a [`QueryPlan`].
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, prompt: &str) -> Result<QueryPlan, GatewayError>;
}

/// Semantic model sent with every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticModel {
    /// YAML document read from local disk at startup.
    Inline(String),
    /// Reference to a model file staged in the warehouse (`@db.schema.stage/model.yaml`).
    Staged(String),
}

impl SemanticModel {
    /// Prefer the local file; fall back to the staged reference.
    pub async fn load(config: &AnalystConfig) -> Result<Self, GatewayError> {
        if let Some(path) = &config.semantic_model_path {
            match tokio::fs::read_to_string(path).await {
                Ok(yaml) => {
                    info!(path = %path.display(), bytes = yaml.len(), "loaded semantic model");
                    return Ok(SemanticModel::Inline(yaml));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "semantic model file unavailable");
                }
            }
        }

        match &config.semantic_model_file {
            Some(staged) => {
                info!(staged = %staged, "using staged semantic model");
                Ok(SemanticModel::Staged(staged.clone()))
            }
            None => Err(GatewayError::Config(
                "no semantic model available: set a readable local path or a staged file".into(),
            )),
        }
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnalystRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: [Message<'a>; 1],
    session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    semantic_model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    semantic_model_file: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: [TextContent<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextContent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Session {
    mode: &'static str,
    run_sql: bool,
}

#[derive(Debug, Deserialize)]
struct AnalystResponse {
    #[serde(default)]
    request_id: Option<String>,
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Segment {
    Text { text: String },
    Sql { statement: String },
    Suggestions { suggestions: Vec<String> },
    #[serde(other)]
    Other,
}

fn into_plan(prompt: &str, response: AnalystResponse) -> QueryPlan {
    let mut plan = QueryPlan {
        prompt: prompt.to_owned(),
        sql: None,
        explanation: None,
        request_id: response
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        suggestions: Vec::new(),
    };

    for segment in response.message.content {
        match segment {
            Segment::Text { text } if plan.explanation.is_none() => plan.explanation = Some(text),
            Segment::Sql { statement } if plan.sql.is_none() => plan.sql = Some(statement),
            Segment::Suggestions { suggestions } => plan.suggestions.extend(suggestions),
            _ => {}
        }
    }
    plan
}

// ── Client ────────────────────────────────────────────────────────────────────

/// HTTP client for the analyst message endpoint.  Never retries.
pub struct AnalystClient {
    http: Client,
    signer: Arc<CredentialSigner>,
    config: AnalystConfig,
    model: SemanticModel,
}

impl AnalystClient {
    pub fn new(
        http: Client,
        signer: Arc<CredentialSigner>,
        config: AnalystConfig,
        model: SemanticModel,
    ) -> Self {
        Self {
            http,
            signer,
            config,
            model,
        }
    }

    pub async fn ask(&self, prompt: &str) -> Result<QueryPlan, GatewayError> {
        let token = self.signer.get_token().await?;

        let (semantic_model, semantic_model_file) = match &self.model {
            SemanticModel::Inline(yaml) => (Some(yaml.as_str()), None),
            SemanticModel::Staged(file) => (None, Some(file.as_str())),
        };
        let body = AnalystRequest {
            model: self.config.model.as_deref(),
            messages: [Message {
                role: "user",
                content: [TextContent {
                    kind: "text",
                    text: prompt,
                }],
            }],
            session: Session {
                mode: "analyst",
                run_sql: false,
            },
            semantic_model,
            semantic_model_file,
        };

        debug!(endpoint = %self.config.endpoint, "requesting query plan");
        let response = self
            .http
            .post(&self.config.endpoint)
            .bearer_auth(token.token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.http_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Analyst(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Analyst(format!(
                "analyst returned {status}: {}",
                text.trim()
            )));
        }

        let parsed: AnalystResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Analyst(format!("malformed analyst reply: {e}")))?;
        let plan = into_plan(prompt, parsed);

        info!(
            request_id = %plan.request_id,
            has_sql = plan.sql.is_some(),
            suggestions = plan.suggestions.len(),
            "query plan received"
        );
        Ok(plan)
    }
}

#[async_trait]
impl Planner for AnalystClient {
    async fn plan(&self, prompt: &str) -> Result<QueryPlan, GatewayError> {
        self.ask(prompt).await
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn parse(body: serde_json::Value) -> AnalystResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn segments_map_to_plan_fields() {
        let plan = into_plan(
            "Show revenue breakdown by region",
            parse(json!({
                "request_id": "req-42",
                "message": {
                    "role": "analyst",
                    "content": [
                        { "type": "text", "text": "This is our interpretation of your question." },
                        { "type": "sql", "statement": "SELECT region, revenue FROM sales" },
                        { "type": "text", "text": "ignored second text" },
                        { "type": "chart", "spec": {} }
                    ]
                }
            })),
        );

        assert_eq!(plan.request_id, "req-42");
        assert_eq!(plan.sql.as_deref(), Some("SELECT region, revenue FROM sales"));
        assert_eq!(
            plan.explanation.as_deref(),
            Some("This is our interpretation of your question.")
        );
        assert!(plan.suggestions.is_empty());
    }

    #[test]
    fn ambiguous_question_yields_suggestions_without_sql() {
        let plan = into_plan(
            "how are we doing",
            parse(json!({
                "message": {
                    "content": [
                        { "type": "text", "text": "Your question is ambiguous." },
                        { "type": "suggestions", "suggestions": ["Revenue by region?", "Orders by month?"] }
                    ]
                }
            })),
        );

        assert!(plan.sql.is_none());
        assert_eq!(plan.suggestions.len(), 2);
        assert!(Uuid::parse_str(&plan.request_id).is_ok());
    }

    #[test]
    fn request_body_carries_inline_model_and_disables_execution() {
        let body = AnalystRequest {
            model: None,
            messages: [Message {
                role: "user",
                content: [TextContent {
                    kind: "text",
                    text: "top customers",
                }],
            }],
            session: Session {
                mode: "analyst",
                run_sql: false,
            },
            semantic_model: Some("name: sales"),
            semantic_model_file: None,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "messages": [{ "role": "user", "content": [{ "type": "text", "text": "top customers" }] }],
                "session": { "mode": "analyst", "run_sql": false },
                "semantic_model": "name: sales"
            })
        );
    }

    #[tokio::test]
    async fn semantic_model_falls_back_to_staged_file() {
        let config = AnalystConfig {
            semantic_model_path: Some("/nonexistent/model.yaml".into()),
            semantic_model_file: Some("@ANALYTICS.PUBLIC.MODELS/sales.yaml".into()),
            ..AnalystConfig::default()
        };
        assert_eq!(
            SemanticModel::load(&config).await.unwrap(),
            SemanticModel::Staged("@ANALYTICS.PUBLIC.MODELS/sales.yaml".into())
        );
    }

    #[tokio::test]
    async fn semantic_model_prefers_local_file() {
        let path = std::env::temp_dir().join(format!("quarry-model-{}.yaml", Uuid::new_v4()));
        tokio::fs::write(&path, "name: sales\ntables: []\n").await.unwrap();
        let config = AnalystConfig {
            semantic_model_path: Some(path.clone()),
            semantic_model_file: Some("@STAGE/unused.yaml".into()),
            ..AnalystConfig::default()
        };

        let model = SemanticModel::load(&config).await.unwrap();
        let _ = tokio::fs::remove_file(&path).await;
        assert_eq!(model, SemanticModel::Inline("name: sales\ntables: []\n".into()));
    }

    #[tokio::test]
    async fn missing_semantic_model_is_a_config_error() {
        let err = SemanticModel::load(&AnalystConfig::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
