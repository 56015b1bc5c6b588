//! Statement REST API driver.
//!
//! Sessions are thin: each statement is a `POST /api/v2/statements` signed
//! with a key-pair token.  Long-running statements answer `202` and are
//! polled; large results arrive in partitions that are fetched in order.
//!
//! HTTP outcomes are classified here, once:
//!
//! | Outcome                              | Kind              |
//! |--------------------------------------|-------------------|
//! | transport error, `408`, `429`, `5xx` | `ConnectionFault` |
//! | `401`, `403`                         | `Unauthorized`    |
//! | `422`, other `4xx`                   | `Statement`       |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::WarehouseConfig;
use crate::error::WarehouseError;
use crate::signer::CredentialSigner;
use crate::warehouse::{Row, WarehouseDriver, WarehouseSession};

const STATEMENTS_PATH: &str = "/api/v2/statements";

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSet {
    statement_handle: String,
    result_set_meta_data: ResultSetMetaData,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<ColumnType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ColumnType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementStatus {
    #[serde(default)]
    statement_status_url: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartitionData {
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

// ── Driver ────────────────────────────────────────────────────────────────────

struct Endpoint {
    http: Client,
    signer: Arc<CredentialSigner>,
    config: WarehouseConfig,
}

/// Opens [`SqlApiSession`]s, validating each with `SELECT 1`.
#[derive(Clone)]
pub struct SqlApiDriver {
    endpoint: Arc<Endpoint>,
}

impl SqlApiDriver {
    pub fn new(http: Client, signer: Arc<CredentialSigner>, config: WarehouseConfig) -> Self {
        Self {
            endpoint: Arc::new(Endpoint {
                http,
                signer,
                config,
            }),
        }
    }
}

#[async_trait]
impl WarehouseDriver for SqlApiDriver {
    async fn connect(&self) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
        let session = SqlApiSession {
            endpoint: Arc::clone(&self.endpoint),
            id: Uuid::new_v4(),
            up: AtomicBool::new(true),
        };
        session.execute("SELECT 1").await?;
        info!(session_id = %session.id, base_url = %self.endpoint.config.base_url, "statement API session ready");
        Ok(Box::new(session))
    }
}

/// One logical warehouse session.
pub struct SqlApiSession {
    endpoint: Arc<Endpoint>,
    id: Uuid,
    up: AtomicBool,
}

impl SqlApiSession {
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, WarehouseError> {
        let token = self
            .endpoint
            .signer
            .get_token()
            .await
            .map_err(|e| WarehouseError::Unauthorized(e.to_string()))?;

        authorize(request, &token.token, self.endpoint.config.http_timeout)
            .send()
            .await
            .map_err(transport_error)
    }

    async fn run_statement(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        let cfg = &self.endpoint.config;
        let url = format!(
            "{}{}?requestId={}",
            cfg.base_url.trim_end_matches('/'),
            STATEMENTS_PATH,
            Uuid::new_v4()
        );
        let body = StatementRequest {
            statement: sql,
            timeout: cfg.http_timeout.as_secs(),
            warehouse: cfg.warehouse.as_deref(),
            database: cfg.database.as_deref(),
            schema: cfg.schema.as_deref(),
            role: cfg.role.as_deref(),
        };

        let mut response = self
            .send(self.endpoint.http.post(&url).json(&body))
            .await?;

        // 202: still running; follow the status URL until it settles.
        while response.status() == StatusCode::ACCEPTED {
            let status: StatementStatus = response.json().await.map_err(transport_error)?;
            let status_url = status.statement_status_url.ok_or_else(|| {
                WarehouseError::Statement("statement accepted without a status URL".into())
            })?;
            debug!(session_id = %self.id, message = ?status.message, "statement still running");
            tokio::time::sleep(cfg.poll_interval).await;
            let url = format!("{}{}", cfg.base_url.trim_end_matches('/'), status_url);
            response = self.send(self.endpoint.http.get(&url)).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let result: ResultSet = response.json().await.map_err(transport_error)?;
        let mut data = result.data;
        for partition in 1..result.result_set_meta_data.partition_info.len() {
            let url = format!(
                "{}{}/{}?partition={}",
                cfg.base_url.trim_end_matches('/'),
                STATEMENTS_PATH,
                result.statement_handle,
                partition
            );
            let response = self.send(self.endpoint.http.get(&url)).await?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(classify_status(status, &text));
            }
            let chunk: PartitionData = response.json().await.map_err(transport_error)?;
            data.extend(chunk.data);
        }

        Ok(to_rows(&result.result_set_meta_data.row_type, data))
    }
}

#[async_trait]
impl WarehouseSession for SqlApiSession {
    async fn execute(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        let result = self.run_statement(sql).await;
        if let Err(e) = &result {
            if e.is_connection_fault() {
                self.up.store(false, Ordering::Relaxed);
            }
        }
        result
    }

    async fn ping(&self) -> Option<Result<(), WarehouseError>> {
        Some(self.execute("SELECT 1").await.map(|_| ()))
    }

    fn is_up(&self) -> Option<bool> {
        Some(self.up.load(Ordering::Relaxed))
    }

    async fn close(&self) -> Result<(), WarehouseError> {
        // Statements are independent requests; nothing is held server-side.
        self.up.store(false, Ordering::Relaxed);
        debug!(session_id = %self.id, "statement API session closed");
        Ok(())
    }
}

// ── Classification & decoding ─────────────────────────────────────────────────

/// Key-pair bearer auth plus a per-call deadline.
fn authorize(request: reqwest::RequestBuilder, token: &str, timeout: Duration) -> reqwest::RequestBuilder {
    request
        .timeout(timeout)
        .bearer_auth(token)
        .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
        .header(reqwest::header::ACCEPT, "application/json")
}

fn transport_error(e: reqwest::Error) -> WarehouseError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        WarehouseError::ConnectionFault(e.to_string())
    } else {
        WarehouseError::from_message(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> WarehouseError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned());
    let detail = format!("warehouse returned {status}: {message}");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => WarehouseError::Unauthorized(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            WarehouseError::ConnectionFault(detail)
        }
        s if s.is_server_error() => WarehouseError::ConnectionFault(detail),
        _ => WarehouseError::Statement(message),
    }
}

fn to_rows(columns: &[ColumnType], data: Vec<Vec<Option<String>>>) -> Vec<Row> {
    data.into_iter()
        .map(|values| {
            columns
                .iter()
                .zip(values)
                .map(|(col, raw)| (col.name.clone(), decode_value(col, raw)))
                .collect()
        })
        .collect()
}

fn decode_value(column: &ColumnType, raw: Option<String>) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match column.kind.as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        "fixed" | "real" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(raw)),
        "boolean" => match raw.as_str() {
            "true" | "TRUE" | "1" => Value::Bool(true),
            "false" | "FALSE" | "0" => Value::Bool(false),
            _ => Value::String(raw),
        },
        _ => Value::String(raw),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn result_set(body: Value) -> ResultSet {
        serde_json::from_value(body).expect("valid result set")
    }

    #[test]
    fn every_call_carries_auth_and_deadline() {
        let request = authorize(
            Client::new().get("https://acct.example.com/api/v2/statements/abc"),
            "jwt-token",
            Duration::from_secs(60),
        )
        .build()
        .unwrap();

        assert_eq!(request.timeout(), Some(&Duration::from_secs(60)));
        assert_eq!(request.headers()["authorization"], "Bearer jwt-token");
        assert_eq!(request.headers()["x-snowflake-authorization-token-type"], "KEYPAIR_JWT");
    }

    #[test]
    fn result_set_is_decoded_with_column_types() {
        let rs = result_set(json!({
            "statementHandle": "01b2-0000",
            "resultSetMetaData": {
                "numRows": 2,
                "rowType": [
                    { "name": "REGION", "type": "text" },
                    { "name": "REVENUE", "type": "fixed", "scale": 0 },
                    { "name": "MARGIN", "type": "fixed", "scale": 2 },
                    { "name": "ACTIVE", "type": "boolean" }
                ],
                "partitionInfo": [{ "rowCount": 2 }]
            },
            "data": [
                ["EU", "100", "0.25", "true"],
                ["US", "200", null, "false"]
            ]
        }));

        let rows = to_rows(&rs.result_set_meta_data.row_type, rs.data);
        assert_eq!(rows.len(), 2);
        assert_eq!(
            Value::Object(rows[0].clone()),
            json!({ "REGION": "EU", "REVENUE": 100, "MARGIN": 0.25, "ACTIVE": true })
        );
        assert_eq!(rows[1]["MARGIN"], Value::Null);
        let columns: Vec<_> = rows[0].keys().cloned().collect();
        assert_eq!(columns, ["REGION", "REVENUE", "MARGIN", "ACTIVE"]);
    }

    #[test]
    fn unparsable_numbers_fall_back_to_text() {
        let col = ColumnType {
            name: "BIG".into(),
            kind: "fixed".into(),
            scale: Some(0),
        };
        assert_eq!(
            decode_value(&col, Some("99999999999999999999999".into())),
            json!("99999999999999999999999")
        );
    }

    #[test]
    fn http_status_classification() {
        let body = r#"{"code":"002003","message":"Object 'SALES' does not exist"}"#;
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, body),
            WarehouseError::Statement("Object 'SALES' does not exist".into())
        );
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_connection_fault());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_connection_fault());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, r#"{"message":"JWT token is invalid."}"#),
            WarehouseError::Unauthorized(m) if m.contains("JWT token is invalid.")
        ));
    }

    #[test]
    fn statement_request_omits_unset_context() {
        let req = StatementRequest {
            statement: "SELECT 1",
            timeout: 60,
            warehouse: Some("ANALYTICS_WH"),
            database: None,
            schema: None,
            role: None,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({ "statement": "SELECT 1", "timeout": 60, "warehouse": "ANALYTICS_WH" })
        );
    }
}
