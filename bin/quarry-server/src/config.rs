//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use quarry_core::config::{
    AnalystConfig, GatewayConfig, KeySource, NarratorConfig, SignerConfig, WarehouseConfig,
};

/// Runtime configuration for quarry-server.
///
/// Only the credential, semantic-model and narration settings have no
/// usable default; everything else works out of the box.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Everything the pipeline needs.
    pub gateway: GatewayConfig,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = GatewayConfig::default();

        let private_key = opt_env("QUARRY_PRIVATE_KEY")
            .map(KeySource::Inline)
            .or_else(|| opt_env("QUARRY_PRIVATE_KEY_PATH").map(|p| KeySource::File(p.into())));

        let gateway = GatewayConfig {
            signer: SignerConfig {
                account: env_or("QUARRY_ACCOUNT", ""),
                user: env_or("QUARRY_USER", ""),
                private_key,
                passphrase: opt_env("QUARRY_PRIVATE_KEY_PASSPHRASE"),
                ..SignerConfig::default()
            },
            warehouse: WarehouseConfig {
                base_url: env_or("QUARRY_WAREHOUSE_URL", ""),
                warehouse: opt_env("QUARRY_WAREHOUSE"),
                database: opt_env("QUARRY_DATABASE"),
                schema: opt_env("QUARRY_SCHEMA"),
                role: opt_env("QUARRY_ROLE"),
                ..WarehouseConfig::default()
            },
            analyst: AnalystConfig {
                endpoint: env_or("QUARRY_ANALYST_URL", ""),
                model: opt_env("QUARRY_ANALYST_MODEL"),
                semantic_model_path: opt_env("QUARRY_SEMANTIC_MODEL_PATH").map(PathBuf::from),
                semantic_model_file: opt_env("QUARRY_SEMANTIC_MODEL_FILE"),
                ..AnalystConfig::default()
            },
            narrator: NarratorConfig {
                endpoint: env_or(
                    "QUARRY_NARRATION_URL",
                    "https://api.openai.com/v1/chat/completions",
                ),
                api_key: opt_env("QUARRY_NARRATION_API_KEY"),
                model: env_or("QUARRY_NARRATION_MODEL", &NarratorConfig::default().model),
                ..NarratorConfig::default()
            },
            query_timeout: Duration::from_millis(parse_env(
                "QUARRY_QUERY_TIMEOUT_MS",
                defaults.query_timeout.as_millis() as u64,
            )),
            ..defaults
        };

        Self {
            bind_address: env_or("QUARRY_BIND", "0.0.0.0:3000"),
            log_level: env_or("QUARRY_LOG", "info"),
            log_json: std::env::var("QUARRY_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: opt_env("QUARRY_CORS_ORIGINS"),
            gateway,
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Unset and empty are both `None`.
fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
