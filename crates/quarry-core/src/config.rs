//! Gateway configuration.
//!
//! Every struct has a [`Default`] with the production constants so callers
//! only override what their environment provides.  The server binary builds
//! a [`GatewayConfig`] from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

/// Where private-key material comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// PEM text held directly in configuration.
    Inline(String),
    /// Path to a PEM file, re-read on every token rotation.
    File(PathBuf),
}

/// Key-pair authentication settings for [`CredentialSigner`].
///
/// [`CredentialSigner`]: crate::signer::CredentialSigner
#[derive(Debug, Clone)]
pub struct SignerConfig {
    /// Account identifier, optionally with a region suffix (`xy12345.us-east-1`).
    pub account: String,
    /// Login name of the service user.
    pub user: String,
    /// Private key; `None` makes every token request fail.
    pub private_key: Option<KeySource>,
    /// Passphrase for an encrypted PKCS#8 key.
    pub passphrase: Option<String>,
    /// Lifetime written into each token (default: 1 hour).
    pub token_ttl: Duration,
    /// A cached token is reused only while it has more than this left (default: 5 minutes).
    pub refresh_margin: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            user: String::new(),
            private_key: None,
            passphrase: None,
            token_ttl: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

/// Warehouse statement API and connection lifecycle settings.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Account base URL, e.g. `https://xy12345.snowflakecomputing.com`.
    pub base_url: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub role: Option<String>,
    /// Connections older than this are replaced before use (default: 30 minutes).
    pub stale_after: Duration,
    /// Attempts made to open a connection before giving up (default: `3`).
    pub open_attempts: u32,
    /// Delay unit between open attempts; attempt `n` waits `n × open_backoff` (default: 2 s).
    pub open_backoff: Duration,
    /// Longest wait for a liveness health query; expiry counts as not alive (default: 10 s).
    pub probe_timeout: Duration,
    /// Interval between status polls for statements still running (default: 500 ms).
    pub poll_interval: Duration,
    /// Per-HTTP-call timeout (default: 60 s).
    pub http_timeout: Duration,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            warehouse: None,
            database: None,
            schema: None,
            role: None,
            stale_after: Duration::from_secs(30 * 60),
            open_attempts: 3,
            open_backoff: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            http_timeout: Duration::from_secs(60),
        }
    }
}

/// Analyst service settings.
#[derive(Debug, Clone)]
pub struct AnalystConfig {
    /// Full URL of the analyst message endpoint.
    pub endpoint: String,
    /// Optional model override forwarded in the request body.
    pub model: Option<String>,
    /// Local semantic model YAML, read once at startup.
    pub semantic_model_path: Option<PathBuf>,
    /// Staged semantic model reference, used when the local file is unavailable.
    pub semantic_model_file: Option<String>,
    pub http_timeout: Duration,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: None,
            semantic_model_path: None,
            semantic_model_file: None,
            http_timeout: Duration::from_secs(60),
        }
    }
}

/// Default instruction sent with every narration request.
pub const DEFAULT_NARRATION_INSTRUCTION: &str = "You are a senior data analyst. Produce a concise, \
structured explanation of the query result below, suitable for an executive reader. Lead with the \
direct answer, then the key figures and notable trends, using short markdown sections and bullet \
points. Do not invent numbers that are not present in the data.";

/// Narration backend settings.
#[derive(Debug, Clone)]
pub struct NarratorConfig {
    /// Chat-completions endpoint URL.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub http_timeout: Duration,
    /// Capacity of the event channel between producer and relay (default: `32`).
    pub channel_capacity: usize,
}

impl Default for NarratorConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            model: "gpt-4o-mini".to_owned(),
            system_prompt: DEFAULT_NARRATION_INSTRUCTION.to_owned(),
            max_tokens: Some(1024),
            temperature: 0.2,
            http_timeout: Duration::from_secs(120),
            channel_capacity: 32,
        }
    }
}

/// How the wait between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base × attempt`
    Linear,
    /// `base × 2^attempt + jitter`
    Exponential,
}

/// Bounded retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound of the random delay added to exponential waits.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Orchestrator-level schedule: 2 retries, waits of 1 s then 2 s.
    pub fn linear() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Linear,
            jitter: Duration::ZERO,
        }
    }

    /// Executor-level schedule: 2 retries, waits of 1 s then 2 s plus up to 250 ms jitter.
    pub fn exponential() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            jitter: Duration::from_millis(250),
        }
    }

    /// Wait before retry number `attempt`.
    ///
    /// Linear schedules count from 1; exponential ones count from 0 so the
    /// first wait is one `base_delay` in both cases.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.base_delay * attempt,
            Backoff::Exponential => {
                let exp = self.base_delay * 2u32.saturating_pow(attempt);
                if self.jitter.is_zero() {
                    exp
                } else {
                    let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
                    exp + Duration::from_millis(extra)
                }
            }
        }
    }
}

/// Everything needed to build a [`GatewayState`].
///
/// [`GatewayState`]: crate::gateway::GatewayState
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub signer: SignerConfig,
    pub warehouse: WarehouseConfig,
    pub analyst: AnalystConfig,
    pub narrator: NarratorConfig,
    /// Per-statement deadline enforced by the executor (default: 30 s).
    pub query_timeout: Duration,
    pub executor_retry: RetryPolicy,
    pub request_retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            signer: SignerConfig::default(),
            warehouse: WarehouseConfig::default(),
            analyst: AnalystConfig::default(),
            narrator: NarratorConfig::default(),
            query_timeout: Duration::from_secs(30),
            executor_retry: RetryPolicy::exponential(),
            request_retry: RetryPolicy::linear(),
        }
    }
}

/// Base URL of an account's REST endpoints.
pub fn account_base_url(account: &str) -> String {
    format!("https://{}.snowflakecomputing.com", account.to_lowercase())
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn linear_schedule_grows_by_attempt() {
        let p = RetryPolicy::linear();
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(2));
    }

    #[test]
    fn exponential_schedule_doubles_and_stays_within_jitter() {
        let p = RetryPolicy::exponential();
        for attempt in 0..3 {
            let d = p.delay(attempt);
            let floor = Duration::from_secs(1 << attempt);
            assert!(d >= floor && d <= floor + Duration::from_millis(250), "{d:?}");
        }
    }

    #[test]
    fn defaults_match_lifecycle_constants() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.warehouse.stale_after, Duration::from_secs(1800));
        assert_eq!(cfg.warehouse.open_attempts, 3);
        assert_eq!(cfg.signer.refresh_margin, Duration::from_secs(300));
        assert_eq!(cfg.executor_retry.max_retries, 2);
        assert_eq!(cfg.request_retry.max_retries, 2);
    }

    #[test]
    fn account_url_is_lowercase() {
        assert_eq!(
            account_base_url("XY12345.us-east-1"),
            "https://xy12345.us-east-1.snowflakecomputing.com"
        );
    }
}
