//! Error taxonomy shared by every stage of the pipeline.
//!
//! Retry decisions never look at message text: drivers classify their raw
//! failures into [`WarehouseError`] kinds once, at the boundary, and the two
//! retry layers only ask [`GatewayError::is_connection_fault`].

use thiserror::Error;

use crate::signer::CredentialError;

/// Phrases that mark a raw driver message as a transient connection fault.
///
/// Matching is case-insensitive and only happens in
/// [`WarehouseError::from_message`].
pub const CONNECTION_FAULT_PHRASES: &[&str] = &[
    "terminated",
    "closed",
    "reset",
    "timeout",
    "timed out",
    "network",
    "socket",
    "connection lost",
    "broken pipe",
];

/// Failure reported by a warehouse session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WarehouseError {
    /// The session or its transport failed; the statement may succeed on a
    /// fresh connection.
    #[error("{0}")]
    ConnectionFault(String),

    /// The warehouse rejected or failed the statement itself.
    #[error("{0}")]
    Statement(String),

    /// The warehouse refused the credentials presented by the session.
    #[error("warehouse rejected credentials: {0}")]
    Unauthorized(String),
}

impl WarehouseError {
    /// Classify an untyped driver message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if CONNECTION_FAULT_PHRASES
            .iter()
            .any(|phrase| lowered.contains(phrase))
        {
            WarehouseError::ConnectionFault(message)
        } else {
            WarehouseError::Statement(message)
        }
    }

    pub fn is_connection_fault(&self) -> bool {
        matches!(self, WarehouseError::ConnectionFault(_))
    }
}

/// All errors that can end a gateway request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Key material missing or unusable. Never retried.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Opening a warehouse connection failed on every attempt.
    #[error("failed to open warehouse connection after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: WarehouseError,
    },

    /// A statement failed; the message is the driver's, unchanged.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// The statement did not finish within its deadline.  Retried like a
    /// connection fault, on a fresh connection.
    #[error("query timed out after {timeout_ms} ms")]
    QueryTimeout { timeout_ms: u64 },

    /// The analyst service could not produce a plan.
    #[error("analyst request failed: {0}")]
    Analyst(String),

    /// The narration backend failed.
    #[error("narration failed: {0}")]
    Narration(String),

    /// The caller's input was rejected before any upstream call.
    #[error("{0}")]
    Validation(String),

    /// Startup configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GatewayError {
    /// `true` for failures worth retrying on a fresh connection.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            GatewayError::Connection { source, .. } => source.is_connection_fault(),
            GatewayError::Warehouse(e) => e.is_connection_fault(),
            GatewayError::QueryTimeout { .. } => true,
            _ => false,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
