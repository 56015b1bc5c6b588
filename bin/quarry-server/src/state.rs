//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use quarry_core::GatewayState;

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Signer, connection manager and request pipeline.
    pub gateway: GatewayState,
}
