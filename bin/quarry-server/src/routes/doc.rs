use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::routes::{chat, health};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(info(
    title = "quarry-server",
    description = "Natural-language questions answered from the data warehouse",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(chat::ChatApi::openapi());
    root
}

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn router() -> Router<Arc<AppState>> {
    let doc = get_docs();
    Router::new().route("/api-docs/openapi.json", get(move || async move { Json(doc) }))
}
