pub mod check_run;
pub mod config;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod http;
pub mod importer;
pub mod orchestrator;
pub mod store;
pub mod telemetry;
pub mod webhook;
pub mod workspace;

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use error::OrchestratorError;
pub use orchestrator::PullRequestOrchestrator;
pub use telemetry::Telemetry;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_bot_version() -> String {
    // Git hash from the packaging environment, then the built crate's detection
    if let Some(git_hash) = option_env!("AIGATE_GIT_HASH") {
        git_hash.chars().take(8).collect()
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        git_hash.chars().take(8).collect()
    } else {
        "unknown".to_string()
    }
}

pub struct AppState {
    pub orchestrator: Arc<PullRequestOrchestrator>,
    pub telemetry: Telemetry,
    pub webhook_secret: Option<String>,
    pub rerun_auth_token: Option<String>,
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "aigate",
        "version": get_bot_version(),
        "reported_errors": state.telemetry.reported_errors(),
    }))
}

/// The service's full router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
