pub mod health;
pub mod history;

use crate::config::Config;
use crate::db::Repository;
use crate::orchestration::ValuationCache;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub cache: Arc<ValuationCache>,
    pub config: Config,
}

impl AppState {
    pub fn new(repo: Arc<Repository>, cache: Arc<ValuationCache>, config: Config) -> Self {
        Self {
            repo,
            cache,
            config,
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/history", get(history::get_history))
        .route("/v1/history/coverage", get(history::get_coverage))
        .route("/v1/history/validate", get(history::validate_history))
        .layer(cors)
        .with_state(state)
}
