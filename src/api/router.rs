use axum::{middleware::from_fn_with_state, routing::{get, post}, Router};
use std::sync::Arc;
use super::AppState;
use super::handlers;
use super::middleware::auth::require_token;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (public, skipped by the auth layer)
        .route("/health", get(handlers::health::health_check))
        // Resolver control
        .route("/status", get(handlers::resolver::status))
        .route("/stats", get(handlers::resolver::stats))
        .route("/info", get(handlers::resolver::info))
        .route("/cache/flush", post(handlers::resolver::flush_cache))
        // Query log
        .route("/logs", get(handlers::logs::list))
        .route("/logs/debug", get(handlers::logs::debug))
        .route("/logs/summary", get(handlers::logs::summary))
        .route("/logs/ingest", post(handlers::logs::ingest))
        // DNS probes
        .route("/query", get(handlers::query::query))
        .route("/ping", get(handlers::query::ping))
        // Rules
        .route("/rules", post(handlers::rules::apply))
        // Settings
        .route("/settings", get(handlers::settings::read_all).post(handlers::settings::write))
        .route("/db/ping", post(handlers::settings::db_ping))
        .fallback(handlers::health::not_found)
        .layer(from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}
