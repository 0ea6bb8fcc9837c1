use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use crate::api::AppState;
use crate::db::events;
use crate::error::AppResult;
use crate::logs::{LogDiagnostics, LogRead};
use crate::stats::{summarize, Summary};

const MAX_LIMIT: usize = 5000;
/// Cap on stored events pulled in when the summary falls back to the table.
const SUMMARY_FALLBACK_LIMIT: usize = 50_000;

#[derive(Deserialize)]
pub struct LogsParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Live source first, then the ingested table, then an empty list.
async fn recent_with_fallback(state: &AppState, limit: usize) -> LogRead {
    let live = state.logs.recent(limit).await;
    if !live.events.is_empty() {
        return live;
    }
    match events::recent(state.settings.db_path(), limit).await {
        Ok(stored) if !stored.is_empty() => LogRead {
            source: "ingested",
            events: stored,
            error: live.error,
        },
        Ok(_) => live,
        Err(e) => {
            tracing::warn!("Ingested events unavailable: {}", e);
            live
        }
    }
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    params: Result<Query<LogsParams>, QueryRejection>,
) -> AppResult<Json<LogRead>> {
    let Query(params) = params?;
    let limit = params.limit.clamp(1, MAX_LIMIT);
    Ok(Json(recent_with_fallback(&state, limit).await))
}

pub async fn debug(State(state): State<Arc<AppState>>) -> Json<LogDiagnostics> {
    Json(state.logs.diagnostics().await)
}

pub async fn summary(State(state): State<Arc<AppState>>) -> Json<Summary> {
    let read = recent_with_fallback(&state, SUMMARY_FALLBACK_LIMIT).await;
    Json(summarize(&read.events, Utc::now()))
}

/// Parse the live source and store what is new. A missing source is a
/// normal "nothing to ingest" result, not an error.
pub async fn ingest(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let read = state.logs.all().await;
    if let Some(error) = read.error {
        return Ok(Json(json!({
            "ok": false,
            "source": read.source,
            "parsed": 0,
            "inserted": 0,
            "error": error,
        })));
    }

    let inserted = events::ingest(state.settings.db_path(), &read.events).await?;
    tracing::info!("Ingested {} new events from {} source", inserted, read.source);
    Ok(Json(json!({
        "ok": true,
        "source": read.source,
        "parsed": read.events.len(),
        "inserted": inserted,
    })))
}
