use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use crate::api::AppState;
use crate::error::AppResult;
use crate::resolver::host::HostInfo;
use crate::resolver::{listen_port, ResolverStatus, ServiceState};
use crate::stats;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    #[serde(flatten)]
    pub host: HostInfo,
    pub resolver_state: ServiceState,
    pub resolver_version: Option<String>,
    pub listen_port: u16,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<ResolverStatus> {
    Json(state.control.status().await)
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Value>> {
    Json(stats::point_stats(&state.control).await)
}

pub async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let (host, status, port) = tokio::join!(
        state.host.snapshot(),
        state.control.status(),
        listen_port(&state.resolver_config_path),
    );
    Json(InfoResponse {
        host,
        resolver_state: status.state,
        resolver_version: status.version,
        listen_port: port,
    })
}

/// Unreachable control channel surfaces as 502.
pub async fn flush_cache(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let message = state.control.flush_cache().await?;
    Ok(Json(json!({"ok": true, "message": message})))
}
