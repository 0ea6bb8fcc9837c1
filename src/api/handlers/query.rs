use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Json,
};
use hickory_proto::rr::RecordType;
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::resolver::listen_port;
use crate::resolver::probe::{self, PingResult, QueryResult};
use crate::rules::is_valid_domain;

#[derive(Deserialize)]
pub struct QueryParams {
    domain: Option<String>,
    #[serde(rename = "type", default = "default_type")]
    qtype: String,
}

fn default_type() -> String {
    "A".to_string()
}

/// One-off lookup against the local resolver.
pub async fn query(
    State(state): State<Arc<AppState>>,
    params: Result<Query<QueryParams>, QueryRejection>,
) -> AppResult<Json<QueryResult>> {
    let Query(params) = params?;
    let domain = params
        .domain
        .as_deref()
        .map(|d| d.trim().trim_end_matches('.').to_lowercase())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| AppError::Validation("domain is required".to_string()))?;
    if !is_valid_domain(&domain) {
        return Err(AppError::Validation(format!("invalid domain: {domain}")));
    }
    let qtype = RecordType::from_str(&params.qtype.to_ascii_uppercase())
        .map_err(|_| AppError::Validation(format!("unsupported record type: {}", params.qtype)))?;

    let port = listen_port(&state.resolver_config_path).await;
    let server = SocketAddr::new(state.query_addr, port);
    Ok(Json(probe::query(server, &domain, qtype, state.probe_timeout).await))
}

/// Latency to every configured upstream, probed concurrently.
pub async fn ping(State(state): State<Arc<AppState>>) -> Json<Vec<PingResult>> {
    Json(probe::ping_all(state.probe_targets.clone(), state.probe_timeout).await)
}
