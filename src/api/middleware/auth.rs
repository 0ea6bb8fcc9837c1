use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use crate::api::AppState;
use crate::error::AppError;

/// Paths reachable without a token.
const PUBLIC_PATHS: &[&str] = &["/health"];

/// Bearer-token gate for every route. With no token configured the gate is
/// open.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(next.run(req).await);
    };
    if PUBLIC_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::AuthFailed)?;

    if !constant_time_eq(presented.trim().as_bytes(), expected.as_bytes()) {
        tracing::warn!("Rejected request to {} with invalid bearer token", req.uri().path());
        return Err(AppError::AuthFailed);
    }

    Ok(next.run(req).await)
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
