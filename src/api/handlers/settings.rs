use axum::{
    extract::{rejection::JsonRejection, FromRequestParts, State},
    http::request::Parts,
    Json,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use crate::api::{AppState, BACKEND_HEADER};
use crate::db::{DbPing, SettingsBackend, StoreRead, StoreWrite};
use crate::error::{AppError, AppResult};

/// Backend chosen by the caller through the `X-Bridge-Backend` header.
/// Absent header selects the embedded database.
pub struct Backend(pub SettingsBackend);

impl FromRequestParts<Arc<AppState>> for Backend {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(BACKEND_HEADER) else {
            return Ok(Backend(SettingsBackend::Local));
        };
        let raw = raw
            .to_str()
            .map_err(|_| AppError::Validation(format!("{BACKEND_HEADER} is not valid UTF-8")))?;
        let backend = serde_json::from_str(raw)
            .map_err(|e| AppError::Validation(format!("invalid {BACKEND_HEADER} descriptor: {e}")))?;
        Ok(Backend(backend))
    }
}

pub async fn read_all(
    State(state): State<Arc<AppState>>,
    Backend(backend): Backend,
) -> AppResult<Json<StoreRead>> {
    Ok(Json(state.settings.read_all(&backend).await?))
}

/// Merge the patch into the stored settings; keys not in the patch are kept.
pub async fn write(
    State(state): State<Arc<AppState>>,
    Backend(backend): Backend,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<Json<StoreWrite>> {
    let Json(body) = body?;
    let patch: Map<String, Value> = match body {
        Value::Object(map) => map,
        other => {
            return Err(AppError::Validation(format!(
                "settings patch must be a JSON object, got {}",
                json_kind(&other)
            )));
        }
    };
    Ok(Json(state.settings.write(&backend, &patch).await?))
}

/// The descriptor travels in the body here. Always 200; failures come back
/// as `ok: false`.
pub async fn db_ping(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SettingsBackend>, JsonRejection>,
) -> AppResult<Json<DbPing>> {
    let Json(backend) = body?;
    Ok(Json(state.settings.ping(&backend).await))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
