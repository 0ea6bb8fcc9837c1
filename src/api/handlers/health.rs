use axum::{http::Uri, Json};
use serde_json::{json, Value};
use crate::error::AppError;

pub async fn health_check() -> Json<Value> {
    Json(json!({"ok": true, "version": env!("CARGO_PKG_VERSION")}))
}

pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(uri.path().to_string())
}
