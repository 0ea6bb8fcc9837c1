use axum::{extract::{rejection::JsonRejection, State}, Json};
use std::sync::Arc;
use crate::api::AppState;
use crate::error::AppResult;
use crate::rules::{CompileOutcome, RuleBundle};

/// Regenerate the managed directive file from the full bundle. Compile and
/// reload problems are reported in the body with `ok: false`.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RuleBundle>, JsonRejection>,
) -> AppResult<Json<CompileOutcome>> {
    let Json(bundle) = body?;
    Ok(Json(state.rules.apply(&bundle).await))
}
