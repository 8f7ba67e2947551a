use std::sync::Arc;

use axum::extract::State;

use super::AppError;
use crate::services::AppState;

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn store_health(State(state): State<Arc<AppState>>) -> Result<&'static str, AppError> {
    state.store.ping().await.map_err(|e| {
        tracing::warn!(error = %e, "store health check failed");
        AppError::unavailable(e)
    })?;
    Ok("OK")
}
