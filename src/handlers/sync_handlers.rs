//! Stateless batch-sync protocol. The caller owns the cursor and polls
//! until `processedCount < batchSize` or `halted`.

use crate::{
    errors::AppError,
    models::sync::{BatchRequest, BatchResult, SyncStatus},
    state::AppState,
};
use axum::{Json, extract::State};

/// `POST /sync/batch`
pub async fn sync_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResult>, AppError> {
    Ok(Json(state.engine.run_batch(request).await?))
}

/// `GET /sync/status`
pub async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    Ok(Json(state.engine.status().await?))
}
