use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::history::{HistoryStats, TransferRecord};

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub transfers: Vec<TransferRecord>,
    pub stats: HistoryStats,
}

/// Recent completed transfers, newest first.
pub async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(history) = &state.history else {
        return Err(StatusCode::NOT_FOUND);
    };
    let limit = params.limit.unwrap_or(20).clamp(1, 100);

    let transfers = history.recent(limit).await.map_err(|e| {
        tracing::error!("Failed to list transfer history: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let stats = history.stats().await.map_err(|e| {
        tracing::error!("Failed to read transfer stats: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(HistoryResponse { transfers, stats }))
}
