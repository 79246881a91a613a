use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::report::{self, UsageStats, ACTIVE_WINDOW_DAYS};
use axum::extract::State;
use axum::Json;
use chrono::{Duration, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct UsageStatsResponse {
    pub status: &'static str,
    pub usage_stats: UsageStats,
}

/// `GET /api/usage-stats`: the caller's own usage.
pub async fn usage_stats(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UsageStatsResponse>, ApiError> {
    let now = Utc::now();
    let recent = state
        .documents
        .count_since(user.id, now - Duration::days(ACTIVE_WINDOW_DAYS))
        .await?;
    let last = state.documents.latest_entry(user.id).await?;

    Ok(Json(UsageStatsResponse {
        status: "success",
        usage_stats: report::usage_stats(state.pipeline.ledger(), &user, recent, last, now),
    }))
}
