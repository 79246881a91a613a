//! Admin-only endpoints: the user report and user management.

use crate::api::auth::AuthUser;
use crate::api::error::{ApiError, ApiJson};
use crate::api::state::AppState;
use crate::error::PipelineError;
use crate::model::{User, UserTier};
use crate::quota::{DEFAULT_MAX_DOCUMENTS, UNLIMITED_MAX_DOCUMENTS};
use crate::report::{self, UserReport};
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

fn require_admin(user: &User) -> Result<(), PipelineError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(PipelineError::Forbidden("Admin access required".into()))
    }
}

#[derive(Debug, Serialize)]
pub struct UserReportResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: UserReport,
}

/// `GET /api/admin/user-report`.
pub async fn user_report(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<UserReportResponse>, ApiError> {
    require_admin(&user)?;

    let users = state.users.list().await?;
    let totals = state.documents.totals_by_user().await?;
    let report = report::user_report(state.pipeline.ledger(), &users, &totals, Utc::now());
    info!(admin_id = user.id, users = users.len(), "User report generated");

    Ok(Json(UserReportResponse {
        status: "success",
        report,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ManageUserBody {
    #[serde(default)]
    pub user_id: Option<Value>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub new_type: Option<String>,
    #[serde(default)]
    pub new_limit: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ManageUserResponse {
    pub status: &'static str,
    pub message: String,
    pub user_info: Value,
}

/// `POST /api/admin/manage-user`: `change_type`, `update_limit` or `reset_usage`.
pub async fn manage_user(
    State(state): State<AppState>,
    AuthUser(admin): AuthUser,
    ApiJson(body): ApiJson<ManageUserBody>,
) -> Result<Json<ManageUserResponse>, ApiError> {
    require_admin(&admin)?;

    let target_id = body.user_id.as_ref().and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });
    let (Some(target_id), Some(action)) = (target_id, body.action.as_deref()) else {
        return Err(ApiError::BadRequest("user_id and action are required".into()));
    };

    let target = state
        .users
        .find(target_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound("User not found".into()))?;
    let not_found = || PipelineError::NotFound("User not found".into());

    let response = match action {
        "change_type" => {
            let new_type: UserTier = body
                .new_type
                .as_deref()
                .unwrap_or_default()
                .parse()
                .map_err(ApiError::BadRequest)?;
            let limit = if new_type.is_privileged() {
                UNLIMITED_MAX_DOCUMENTS
            } else {
                DEFAULT_MAX_DOCUMENTS
            };
            let updated = state
                .users
                .set_tier(target.id, new_type, limit)
                .await?
                .ok_or_else(not_found)?;
            info!(
                admin = %admin.username,
                target = %updated.username,
                from = %target.tier,
                to = %new_type,
                "User type changed"
            );
            ManageUserResponse {
                status: "success",
                message: format!("User type changed from {} to {}", target.tier, new_type),
                user_info: json!({
                    "id": updated.id,
                    "username": updated.username,
                    "user_type": updated.tier,
                    "max_documents_allowed": updated.max_documents_allowed,
                }),
            }
        }
        "update_limit" => {
            let new_limit = body
                .new_limit
                .as_ref()
                .and_then(Value::as_i64)
                .filter(|n| *n >= 0)
                .ok_or_else(|| {
                    ApiError::BadRequest("new_limit must be a non-negative integer".into())
                })?;
            let updated = state
                .users
                .set_limit(target.id, new_limit)
                .await?
                .ok_or_else(not_found)?;
            info!(
                admin = %admin.username,
                target = %updated.username,
                from = target.max_documents_allowed,
                to = new_limit,
                "Document limit changed"
            );
            ManageUserResponse {
                status: "success",
                message: format!(
                    "Document limit updated from {} to {}",
                    target.max_documents_allowed, new_limit
                ),
                user_info: json!({
                    "id": updated.id,
                    "username": updated.username,
                    "max_documents_allowed": updated.max_documents_allowed,
                    "documents_processed": updated.documents_processed,
                }),
            }
        }
        "reset_usage" => {
            let updated = state
                .pipeline
                .ledger()
                .reset(target.id)
                .await?
                .ok_or_else(not_found)?;
            info!(admin = %admin.username, target = %updated.username, "Usage reset");
            ManageUserResponse {
                status: "success",
                message: format!(
                    "Usage reset. Documents: {}→0, Pages: {}→0",
                    target.documents_processed, target.total_pages_processed
                ),
                user_info: json!({
                    "id": updated.id,
                    "username": updated.username,
                    "documents_processed": updated.documents_processed,
                    "total_pages_processed": updated.total_pages_processed,
                }),
            }
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Invalid action. Must be 'change_type', 'update_limit', or 'reset_usage'".into(),
            ))
        }
    };

    Ok(Json(response))
}
