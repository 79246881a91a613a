//! `POST /api/upload` and `POST /api/process-full-document`.

use crate::api::auth::AuthUser;
use crate::api::error::{ApiError, ApiJson};
use crate::api::state::AppState;
use crate::error::PipelineError;
use crate::model::UsageSnapshot;
use crate::process::{load_full_document_hint, ProcessingRequest};
use crate::progress::{ProgressLog, ProgressMessage};
use axum::extract::{Multipart, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub document_id: String,
    pub pages_processed: u32,
    pub is_full_document: bool,
    pub progress_messages: Vec<ProgressMessage>,
    pub usage_info: UsageSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub can_load_full_document: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Collect the multipart fields. Unknown fields are ignored.
async fn read_form(mut multipart: Multipart) -> Result<ProcessingRequest, ApiError> {
    let mut request = ProcessingRequest::default();
    let bad = |e: axum::extract::multipart::MultipartError| {
        ApiError::BadRequest(format!("Invalid multipart body: {}", e.body_text()))
    };

    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "pdf_file" => {
                request.file_name = field.file_name().unwrap_or_default().to_string();
                request.bytes = field.bytes().await.map_err(bad)?.to_vec();
            }
            "prompt_text" => request.prompt_override = Some(field.text().await.map_err(bad)?),
            "doc_type" => request.document_type = Some(field.text().await.map_err(bad)?),
            "process_full_document" => {
                let v = field.text().await.map_err(bad)?;
                request.process_full_document = v.trim().eq_ignore_ascii_case("true");
            }
            _ => {}
        }
    }

    if request.bytes.is_empty() {
        return Err(PipelineError::UnsupportedInput("Missing 'pdf_file'".into()).into());
    }
    Ok(request)
}

pub async fn upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let request = read_form(multipart).await?;
    info!(user_id = user.id, file = %request.file_name, "Upload request received");

    let progress = ProgressLog::new();
    let outcome = state
        .pipeline
        .process_upload(&user, request, &progress)
        .await?;

    let message = outcome
        .can_load_full_document
        .then(|| load_full_document_hint(outcome.pages_processed));

    Ok(Json(UploadResponse {
        status: "success",
        document_id: state.ids.encrypt(outcome.document.id)?,
        pages_processed: outcome.pages_processed,
        is_full_document: outcome.document.is_full_document,
        progress_messages: progress.into_messages(),
        usage_info: outcome.usage,
        warning: outcome.warning,
        can_load_full_document: outcome.can_load_full_document,
        message,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FullDocumentBody {
    #[serde(default)]
    pub document_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FullDocumentResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub document_id: String,
    pub pages_processed: u32,
    pub progress_messages: Vec<ProgressMessage>,
    pub usage_info: UsageSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub async fn process_full_document(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiJson(body): ApiJson<FullDocumentBody>,
) -> Result<Json<FullDocumentResponse>, ApiError> {
    let token = body
        .document_id
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing document_id".into()))?;
    if !user.tier.is_privileged() {
        return Err(PipelineError::Forbidden(
            "Only power users and admins can process full documents".into(),
        )
        .into());
    }
    let document_id = state.ids.decrypt(&token)?;

    let progress = ProgressLog::new();
    let outcome = state
        .pipeline
        .reprocess_full_document(&user, document_id, &progress)
        .await?;

    Ok(Json(FullDocumentResponse {
        status: "success",
        message: "Full document processed successfully",
        document_id: token,
        pages_processed: outcome.pages_processed,
        progress_messages: progress.into_messages(),
        usage_info: outcome.usage,
        warning: outcome.warning,
    }))
}
