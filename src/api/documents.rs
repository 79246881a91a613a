//! Document listing and retrieval.

use crate::api::auth::AuthUser;
use crate::api::error::{ApiError, ApiJson};
use crate::api::state::AppState;
use crate::error::PipelineError;
use crate::ids::IdCipher;
use crate::model::{Document, UsageSnapshot, User};
use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// A document as listed to clients, with its id encrypted.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub id: String,
    pub userid: i64,
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub filename: String,
    pub json_data: Value,
    pub entry_date: DateTime<Utc>,
    pub document_type: String,
    pub input_token: i64,
    pub output_token: i64,
    pub api_response_time: f64,
    pub db_save_time: f64,
    pub llm_model_used: String,
    pub pages_processed: i64,
    pub is_full_document: bool,
}

impl DocumentView {
    fn new(doc: Document, ids: &IdCipher) -> Result<Self, PipelineError> {
        let filename = doc
            .file_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            id: ids.encrypt(doc.id)?,
            userid: doc.user_id,
            file_path: doc.file_path,
            filename,
            json_data: doc.json_data,
            entry_date: doc.entry_date,
            document_type: doc.document_type,
            input_token: doc.input_token,
            output_token: doc.output_token,
            api_response_time: doc.api_response_time,
            db_save_time: doc.db_save_time,
            llm_model_used: doc.llm_model_used,
            pages_processed: doc.pages_processed,
            is_full_document: doc.is_full_document,
        })
    }
}

fn views(docs: Vec<Document>, ids: &IdCipher) -> Result<Vec<DocumentView>, PipelineError> {
    docs.into_iter().map(|d| DocumentView::new(d, ids)).collect()
}

fn ensure_owner_or_admin(user: &User, owner_id: i64, what: &str) -> Result<(), PipelineError> {
    if user.is_admin() || user.id == owner_id {
        Ok(())
    } else {
        warn!(user_id = user.id, owner_id, "Access denied");
        Err(PipelineError::Forbidden(format!(
            "You do not have permission to view {what}."
        )))
    }
}

#[derive(Debug, Serialize)]
pub struct DocumentListResponse {
    pub count: usize,
    pub documents: Vec<DocumentView>,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub user_usage: UsageSnapshot,
}

/// `GET /api/documents`: own documents, or every document for admins.
pub async fn list_documents(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let docs = if user.is_admin() {
        state.documents.list_all().await?
    } else {
        state.documents.list_for_user(user.id).await?
    };

    let total_input_tokens = docs.iter().map(|d| d.input_token).sum();
    let total_output_tokens = docs.iter().map(|d| d.output_token).sum();
    let documents = views(docs, &state.ids)?;
    info!(user_id = user.id, count = documents.len(), "Documents listed");

    Ok(Json(DocumentListResponse {
        count: documents.len(),
        documents,
        total_input_tokens,
        total_output_tokens,
        user_usage: state.pipeline.ledger().usage_snapshot(&user),
    }))
}

#[derive(Debug, Serialize)]
pub struct DocumentDetailResponse {
    pub status: &'static str,
    pub filepath: String,
    pub json_data: Value,
    pub input_token: i64,
    pub output_token: i64,
    pub api_response_time: f64,
    pub db_save_time: f64,
    pub llm_model_used: String,
    pub pages_processed: i64,
    pub is_full_document: bool,
}

/// `GET /api/get-document/{doc_id}`.
pub async fn get_document(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentDetailResponse>, ApiError> {
    let id = state.ids.decrypt(&doc_id)?;
    let doc = state
        .documents
        .find(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound("Document not found".into()))?;
    ensure_owner_or_admin(&user, doc.user_id, "this document")?;

    Ok(Json(DocumentDetailResponse {
        status: "success",
        filepath: doc.file_path,
        json_data: doc.json_data,
        input_token: doc.input_token,
        output_token: doc.output_token,
        api_response_time: doc.api_response_time,
        db_save_time: doc.db_save_time,
        llm_model_used: doc.llm_model_used,
        pages_processed: doc.pages_processed,
        is_full_document: doc.is_full_document,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FilterBody {
    /// Accepted as a JSON number or a numeric string.
    #[serde(default)]
    pub userid: Option<Value>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilterResponse {
    pub count: usize,
    pub documents: Vec<DocumentView>,
}

fn parse_user_id(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `POST /api/document-filter`: one user's documents on one day.
pub async fn filter_documents(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiJson(body): ApiJson<FilterBody>,
) -> Result<Json<FilterResponse>, ApiError> {
    let (Some(raw_user), Some(raw_date)) = (
        body.userid.filter(|v| !v.is_null() && v.as_str() != Some("")),
        body.date.filter(|d| !d.trim().is_empty()),
    ) else {
        return Err(ApiError::BadRequest(
            "Both 'userid' and 'date' fields are required in the request body.".into(),
        ));
    };

    let day = NaiveDate::parse_from_str(raw_date.trim(), "%Y-%m-%d")
        .map_err(|_| ApiError::BadRequest("Invalid date format. Please use ISO-MM-DD.".into()))?;
    let owner_id = parse_user_id(&raw_user)
        .ok_or_else(|| ApiError::BadRequest("Invalid user ID. It must be an integer.".into()))?;
    ensure_owner_or_admin(&user, owner_id, "these documents")?;

    let documents = views(
        state.documents.list_for_user_on(owner_id, day).await?,
        &state.ids,
    )?;
    info!(owner_id, %day, count = documents.len(), "Documents filtered");

    Ok(Json(FilterResponse {
        count: documents.len(),
        documents,
    }))
}
