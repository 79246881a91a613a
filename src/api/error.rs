//! HTTP error rendering.
//!
//! Handlers return `Result<_, ApiError>`. Every error becomes
//! `{ "status": "error", "error": <message>, "code": <code> }` with a status
//! derived from the variant. Server-side failures are logged in full and
//! shown to the client only as a generic message.

use crate::error::PipelineError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid credentials.
    Unauthorized(String),
    /// Malformed request outside the pipeline taxonomy.
    BadRequest(String),
    Pipeline(PipelineError),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Pipeline(e.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(format!("Invalid request body: {}", rejection.body_text()))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_info: Option<serde_json::Value>,
}

/// Status code for each pipeline variant.
pub fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::QuotaExceeded { .. } | PipelineError::Forbidden(_) => StatusCode::FORBIDDEN,
        PipelineError::UnsupportedInput(_)
        | PipelineError::MalformedModelOutput(_)
        | PipelineError::InvalidIdentifier
        | PipelineError::AlreadyFullDocument => StatusCode::BAD_REQUEST,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::RateLimitExceeded { .. }
        | PipelineError::InferenceFailure { .. }
        | PipelineError::PersistenceFailure(_)
        | PipelineError::Misconfigured(_)
        | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// What the client is allowed to see.
fn client_message(e: &PipelineError) -> String {
    match e {
        PipelineError::UnsupportedInput(m)
        | PipelineError::Forbidden(m)
        | PipelineError::NotFound(m) => m.clone(),
        PipelineError::QuotaExceeded { message, .. } => message.clone(),
        PipelineError::InvalidIdentifier => "Invalid or corrupted document ID".into(),
        PipelineError::AlreadyFullDocument => "Document already processed as full document".into(),
        PipelineError::MalformedModelOutput(_) => {
            "Invalid data received from document processor".into()
        }
        PipelineError::RateLimitExceeded { .. } => {
            "The document processor is busy. Please retry later.".into()
        }
        PipelineError::InferenceFailure { .. } => {
            "The document processor is unavailable. Please retry later.".into()
        }
        PipelineError::PersistenceFailure(_) => {
            "The document could not be saved. Please retry later.".into()
        }
        PipelineError::Misconfigured(_) | PipelineError::Internal(_) => {
            "An internal error occurred. Please try again later.".into()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Unauthorized(m) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    status: "error",
                    error: m.clone(),
                    code: "unauthorized",
                    usage_info: None,
                },
            ),
            ApiError::BadRequest(m) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    status: "error",
                    error: m.clone(),
                    code: "bad_request",
                    usage_info: None,
                },
            ),
            ApiError::Pipeline(e) => {
                let status = status_for(e);
                if status.is_server_error() {
                    error!(code = e.code(), error = %e, "Request failed");
                } else {
                    warn!(code = e.code(), error = %e, "Request rejected");
                }
                let usage_info = match e {
                    PipelineError::QuotaExceeded {
                        documents_processed,
                        max_documents_allowed,
                        ..
                    } => Some(json!({
                        "documents_processed": documents_processed,
                        "max_documents_allowed": max_documents_allowed,
                        "can_process_more": false,
                    })),
                    _ => None,
                };
                (
                    status,
                    ErrorBody {
                        status: "error",
                        error: client_message(e),
                        code: e.code(),
                        usage_info,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// `Json<T>` whose rejection renders as an [`ApiError`].
#[derive(Debug, Clone, Copy)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(inner) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(inner))
    }
}
