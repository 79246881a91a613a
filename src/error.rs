//! Error types for the docintake library.
//!
//! Errors live at two levels:
//!
//! * Stage errors such as [`InferenceError`], [`NormalizeError`] and
//!   [`PagerError`](crate::pipeline::limit::PagerError) sit next to the code
//!   that raises them. They keep the full provider or parser detail for the
//!   server log.
//!
//! * [`PipelineError`] is the taxonomy every pipeline entry point returns.
//!   Stage errors are re-classified into it at the pipeline boundary, and the
//!   HTTP layer maps each variant to exactly one status code. Variants that
//!   end up as a 5xx never have their inner text shown to a caller.

use crate::pipeline::inference::InferenceError;
use crate::pipeline::normalize::NormalizeError;
use thiserror::Error;

/// All errors returned by [`crate::process::DocumentPipeline`] and the
/// handlers built on top of it.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Missing upload, unknown extension, or content that does not match it.
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// An opaque document identifier could not be decoded or decrypted.
    #[error("Invalid or corrupted document ID")]
    InvalidIdentifier,

    // ── Access errors ─────────────────────────────────────────────────────
    /// A default-tier user has reached the document limit.
    #[error("{message}")]
    QuotaExceeded {
        message: String,
        documents_processed: i64,
        max_documents_allowed: i64,
    },

    /// The caller's tier or ownership does not permit the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Full-document reprocessing was requested for a document that is
    /// already complete.
    #[error("Document has already been processed in full")]
    AlreadyFullDocument,

    // ── Inference errors ──────────────────────────────────────────────────
    /// Every attempt against the model endpoint was rate limited.
    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// The model endpoint failed for a reason other than rate limiting.
    #[error("Inference failed: {message}")]
    InferenceFailure { message: String },

    /// The model answered, but its text could not be read as a JSON object.
    #[error("Malformed model output: {0}")]
    MalformedModelOutput(String),

    // ── Storage errors ────────────────────────────────────────────────────
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed, or no prompt template resolves.
    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable code, included in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedInput(_) => "unsupported_input",
            PipelineError::InvalidIdentifier => "invalid_identifier",
            PipelineError::QuotaExceeded { .. } => "quota_exceeded",
            PipelineError::Forbidden(_) => "forbidden",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::AlreadyFullDocument => "already_full_document",
            PipelineError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            PipelineError::InferenceFailure { .. } => "inference_failure",
            PipelineError::MalformedModelOutput(_) => "malformed_model_output",
            PipelineError::PersistenceFailure(_) => "persistence_failure",
            PipelineError::Misconfigured(_) => "misconfigured",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// True for failures caused by infrastructure rather than by the caller.
    pub fn is_server_side(&self) -> bool {
        matches!(
            self,
            PipelineError::RateLimitExceeded { .. }
                | PipelineError::InferenceFailure { .. }
                | PipelineError::PersistenceFailure(_)
                | PipelineError::Misconfigured(_)
                | PipelineError::Internal(_)
        )
    }
}

impl From<InferenceError> for PipelineError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::RateLimitExceeded { attempts, .. } => {
                PipelineError::RateLimitExceeded { attempts }
            }
            InferenceError::Failed { message, .. } => PipelineError::InferenceFailure { message },
        }
    }
}

impl From<NormalizeError> for PipelineError {
    fn from(e: NormalizeError) -> Self {
        PipelineError::MalformedModelOutput(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::PersistenceFailure(e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::PersistenceFailure(format!("file store: {e}"))
    }
}
