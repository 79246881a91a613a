//! Document pipeline orchestration.
//!
//! ```text
//! upload
//!  │
//!  ├─ Validating     type + content check, quota gate
//!  ├─ Limiting       first N pages for capped runs (spawn_blocking)
//!  ├─ Invoking       model call with retry/backoff
//!  ├─ Normalizing    fences, JSON parse, list unwrap
//!  ├─ Persisting     JSON export + single INSERT
//!  └─ UpdatingQuota  atomic counter increment
//! ```
//!
//! Quota is consumed only after the document row exists. A run that fails
//! at any stage before that leaves no row, no stored file and no charge.
//!
//! [`Extractor`] owns the Limiting → Invoking → Normalizing core and is usable
//! on its own (the CLI `extract` command); [`DocumentPipeline`] wraps it with
//! quota, storage and persistence.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::files::FileStore;
use crate::model::{Document, FullDocumentUpdate, NewDocument, UsageSnapshot, User};
use crate::pipeline::inference::{
    ContentPart, InferenceBackend, InferenceClient, InferenceRequest,
};
use crate::pipeline::input::InputArtifact;
use crate::pipeline::limit::PageLimiter;
use crate::pipeline::normalize::parse_model_json;
use crate::progress::ProgressSink;
use crate::prompts::{PromptCatalog, DEFAULT_DOCUMENT_TYPE};
use crate::quota::QuotaLedger;
use crate::store::{DocumentRepository, UserRepository};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Message returned alongside `can_load_full_document`.
pub fn load_full_document_hint(pages: u32) -> String {
    format!("Processed first {pages} pages. You can load the full document if needed.")
}

/// Warning attached to a successful run whose counters could not be updated.
pub const USAGE_NOT_RECORDED_WARNING: &str =
    "Document saved, but usage counters could not be updated.";

/// Pipeline state, used to label log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Limiting,
    Invoking,
    Normalizing,
    Persisting,
    UpdatingQuota,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validating => "validating",
            Stage::Limiting => "limiting",
            Stage::Invoking => "invoking",
            Stage::Normalizing => "normalizing",
            Stage::Persisting => "persisting",
            Stage::UpdatingQuota => "updating_quota",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn enter(stage: &mut Stage, next: Stage) {
    debug!(from = %stage, to = %next, "Pipeline transition");
    *stage = next;
}

// ── Extraction core ──────────────────────────────────────────────────────────

/// Structured data extracted from one document.
#[derive(Debug, Clone, Serialize)]
pub struct Extraction {
    pub json: serde_json::Value,
    pub pages_processed: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Seconds spent in the model call, retries included.
    pub api_response_time: f64,
    pub model: String,
    pub attempts: u32,
}

/// Limit → invoke → normalize, with no storage or accounting.
#[derive(Debug, Clone)]
pub struct Extractor {
    inference: InferenceClient,
    limiter: PageLimiter,
    config: PipelineConfig,
}

impl Extractor {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: PipelineConfig) -> Self {
        Self {
            inference: InferenceClient::new(backend, config.retry.clone()),
            limiter: PageLimiter::default(),
            config,
        }
    }

    pub fn with_limiter(mut self, limiter: PageLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn model_id(&self) -> &str {
        self.inference.model_id()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Extract from `artifact` using `prompt`, sending at most `max_pages`
    /// pages (`None` = all).
    pub async fn extract(
        &self,
        artifact: &InputArtifact,
        prompt: &str,
        max_pages: Option<u32>,
        progress: &dyn ProgressSink,
    ) -> Result<Extraction, PipelineError> {
        let mut stage = Stage::Validating;
        self.run(artifact, prompt, max_pages, progress, &mut stage)
            .await
            .inspect_err(|e| error!(%stage, error = %e, "Extraction failed"))
    }

    async fn run(
        &self,
        artifact: &InputArtifact,
        prompt: &str,
        max_pages: Option<u32>,
        progress: &dyn ProgressSink,
        stage: &mut Stage,
    ) -> Result<Extraction, PipelineError> {
        enter(stage, Stage::Limiting);
        progress.report("Processing input data...");
        let limited = self.limiter.limit(artifact, max_pages).await;
        info!(
            file = %artifact.file_name,
            pages = limited.page_count,
            truncated = limited.is_derived(),
            "Input prepared"
        );

        enter(stage, Stage::Invoking);
        let request = InferenceRequest {
            prompt: prompt.to_string(),
            parts: vec![ContentPart::Binary {
                mime_type: limited.mime_type.to_string(),
                data: limited.bytes.clone(),
            }],
            options: self.config.generation.clone(),
        };
        let started = Instant::now();
        let outcome = self
            .inference
            .invoke(&request, limited.page_count, progress)
            .await?;
        let api_response_time = started.elapsed().as_secs_f64();
        drop(limited);

        enter(stage, Stage::Normalizing);
        let text = outcome.primary_text().ok_or_else(|| {
            PipelineError::MalformedModelOutput("model returned no text".into())
        })?;
        let json = serde_json::Value::Object(parse_model_json(&text)?);
        progress.report("Document processing completed successfully!");

        Ok(Extraction {
            json,
            pages_processed: outcome.page_count,
            input_tokens: outcome.prompt_tokens,
            output_tokens: outcome.candidate_tokens,
            api_response_time,
            model: self.inference.model_id().to_string(),
            attempts: outcome.attempts,
        })
    }
}

// ── Full pipeline ────────────────────────────────────────────────────────────

/// One upload as received from the client.
#[derive(Debug, Clone, Default)]
pub struct ProcessingRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Document-type label, e.g. `"Bill Reimbursment"`.
    pub document_type: Option<String>,
    pub prompt_override: Option<String>,
    /// Ignored for default-tier users.
    pub process_full_document: bool,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub document: Document,
    pub pages_processed: u32,
    pub usage: UsageSnapshot,
    pub warning: Option<String>,
    /// Set when a privileged user ran a limited job that hit the page cap.
    pub can_load_full_document: bool,
}

#[derive(Debug, Clone)]
pub struct ReprocessOutcome {
    pub document: Document,
    pub pages_before: i64,
    pub pages_processed: u32,
    pub usage: UsageSnapshot,
    pub warning: Option<String>,
}

/// The complete upload and reprocessing workflow.
#[derive(Debug, Clone)]
pub struct DocumentPipeline {
    prompts: Arc<PromptCatalog>,
    extractor: Extractor,
    ledger: QuotaLedger,
    documents: DocumentRepository,
    files: FileStore,
}

impl DocumentPipeline {
    pub fn new(
        config: PipelineConfig,
        prompts: Arc<PromptCatalog>,
        backend: Arc<dyn InferenceBackend>,
        pool: SqlitePool,
        files: FileStore,
    ) -> Self {
        let ledger = QuotaLedger::new(
            UserRepository::new(pool.clone()),
            config.default_max_documents,
        );
        Self {
            prompts,
            extractor: Extractor::new(backend, config),
            ledger,
            documents: DocumentRepository::new(pool),
            files,
        }
    }

    /// Swap the page limiter (tests use a fake pager).
    pub fn with_limiter(mut self, limiter: PageLimiter) -> Self {
        self.extractor = self.extractor.with_limiter(limiter);
        self
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn documents(&self) -> &DocumentRepository {
        &self.documents
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn model_id(&self) -> &str {
        self.extractor.model_id()
    }

    fn config(&self) -> &PipelineConfig {
        self.extractor.config()
    }

    /// Validate, extract, persist and charge one upload.
    #[tracing::instrument(
        skip(self, user, request, progress),
        fields(user_id = user.id, file = %request.file_name, full = request.process_full_document)
    )]
    pub async fn process_upload(
        &self,
        user: &User,
        request: ProcessingRequest,
        progress: &dyn ProgressSink,
    ) -> Result<UploadOutcome, PipelineError> {
        let mut stage = Stage::Validating;
        progress.report("Preparing document for processing...");

        let artifact = InputArtifact::from_upload(&request.file_name, request.bytes)?;

        let decision = self.ledger.check_can_process(user);
        if !decision.allowed {
            let message = decision.reason.unwrap_or_default();
            warn!(user_id = user.id, %message, "Upload refused by quota");
            return Err(PipelineError::QuotaExceeded {
                message,
                documents_processed: user.documents_processed,
                max_documents_allowed: self.ledger.effective_limit(user),
            });
        }

        let full = request.process_full_document && user.tier.is_privileged();
        let max_pages = if full {
            None
        } else {
            Some(self.config().max_pages_limited)
        };
        let prompt = self.prompts.resolve(
            request.document_type.as_deref(),
            request.prompt_override.as_deref(),
        )?;
        let document_type = request
            .document_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_DOCUMENT_TYPE)
            .to_string();

        let stored = self
            .files
            .save_upload(&artifact.file_name, &artifact.bytes)
            .await?;

        let result = async {
            let extraction = self
                .extractor
                .run(&artifact, &prompt, max_pages, progress, &mut stage)
                .await?;

            enter(&mut stage, Stage::Persisting);
            self.files.write_json_export(&stored, &extraction.json).await?;
            let document = self
                .documents
                .create(&NewDocument {
                    user_id: user.id,
                    file_path: stored.clone(),
                    json_data: extraction.json,
                    document_type,
                    input_token: saturating_i64(extraction.input_tokens),
                    output_token: saturating_i64(extraction.output_tokens),
                    api_response_time: extraction.api_response_time,
                    llm_model_used: extraction.model,
                    pages_processed: i64::from(extraction.pages_processed),
                    is_full_document: full,
                })
                .await?;
            Ok::<_, PipelineError>((document, extraction.pages_processed))
        }
        .await;

        let (document, pages) = match result {
            Ok(v) => v,
            Err(e) => {
                error!(%stage, error = %e, "Document pipeline failed");
                enter(&mut stage, Stage::Failed);
                self.files.remove(&stored).await;
                if let Some(export) = export_path(&stored) {
                    self.files.remove(&export).await;
                }
                return Err(e);
            }
        };

        enter(&mut stage, Stage::UpdatingQuota);
        let (usage, warning) = match self.ledger.record_success(user.id, pages).await {
            Ok(updated) => (self.ledger.usage_snapshot(&updated), None),
            Err(e) => {
                error!(document_id = document.id, error = %e, "Failed to record usage");
                (
                    self.ledger.usage_snapshot(user),
                    Some(USAGE_NOT_RECORDED_WARNING.to_string()),
                )
            }
        };

        enter(&mut stage, Stage::Done);
        info!(document_id = document.id, pages, "Document processed");

        let can_load_full_document = user.tier.is_privileged()
            && !request.process_full_document
            && pages == self.config().max_pages_limited;

        Ok(UploadOutcome {
            document,
            pages_processed: pages,
            usage,
            warning,
            can_load_full_document,
        })
    }

    /// Re-run extraction over every page of a previously limited document and
    /// update it in place.
    #[tracing::instrument(skip(self, user, progress), fields(user_id = user.id))]
    pub async fn reprocess_full_document(
        &self,
        user: &User,
        document_id: i64,
        progress: &dyn ProgressSink,
    ) -> Result<ReprocessOutcome, PipelineError> {
        if !user.tier.is_privileged() {
            return Err(PipelineError::Forbidden(
                "Only power users and admins can process full documents".into(),
            ));
        }

        let doc = self
            .documents
            .find(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound("Document not found".into()))?;
        if !user.is_admin() && doc.user_id != user.id {
            return Err(PipelineError::Forbidden(
                "You do not have permission to process this document.".into(),
            ));
        }
        if doc.is_full_document {
            return Err(PipelineError::AlreadyFullDocument);
        }

        progress.report("Preparing document for processing...");
        let artifact = InputArtifact::from_stored(&self.files.absolute(&doc.file_path)).await?;
        let prompt = self.prompts.resolve(Some(&doc.document_type), None)?;
        let pages_before = doc.pages_processed;

        let mut stage = Stage::Validating;
        let extraction = self
            .extractor
            .run(&artifact, &prompt, None, progress, &mut stage)
            .await
            .inspect_err(|e| error!(%stage, error = %e, document_id, "Full reprocess failed"))?;

        // Providers occasionally omit usage metadata; keep the previous counts then.
        let (input_token, output_token) =
            if extraction.input_tokens == 0 && extraction.output_tokens == 0 {
                (doc.input_token, doc.output_token)
            } else {
                (
                    saturating_i64(extraction.input_tokens),
                    saturating_i64(extraction.output_tokens),
                )
            };

        enter(&mut stage, Stage::Persisting);
        let updated = self
            .documents
            .apply_full_update(
                doc.id,
                &FullDocumentUpdate {
                    json_data: extraction.json,
                    input_token,
                    output_token,
                    api_response_time: extraction.api_response_time,
                    llm_model_used: extraction.model,
                    pages_processed: i64::from(extraction.pages_processed),
                },
            )
            .await
            .inspect_err(|e| error!(%stage, error = %e, document_id, "Full reprocess failed"))?;
        let document = match updated {
            Some(document) => document,
            // A concurrent run flagged it first, or the row is gone.
            None => {
                return Err(match self.documents.find(doc.id).await? {
                    Some(_) => {
                        warn!(document_id, "Document became full during reprocess");
                        PipelineError::AlreadyFullDocument
                    }
                    None => PipelineError::NotFound("Document not found".into()),
                });
            }
        };

        // The row is authoritative; a stale export is logged, not fatal.
        if let Err(e) = self
            .files
            .write_json_export(&document.file_path, &document.json_data)
            .await
        {
            error!(document_id, error = %e, "Failed to write JSON export");
        }

        enter(&mut stage, Stage::UpdatingQuota);
        let delta = (i64::from(extraction.pages_processed) - pages_before).max(0);
        let (usage, warning) = if delta > 0 {
            match self.ledger.add_pages(user.id, u32::try_from(delta).unwrap_or(u32::MAX)).await {
                Ok(updated) => (self.ledger.usage_snapshot(&updated), None),
                Err(e) => {
                    error!(document_id, error = %e, "Failed to record extra pages");
                    (
                        self.ledger.usage_snapshot(user),
                        Some(USAGE_NOT_RECORDED_WARNING.to_string()),
                    )
                }
            }
        } else {
            (self.ledger.usage_snapshot(user), None)
        };

        enter(&mut stage, Stage::Done);
        info!(
            document_id,
            pages_before,
            pages_after = extraction.pages_processed,
            "Full document processed"
        );

        Ok(ReprocessOutcome {
            document,
            pages_before,
            pages_processed: extraction.pages_processed,
            usage,
            warning,
        })
    }
}

fn saturating_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn export_path(stored: &str) -> Option<String> {
    let path = std::path::Path::new(stored).with_extension("json");
    let export = path.to_string_lossy().into_owned();
    (export != stored).then_some(export)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels() {
        assert_eq!(Stage::UpdatingQuota.to_string(), "updating_quota");
        assert_eq!(Stage::Failed.to_string(), "failed");
    }

    #[test]
    fn export_path_swaps_extension() {
        assert_eq!(
            export_path("uploads/pdf_files/a_1.pdf").as_deref(),
            Some("uploads/pdf_files/a_1.json")
        );
        assert_eq!(export_path("uploads/x.json"), None);
    }

    #[test]
    fn hint_names_page_cap() {
        assert_eq!(
            load_full_document_hint(3),
            "Processed first 3 pages. You can load the full document if needed."
        );
    }

    #[test]
    fn token_counts_saturate() {
        assert_eq!(saturating_i64(12), 12);
        assert_eq!(saturating_i64(u64::MAX), i64::MAX);
    }
}
