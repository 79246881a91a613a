//! # docintake
//!
//! Extract structured JSON from uploaded PDFs and images with a generative
//! model, under per-tier usage quotas.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload (PDF / JPEG / PNG)
//!  │
//!  ├─ 1. Validate  extension + content sniffing, quota gate
//!  ├─ 2. Limit     first 3 pages for capped runs (pdfium, spawn_blocking)
//!  ├─ 3. Invoke    Gemini generateContent with retry, backoff and jitter
//!  ├─ 4. Normalize strip fences, parse JSON, unwrap single-item lists
//!  ├─ 5. Persist   JSON export + one document row
//!  └─ 6. Account   atomic counter increment
//! ```
//!
//! Default-tier users get a fixed number of documents (20 unless changed by
//! an admin) and only the first pages of each PDF. Power and admin users are
//! uncapped and can ask for the full document up front or later via
//! [`DocumentPipeline::reprocess_full_document`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docintake::pipeline::gemini::{GeminiBackend, DEFAULT_MODEL};
//! use docintake::{Extractor, InputArtifact, NoopProgress, PipelineConfig, PromptCatalog};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = GeminiBackend::new(
//!         std::env::var("GEMINI_API_KEY")?,
//!         DEFAULT_MODEL,
//!         Duration::from_secs(120),
//!     )?;
//!     let extractor = Extractor::new(Arc::new(backend), PipelineConfig::default());
//!
//!     let bytes = std::fs::read("invoice.pdf")?;
//!     let artifact = InputArtifact::from_upload("invoice.pdf", bytes)?;
//!     let prompt = PromptCatalog::builtin()?.resolve(None, None)?;
//!
//!     let extraction = extractor.extract(&artifact, &prompt, Some(3), &NoopProgress).await?;
//!     println!("{}", serde_json::to_string_pretty(&extraction.json)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docintake` binary (clap + anyhow + tracing-subscriber + indicatif + dotenvy) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod api;
pub mod config;
pub mod error;
pub mod files;
pub mod ids;
pub mod model;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod prompts;
pub mod quota;
pub mod report;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::PipelineError;
pub use files::FileStore;
pub use ids::IdCipher;
pub use model::{Document, UsageSnapshot, User, UserTier};
pub use pipeline::inference::{InferenceBackend, InferenceClient, RetryPolicy};
pub use pipeline::input::InputArtifact;
pub use pipeline::limit::PageLimiter;
pub use process::{DocumentPipeline, Extraction, Extractor, ProcessingRequest};
pub use progress::{NoopProgress, ProgressLog, ProgressSink};
pub use prompts::PromptCatalog;
pub use quota::{QuotaDecision, QuotaLedger};
