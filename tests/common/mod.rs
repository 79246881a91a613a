//! Shared fixtures for the integration tests: a scripted model backend, a
//! fake PDF pager and an in-memory database with a temp media root.

#![allow(dead_code)]

use async_trait::async_trait;
use docintake::model::{NewUser, User, UserTier};
use docintake::pipeline::inference::{BackendError, InferenceRequest};
use docintake::pipeline::limit::{PagerError, PdfPager};
use docintake::quota::{DEFAULT_MAX_DOCUMENTS, UNLIMITED_MAX_DOCUMENTS};
use docintake::store::{self, UserRepository};
use docintake::{
    DocumentPipeline, FileStore, InferenceBackend, PageLimiter, PipelineConfig, PromptCatalog,
};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const MODEL: &str = "gemini-test";

// ── Model backend ────────────────────────────────────────────────────────────

/// Replays scripted replies in order, then repeats `fallback` forever.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<Value, BackendError>>>,
    fallback: Result<Value, BackendError>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(
        script: Vec<Result<Value, BackendError>>,
        fallback: Result<Value, BackendError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answers with `reply`.
    pub fn always(reply: Result<Value, BackendError>) -> Arc<Self> {
        Self::new(Vec::new(), reply)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn model_id(&self) -> &str {
        MODEL
    }

    async fn generate(&self, _request: &InferenceRequest) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A generateContent body whose only text part is `text`.
pub fn reply(text: &str) -> Result<Value, BackendError> {
    Ok(json!({
        "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}],
        "usageMetadata": {"promptTokenCount": 1200, "candidatesTokenCount": 80, "totalTokenCount": 1280}
    }))
}

/// Same as [`reply`] but without usage metadata.
pub fn reply_without_usage(text: &str) -> Result<Value, BackendError> {
    Ok(json!({
        "candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]
    }))
}

pub fn invoice_reply() -> Result<Value, BackendError> {
    reply("```json\n{\"invoice_number\": \"INV-1042\", \"total\": 118.5}\n```")
}

pub fn rate_limited() -> Result<Value, BackendError> {
    Err(BackendError::new(
        Some(429),
        "Resource has been exhausted (e.g. check quota).",
    ))
}

// ── PDF fixtures ─────────────────────────────────────────────────────────────

/// Encodes the page count in the bytes: `%PDF-fake:<pages>`.
pub struct FakePager;

pub fn fake_pdf(pages: u32) -> Vec<u8> {
    format!("%PDF-fake:{pages}").into_bytes()
}

impl PdfPager for FakePager {
    fn page_count(&self, pdf: &[u8]) -> Result<u32, PagerError> {
        std::str::from_utf8(pdf)
            .ok()
            .and_then(|s| s.strip_prefix("%PDF-fake:"))
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| PagerError::Parse("not a fake pdf".into()))
    }

    fn first_pages(&self, pdf: &[u8], keep: u32) -> Result<Vec<u8>, PagerError> {
        self.page_count(pdf)?;
        Ok(fake_pdf(keep))
    }
}

/// PNG signature followed by filler; enough for content sniffing.
pub fn tiny_png() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(&[0u8; 32]);
    bytes
}

// ── Pipeline harness ─────────────────────────────────────────────────────────

/// Retries in milliseconds rather than seconds.
pub fn fast_config(max_retries: u32) -> PipelineConfig {
    PipelineConfig::builder()
        .max_retries(max_retries)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
        .unwrap()
}

pub struct Harness {
    pub pool: SqlitePool,
    pub media: TempDir,
    pub backend: Arc<ScriptedBackend>,
}

impl Harness {
    pub async fn new(backend: Arc<ScriptedBackend>) -> Self {
        let pool = store::connect_in_memory().await.unwrap();
        Self {
            pool,
            media: TempDir::new().unwrap(),
            backend,
        }
    }

    pub fn pipeline(&self, config: PipelineConfig) -> DocumentPipeline {
        DocumentPipeline::new(
            config,
            Arc::new(PromptCatalog::builtin().unwrap()),
            self.backend.clone(),
            self.pool.clone(),
            FileStore::new(self.media.path()),
        )
        .with_limiter(PageLimiter::new(Arc::new(FakePager)))
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// A user of `tier` who has already processed `documents` documents.
    pub async fn user(&self, name: &str, tier: UserTier, documents: i64) -> User {
        let limit = if tier.is_privileged() {
            UNLIMITED_MAX_DOCUMENTS
        } else {
            DEFAULT_MAX_DOCUMENTS
        };
        let user = self
            .users()
            .create(&NewUser {
                username: name.into(),
                email: format!("{name}@example.com"),
                tier,
                max_documents_allowed: limit,
            })
            .await
            .unwrap();
        sqlx::query("UPDATE users SET documents_processed = ? WHERE id = ?")
            .bind(documents)
            .bind(user.id)
            .execute(&self.pool)
            .await
            .unwrap();
        self.reload(&user).await
    }

    pub async fn reload(&self, user: &User) -> User {
        self.users().find(user.id).await.unwrap().unwrap()
    }

    pub async fn document_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    /// Files currently under the upload directory.
    pub fn stored_files(&self) -> usize {
        count_files(&self.media.path().join(docintake::files::UPLOAD_DIR))
    }
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}
