use crate::api::auth::TokenVerifier;
use crate::ids::IdCipher;
use crate::process::DocumentPipeline;
use crate::store::{DocumentRepository, UserRepository};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Default request body cap: 50 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<DocumentPipeline>,
    pub users: UserRepository,
    pub documents: DocumentRepository,
    pub ids: IdCipher,
    pub tokens: TokenVerifier,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        pipeline: DocumentPipeline,
        pool: SqlitePool,
        ids: IdCipher,
        tokens: TokenVerifier,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            users: UserRepository::new(pool.clone()),
            documents: DocumentRepository::new(pool),
            ids,
            tokens,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes.max(1024);
        self
    }
}
