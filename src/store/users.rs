use crate::model::{NewUser, User, UserTier};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Repository for users and their usage counters.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Provision a user with zeroed counters.
    #[tracing::instrument(skip(self, user), fields(db.table = "users", db.operation = "insert", username = %user.username))]
    pub async fn create(&self, user: &NewUser) -> Result<User, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, email, user_type, max_documents_allowed, registration_datetime)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.tier)
        .bind(user.max_documents_allowed)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select", db.record_id = id))]
    pub async fn find(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, user_type, documents_processed, total_pages_processed,
                   max_documents_allowed, registration_datetime, last_document_processed
            FROM users WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// All users, newest registration first.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select"))]
    pub async fn list(&self) -> Result<Vec<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, user_type, documents_processed, total_pages_processed,
                   max_documents_allowed, registration_datetime, last_document_processed
            FROM users ORDER BY registration_datetime DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// One more document, `pages` more pages, activity stamped at `at`.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = id))]
    pub async fn record_success(
        &self,
        id: i64,
        pages: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET documents_processed = documents_processed + 1,
                total_pages_processed = total_pages_processed + ?,
                last_document_processed = ?
            WHERE id = ?
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(pages)
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Page-only increment; the document counter is left alone.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = id))]
    pub async fn add_pages(&self, id: i64, pages: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET total_pages_processed = total_pages_processed + ?
            WHERE id = ?
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(pages)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = id))]
    pub async fn reset_usage(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET documents_processed = 0,
                total_pages_processed = 0,
                last_document_processed = NULL
            WHERE id = ?
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = id))]
    pub async fn set_tier(
        &self,
        id: i64,
        tier: UserTier,
        max_documents_allowed: i64,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET user_type = ?, max_documents_allowed = ?
            WHERE id = ?
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(tier)
        .bind(max_documents_allowed)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = id))]
    pub async fn set_limit(
        &self,
        id: i64,
        max_documents_allowed: i64,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET max_documents_allowed = ?
            WHERE id = ?
            RETURNING id, username, email, user_type, documents_processed, total_pages_processed,
                      max_documents_allowed, registration_datetime, last_document_processed
            "#,
        )
        .bind(max_documents_allowed)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }
}
