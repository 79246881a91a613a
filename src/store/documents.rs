use crate::model::{Document, DocumentTotals, FullDocumentUpdate, NewDocument};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::time::Instant;

/// Repository for processed documents.
#[derive(Debug, Clone)]
pub struct DocumentRepository {
    pool: SqlitePool,
}

impl DocumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a document and stamp how long the write took.
    ///
    /// Both statements share one transaction, so readers only ever see the
    /// finished row.
    #[tracing::instrument(skip(self, doc), fields(db.table = "documents", db.operation = "insert", user_id = doc.user_id))]
    pub async fn create(&self, doc: &NewDocument) -> Result<Document, sqlx::Error> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (user_id, file_path, json_data, document_type, input_token,
                                   output_token, api_response_time, llm_model_used,
                                   pages_processed, is_full_document, entry_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(doc.user_id)
        .bind(&doc.file_path)
        .bind(Json(&doc.json_data))
        .bind(&doc.document_type)
        .bind(doc.input_token)
        .bind(doc.output_token)
        .bind(doc.api_response_time)
        .bind(&doc.llm_model_used)
        .bind(doc.pages_processed)
        .bind(doc.is_full_document)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let document = stamp_save_time(&mut tx, id, started).await?;
        tx.commit().await?;
        Ok(document)
    }

    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select", db.record_id = id))]
    pub async fn find(&self, id: i64) -> Result<Option<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT id, user_id, file_path, json_data, document_type, input_token, output_token,
                   api_response_time, db_save_time, llm_model_used, pages_processed,
                   is_full_document, entry_date
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Documents owned by `user_id`, newest first.
    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT id, user_id, file_path, json_data, document_type, input_token, output_token,
                   api_response_time, db_save_time, llm_model_used, pages_processed,
                   is_full_document, entry_date
            FROM documents WHERE user_id = ?
            ORDER BY julianday(entry_date) DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn list_all(&self) -> Result<Vec<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT id, user_id, file_path, json_data, document_type, input_token, output_token,
                   api_response_time, db_save_time, llm_model_used, pages_processed,
                   is_full_document, entry_date
            FROM documents
            ORDER BY julianday(entry_date) DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Documents owned by `user_id` created on `day` (UTC).
    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn list_for_user_on(
        &self,
        user_id: i64,
        day: NaiveDate,
    ) -> Result<Vec<Document>, sqlx::Error> {
        sqlx::query_as::<_, Document>(
            r#"
            SELECT id, user_id, file_path, json_data, document_type, input_token, output_token,
                   api_response_time, db_save_time, llm_model_used, pages_processed,
                   is_full_document, entry_date
            FROM documents
            WHERE user_id = ? AND date(entry_date) = ?
            ORDER BY julianday(entry_date) DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(day.format("%Y-%m-%d").to_string())
        .fetch_all(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn count_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE user_id = ? AND julianday(entry_date) >= julianday(?)",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn latest_entry(&self, user_id: i64) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT entry_date FROM documents WHERE user_id = ?
            ORDER BY julianday(entry_date) DESC LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Per-user document, token and page sums.
    #[tracing::instrument(skip(self), fields(db.table = "documents", db.operation = "select"))]
    pub async fn totals_by_user(&self) -> Result<Vec<DocumentTotals>, sqlx::Error> {
        sqlx::query_as::<_, DocumentTotals>(
            r#"
            SELECT user_id,
                   COUNT(*)                         AS documents,
                   COALESCE(SUM(input_token), 0)    AS input_tokens,
                   COALESCE(SUM(output_token), 0)   AS output_tokens,
                   COALESCE(SUM(pages_processed), 0) AS pages
            FROM documents GROUP BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    /// Replace the extraction of `id` with a full-document run and flag it full.
    ///
    /// Only a document that is not yet full is updated; `None` means the row
    /// is missing or another run already flagged it.
    #[tracing::instrument(skip(self, update), fields(db.table = "documents", db.operation = "update", db.record_id = id))]
    pub async fn apply_full_update(
        &self,
        id: i64,
        update: &FullDocumentUpdate,
    ) -> Result<Option<Document>, sqlx::Error> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET json_data = ?, input_token = ?, output_token = ?, api_response_time = ?,
                llm_model_used = ?, pages_processed = ?, is_full_document = 1
            WHERE id = ? AND is_full_document = 0
            "#,
        )
        .bind(Json(&update.json_data))
        .bind(update.input_token)
        .bind(update.output_token)
        .bind(update.api_response_time)
        .bind(&update.llm_model_used)
        .bind(update.pages_processed)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let document = stamp_save_time(&mut tx, id, started).await?;
        tx.commit().await?;
        Ok(Some(document))
    }
}

async fn stamp_save_time(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: i64,
    started: Instant,
) -> Result<Document, sqlx::Error> {
    sqlx::query_as::<_, Document>(
        r#"
        UPDATE documents SET db_save_time = ?
        WHERE id = ?
        RETURNING id, user_id, file_path, json_data, document_type, input_token, output_token,
                  api_response_time, db_save_time, llm_model_used, pages_processed,
                  is_full_document, entry_date
        "#,
    )
    .bind(started.elapsed().as_secs_f64())
    .bind(id)
    .fetch_one(&mut **tx)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewUser, UserTier};
    use crate::store::{connect_in_memory, UserRepository};
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (DocumentRepository, i64) {
        let pool = connect_in_memory().await.unwrap();
        let user = UserRepository::new(pool.clone())
            .create(&NewUser {
                username: "fay".into(),
                email: "fay@example.com".into(),
                tier: UserTier::Default,
                max_documents_allowed: 20,
            })
            .await
            .unwrap();
        (DocumentRepository::new(pool), user.id)
    }

    fn new_doc(user_id: i64, pages: i64) -> NewDocument {
        NewDocument {
            user_id,
            file_path: "uploads/pdf_files/bill_1.pdf".into(),
            json_data: json!({"total": 42}),
            document_type: "docextraction".into(),
            input_token: 100,
            output_token: 20,
            api_response_time: 1.5,
            llm_model_used: "gemini-1.5-flash".into(),
            pages_processed: pages,
            is_full_document: false,
        }
    }

    #[tokio::test]
    async fn create_round_trips_json_and_timing() {
        let (docs, user_id) = setup().await;
        let created = docs.create(&new_doc(user_id, 3)).await.unwrap();

        assert_eq!(created.json_data, json!({"total": 42}));
        assert_eq!(created.pages_processed, 3);
        assert!(!created.is_full_document);
        assert!(created.db_save_time >= 0.0);

        let found = docs.find(created.id).await.unwrap().unwrap();
        assert_eq!(found.llm_model_used, "gemini-1.5-flash");
    }

    #[tokio::test]
    async fn unknown_owner_is_rejected() {
        let (docs, user_id) = setup().await;
        assert!(docs.create(&new_doc(user_id + 99, 1)).await.is_err());
    }

    #[tokio::test]
    async fn full_update_replaces_extraction() {
        let (docs, user_id) = setup().await;
        let created = docs.create(&new_doc(user_id, 3)).await.unwrap();

        let updated = docs
            .apply_full_update(
                created.id,
                &FullDocumentUpdate {
                    json_data: json!({"total": 99, "pages": 12}),
                    input_token: 900,
                    output_token: 80,
                    api_response_time: 4.0,
                    llm_model_used: "gemini-1.5-pro".into(),
                    pages_processed: 12,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert!(updated.is_full_document);
        assert_eq!(updated.pages_processed, 12);
        assert_eq!(updated.json_data["total"], 99);
        assert_eq!(updated.entry_date, created.entry_date);

        let second = FullDocumentUpdate {
            json_data: json!({}),
            input_token: 0,
            output_token: 0,
            api_response_time: 0.0,
            llm_model_used: String::new(),
            pages_processed: 1,
        };
        assert!(docs
            .apply_full_update(created.id + 1, &second)
            .await
            .unwrap()
            .is_none());
        assert!(
            docs.apply_full_update(created.id, &second).await.unwrap().is_none(),
            "a full document is never overwritten"
        );
        let kept = docs.find(created.id).await.unwrap().unwrap();
        assert_eq!(kept.pages_processed, 12);
        assert_eq!(kept.json_data["total"], 99);
    }

    #[tokio::test]
    async fn listing_filters_and_totals() {
        let (docs, user_id) = setup().await;
        docs.create(&new_doc(user_id, 3)).await.unwrap();
        docs.create(&new_doc(user_id, 1)).await.unwrap();

        assert_eq!(docs.list_for_user(user_id).await.unwrap().len(), 2);
        assert_eq!(docs.list_all().await.unwrap().len(), 2);

        let today = Utc::now().date_naive();
        assert_eq!(docs.list_for_user_on(user_id, today).await.unwrap().len(), 2);
        let yesterday = today - Duration::days(1);
        assert!(docs.list_for_user_on(user_id, yesterday).await.unwrap().is_empty());

        let since = Utc::now() - Duration::days(30);
        assert_eq!(docs.count_since(user_id, since).await.unwrap(), 2);
        assert!(docs.latest_entry(user_id).await.unwrap().is_some());

        let totals = docs.totals_by_user().await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].documents, 2);
        assert_eq!(totals[0].input_tokens, 200);
        assert_eq!(totals[0].pages, 4);
    }
}
