//! Persisted entities: users with their usage counters, and processed documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User classification controlling quota and page-limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserTier {
    Default,
    Power,
    Admin,
}

impl UserTier {
    /// Power and admin users have no document cap and may process full documents.
    pub fn is_privileged(self) -> bool {
        matches!(self, UserTier::Power | UserTier::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserTier::Default => "default",
            UserTier::Power => "power",
            UserTier::Admin => "admin",
        }
    }
}

impl fmt::Display for UserTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(UserTier::Default),
            "power" => Ok(UserTier::Power),
            "admin" => Ok(UserTier::Admin),
            other => Err(format!(
                "Invalid user type '{other}'. Must be 'default', 'power', or 'admin'"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(rename = "user_type")]
    #[sqlx(rename = "user_type")]
    pub tier: UserTier,
    pub documents_processed: i64,
    pub total_pages_processed: i64,
    pub max_documents_allowed: i64,
    pub registration_datetime: DateTime<Utc>,
    pub last_document_processed: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.tier == UserTier::Admin
    }
}

/// Fields needed to provision a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub tier: UserTier,
    pub max_documents_allowed: i64,
}

/// One processed upload.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    /// Path of the stored original, relative to the media root.
    pub file_path: String,
    #[sqlx(json)]
    pub json_data: serde_json::Value,
    pub document_type: String,
    pub input_token: i64,
    pub output_token: i64,
    /// Seconds spent in the model call, retries included.
    pub api_response_time: f64,
    /// Seconds spent writing the record.
    pub db_save_time: f64,
    pub llm_model_used: String,
    pub pages_processed: i64,
    pub is_full_document: bool,
    pub entry_date: DateTime<Utc>,
}

/// Everything a pipeline run knows before the insert.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub user_id: i64,
    pub file_path: String,
    pub json_data: serde_json::Value,
    pub document_type: String,
    pub input_token: i64,
    pub output_token: i64,
    pub api_response_time: f64,
    pub llm_model_used: String,
    pub pages_processed: i64,
    pub is_full_document: bool,
}

/// In-place replacement applied by full-document reprocessing.
#[derive(Debug, Clone)]
pub struct FullDocumentUpdate {
    pub json_data: serde_json::Value,
    pub input_token: i64,
    pub output_token: i64,
    pub api_response_time: f64,
    pub llm_model_used: String,
    pub pages_processed: i64,
}

/// Per-user aggregates over the documents table.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct DocumentTotals {
    pub user_id: i64,
    pub documents: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub pages: i64,
}

/// Usage as shown to the user after every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub documents_processed: i64,
    pub max_documents_allowed: i64,
    pub total_pages_processed: i64,
    pub user_type: UserTier,
    pub can_process_more: bool,
}
