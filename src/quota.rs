//! Quota ledger: per-user document and page accounting.
//!
//! Policy is a pure function of the user row ([`QuotaLedger::check_can_process`]);
//! counter changes are single SQL updates in [`UserRepository`], so two
//! uploads from the same user can never lose an increment.
//!
//! The pre-check and the final increment are separate statements. Two uploads
//! that both pass the check at 19/20 will both be charged, leaving the user at
//! 21/20. That gap is accepted: the check exists to protect the model call,
//! and the next upload is refused.

use crate::model::{UsageSnapshot, User};
use crate::store::UserRepository;
use chrono::Utc;
use tracing::{info, warn};

/// Document cap applied to default-tier users when none is configured.
pub const DEFAULT_MAX_DOCUMENTS: i64 = 20;

/// Nominal cap stored for power and admin users; never enforced.
pub const UNLIMITED_MAX_DOCUMENTS: i64 = 99_999;

/// Where to send users who hit the cap.
pub const UPGRADE_CONTACT: &str = "plg@valuedx.com or plg@automationedge.com";

/// Outcome of a pre-processing check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Human-readable explanation when `allowed` is false.
    pub reason: Option<String>,
}

impl QuotaDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }
}

/// Limit checks plus atomic counter updates.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    users: UserRepository,
    default_max_documents: i64,
}

impl QuotaLedger {
    pub fn new(users: UserRepository, default_max_documents: i64) -> Self {
        Self {
            users,
            default_max_documents: if default_max_documents > 0 {
                default_max_documents
            } else {
                DEFAULT_MAX_DOCUMENTS
            },
        }
    }

    /// The cap actually enforced for `user`. A zero or negative stored limit
    /// is treated as unset rather than as "no documents allowed".
    pub fn effective_limit(&self, user: &User) -> i64 {
        if user.max_documents_allowed > 0 {
            user.max_documents_allowed
        } else {
            warn!(
                user_id = user.id,
                stored = user.max_documents_allowed,
                "Non-positive document limit; using default"
            );
            self.default_max_documents
        }
    }

    pub fn check_can_process(&self, user: &User) -> QuotaDecision {
        if user.tier.is_privileged() {
            return QuotaDecision::allow();
        }

        let limit = self.effective_limit(user);
        if user.documents_processed >= limit {
            return QuotaDecision {
                allowed: false,
                reason: Some(format!(
                    "Document limit reached ({}/{}). Please contact {} for upgrade.",
                    user.documents_processed, limit, UPGRADE_CONTACT
                )),
            };
        }
        QuotaDecision::allow()
    }

    /// Usage view for responses.
    pub fn usage_snapshot(&self, user: &User) -> UsageSnapshot {
        UsageSnapshot {
            documents_processed: user.documents_processed,
            max_documents_allowed: self.effective_limit(user),
            total_pages_processed: user.total_pages_processed,
            user_type: user.tier,
            can_process_more: self.check_can_process(user).allowed,
        }
    }

    /// Charge one document and `pages` pages. Call only after the document
    /// record has been saved.
    pub async fn record_success(&self, user_id: i64, pages: u32) -> Result<User, sqlx::Error> {
        let user = self
            .users
            .record_success(user_id, i64::from(pages), Utc::now())
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        info!(
            user_id,
            documents = user.documents_processed,
            pages = user.total_pages_processed,
            "Usage recorded"
        );
        Ok(user)
    }

    /// Charge extra pages without counting a new document.
    pub async fn add_pages(&self, user_id: i64, pages: u32) -> Result<User, sqlx::Error> {
        self.users
            .add_pages(user_id, i64::from(pages))
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Zero both counters and clear last activity. Idempotent.
    pub async fn reset(&self, user_id: i64) -> Result<Option<User>, sqlx::Error> {
        let user = self.users.reset_usage(user_id).await?;
        if user.is_some() {
            info!(user_id, "Usage reset");
        }
        Ok(user)
    }
}
