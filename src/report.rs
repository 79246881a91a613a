//! Usage statistics and the admin user report.
//!
//! Pure functions over rows already loaded from the store, so the thresholds
//! can be tested without a database.

use crate::model::{DocumentTotals, UsageSnapshot, User, UserTier};
use crate::quota::{QuotaLedger, UPGRADE_CONTACT};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Days of inactivity after which a user counts as inactive.
pub const ACTIVE_WINDOW_DAYS: i64 = 30;

const WARNING_PERCENT: f64 = 90.0;
const NOTICE_PERCENT: f64 = 75.0;
const APPROACHING_PERCENT: f64 = 80.0;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Share of the document cap used, rounded to one decimal. Always 0 for
/// privileged tiers.
pub fn usage_percentage(user: &User, limit: i64) -> f64 {
    if user.tier != UserTier::Default || limit <= 0 {
        return 0.0;
    }
    round1(user.documents_processed as f64 / limit as f64 * 100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_days()
}

// ── Per-user stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    #[serde(flatten)]
    pub usage: UsageSnapshot,
    pub recent_documents_30d: i64,
    pub last_document_date: Option<String>,
    pub registration_date: String,
    pub days_registered: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// Usage statistics for the requesting user.
pub fn usage_stats(
    ledger: &QuotaLedger,
    user: &User,
    recent_documents_30d: i64,
    last_document: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> UsageStats {
    let usage = ledger.usage_snapshot(user);
    let mut stats = UsageStats {
        recent_documents_30d,
        last_document_date: last_document.map(|d| d.format("%Y-%m-%d").to_string()),
        registration_date: user.registration_datetime.format("%Y-%m-%d").to_string(),
        days_registered: days_between(user.registration_datetime, now),
        usage_percentage: None,
        warning: None,
        notice: None,
        usage,
    };

    if user.tier == UserTier::Default {
        let pct = usage_percentage(user, stats.usage.max_documents_allowed);
        stats.usage_percentage = Some(pct);
        if pct >= WARNING_PERCENT {
            stats.warning = Some(format!(
                "You're approaching your document limit. Contact {UPGRADE_CONTACT} for an upgrade."
            ));
        } else if pct >= NOTICE_PERCENT {
            stats.notice =
                Some("You've used most of your document allowance. Consider upgrading soon.".into());
        }
    }
    stats
}

// ── Admin report ─────────────────────────────────────────────────────────────

/// Document cap as shown in the report: a number, or "Unlimited".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LimitDisplay {
    Limited(i64),
    Unlimited(&'static str),
}

#[derive(Debug, Clone, Serialize)]
pub struct UserReportRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub user_type: UserTier,
    pub registration_datetime: String,
    pub days_registered: i64,
    pub usage_status: &'static str,
    pub last_document_processed: String,
    pub documents_processed: i64,
    pub max_documents_allowed: LimitDisplay,
    pub usage_percentage: f64,
    pub total_pages_processed: i64,
    pub pages_from_documents: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_tokens: i64,
    pub total_documents_in_db: i64,
    pub avg_pages_per_doc: f64,
    pub is_approaching_limit: bool,
    pub is_at_limit: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierBreakdown {
    pub default: usize,
    pub power: usize,
    pub admin: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_users: usize,
    pub active_users: usize,
    pub inactive_users: usize,
    pub users_at_limit: usize,
    pub users_approaching_limit: usize,
    pub recent_registrations_30d: usize,
    pub user_type_breakdown: TierBreakdown,
    pub total_documents_processed: i64,
    pub total_pages_processed: i64,
    pub total_tokens_consumed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserReport {
    pub summary: ReportSummary,
    pub users: Vec<UserReportRow>,
    pub generated_at: String,
}

/// Build the admin report from every user and the per-user document totals.
pub fn user_report(
    ledger: &QuotaLedger,
    users: &[User],
    totals: &[DocumentTotals],
    now: DateTime<Utc>,
) -> UserReport {
    let by_user: HashMap<i64, &DocumentTotals> = totals.iter().map(|t| (t.user_id, t)).collect();
    let empty = DocumentTotals::default();

    let rows: Vec<UserReportRow> = users
        .iter()
        .map(|u| {
            let t = by_user.get(&u.id).copied().unwrap_or(&empty);
            let limit = ledger.effective_limit(u);
            let capped = u.tier == UserTier::Default;
            let pct = usage_percentage(u, limit);
            let active = u
                .last_document_processed
                .is_some_and(|at| days_between(at, now) <= ACTIVE_WINDOW_DAYS);

            UserReportRow {
                id: u.id,
                username: u.username.clone(),
                email: u.email.clone(),
                user_type: u.tier,
                registration_datetime: u.registration_datetime.format(TIMESTAMP_FORMAT).to_string(),
                days_registered: days_between(u.registration_datetime, now),
                usage_status: if active { "Active" } else { "Inactive" },
                last_document_processed: u
                    .last_document_processed
                    .map(|d| d.format(TIMESTAMP_FORMAT).to_string())
                    .unwrap_or_else(|| "Never".into()),
                documents_processed: u.documents_processed,
                max_documents_allowed: if capped {
                    LimitDisplay::Limited(u.max_documents_allowed)
                } else {
                    LimitDisplay::Unlimited("Unlimited")
                },
                usage_percentage: pct,
                total_pages_processed: u.total_pages_processed,
                pages_from_documents: t.pages,
                total_input_tokens: t.input_tokens,
                total_output_tokens: t.output_tokens,
                total_tokens: t.input_tokens + t.output_tokens,
                total_documents_in_db: t.documents,
                avg_pages_per_doc: if t.documents > 0 {
                    round1(t.pages as f64 / t.documents as f64)
                } else {
                    0.0
                },
                is_approaching_limit: capped && pct > APPROACHING_PERCENT,
                is_at_limit: capped && u.documents_processed >= limit,
            }
        })
        .collect();

    let mut breakdown = TierBreakdown::default();
    for r in &rows {
        match r.user_type {
            UserTier::Default => breakdown.default += 1,
            UserTier::Power => breakdown.power += 1,
            UserTier::Admin => breakdown.admin += 1,
        }
    }
    let active_users = rows.iter().filter(|r| r.usage_status == "Active").count();

    let summary = ReportSummary {
        total_users: rows.len(),
        active_users,
        inactive_users: rows.len() - active_users,
        users_at_limit: rows.iter().filter(|r| r.is_at_limit).count(),
        users_approaching_limit: rows.iter().filter(|r| r.is_approaching_limit).count(),
        recent_registrations_30d: rows
            .iter()
            .filter(|r| r.days_registered <= ACTIVE_WINDOW_DAYS)
            .count(),
        user_type_breakdown: breakdown,
        total_documents_processed: rows.iter().map(|r| r.total_documents_in_db).sum(),
        total_pages_processed: rows.iter().map(|r| r.total_pages_processed).sum(),
        total_tokens_consumed: rows.iter().map(|r| r.total_tokens).sum(),
    };

    UserReport {
        summary,
        users: rows,
        generated_at: now.format(TIMESTAMP_FORMAT).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{connect_in_memory, UserRepository};
    use chrono::Duration;

    async fn ledger() -> QuotaLedger {
        QuotaLedger::new(UserRepository::new(connect_in_memory().await.unwrap()), 20)
    }

    fn user(id: i64, tier: UserTier, processed: i64, max: i64) -> User {
        let now = Utc::now();
        User {
            id,
            username: format!("user{id}"),
            email: String::new(),
            tier,
            documents_processed: processed,
            total_pages_processed: processed * 2,
            max_documents_allowed: max,
            registration_datetime: now - Duration::days(40),
            last_document_processed: None,
        }
    }

    #[tokio::test]
    async fn warning_at_ninety_percent() {
        let ledger = ledger().await;
        let stats = usage_stats(&ledger, &user(1, UserTier::Default, 18, 20), 3, None, Utc::now());
        assert_eq!(stats.usage_percentage, Some(90.0));
        assert!(stats.warning.unwrap().contains("approaching your document limit"));
        assert!(stats.notice.is_none());
        assert_eq!(stats.days_registered, 40);
    }

    #[tokio::test]
    async fn notice_at_seventy_five_percent() {
        let ledger = ledger().await;
        let stats = usage_stats(&ledger, &user(1, UserTier::Default, 15, 20), 0, None, Utc::now());
        assert!(stats.warning.is_none());
        assert!(stats.notice.is_some());

        let quiet = usage_stats(&ledger, &user(1, UserTier::Default, 14, 20), 0, None, Utc::now());
        assert!(quiet.warning.is_none() && quiet.notice.is_none());
    }

    #[tokio::test]
    async fn privileged_users_get_no_percentage() {
        let ledger = ledger().await;
        let stats = usage_stats(&ledger, &user(1, UserTier::Power, 500, 99_999), 0, None, Utc::now());
        assert!(stats.usage_percentage.is_none());
        assert!(stats.warning.is_none());
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["user_type"], "power");
        assert!(json.get("usage_percentage").is_none());
    }

    #[tokio::test]
    async fn report_rows_and_summary() {
        let ledger = ledger().await;
        let now = Utc::now();
        let mut active = user(1, UserTier::Default, 20, 20);
        active.last_document_processed = Some(now - Duration::days(2));
        let mut fresh = user(2, UserTier::Default, 17, 20);
        fresh.registration_datetime = now - Duration::days(3);
        let admin = user(3, UserTier::Admin, 4, 99_999);

        let totals = vec![DocumentTotals {
            user_id: 1,
            documents: 4,
            input_tokens: 100,
            output_tokens: 50,
            pages: 10,
        }];
        let report = user_report(&ledger, &[active, fresh, admin], &totals, now);

        let first = &report.users[0];
        assert_eq!(first.usage_status, "Active");
        assert!(first.is_at_limit);
        assert_eq!(first.avg_pages_per_doc, 2.5);
        assert_eq!(first.total_tokens, 150);

        assert!(report.users[1].is_approaching_limit);
        assert_eq!(report.users[1].last_document_processed, "Never");
        assert_eq!(report.users[2].max_documents_allowed, LimitDisplay::Unlimited("Unlimited"));
        assert!(!report.users[2].is_at_limit);

        let s = &report.summary;
        assert_eq!(s.total_users, 3);
        assert_eq!(s.active_users, 1);
        assert_eq!(s.inactive_users, 2);
        assert_eq!(s.users_at_limit, 1);
        assert_eq!(s.users_approaching_limit, 2);
        assert_eq!(s.recent_registrations_30d, 1);
        assert_eq!(s.user_type_breakdown.admin, 1);
        assert_eq!(s.total_tokens_consumed, 150);
    }
}
