//! Subscription Invariants Module
//!
//! Runnable consistency checks for user subscription records. The same rules
//! exist twice: as pure per-record checks (run on every committed write in
//! debug builds, see [`audit_committed`]) and as SQL queries the worker runs
//! against the whole `users` table.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::record::{SubscriptionStatus, UserSubscriptionRecord, FREE_PACKAGE_NAME};

pub const ACTIVE_FLAG_MATCHES_STATUS: &str = "active_flag_matches_status";
pub const ENTITLEMENT_FIELDS_CONSISTENT: &str = "entitlement_fields_consistent";
pub const END_DATE_MATCHES_SUBSCRIPTION: &str = "end_date_matches_subscription";
pub const LEGACY_STATUS_CONSISTENT: &str = "legacy_status_consistent";
pub const FREE_HAS_NO_PLAN: &str = "free_has_no_plan";

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlements granted or withheld incorrectly
    Critical,
    /// Sweep may target the wrong records
    High,
    /// Data inconsistency that needs attention
    Medium,
    /// Cosmetic, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// Check a single record against every invariant
pub fn check_record(record: &UserSubscriptionRecord) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let status = record.subscription_status;
    let paid_status = matches!(
        status,
        SubscriptionStatus::Active | SubscriptionStatus::Canceled
    );

    // Canceled keeps is_active until the sweep downgrades the record
    if record.is_active != paid_status {
        violations.push(violation(
            record,
            ACTIVE_FLAG_MATCHES_STATUS,
            format!("is_active={} but status is '{}'", record.is_active, status),
            ViolationSeverity::Critical,
        ));
    }

    if record.is_active != record.subscription.is_some()
        || record.is_active != record.subscription_end_date.is_some()
    {
        violations.push(violation(
            record,
            ENTITLEMENT_FIELDS_CONSISTENT,
            format!(
                "is_active={} but subscription present={}, end date present={}",
                record.is_active,
                record.subscription.is_some(),
                record.subscription_end_date.is_some()
            ),
            ViolationSeverity::Critical,
        ));
    }

    let nested_end = record.subscription.as_ref().map(|s| s.end_date);
    if nested_end != record.subscription_end_date {
        violations.push(violation(
            record,
            END_DATE_MATCHES_SUBSCRIPTION,
            "subscription_end_date differs from subscription.endDate".to_string(),
            ViolationSeverity::High,
        ));
    }

    if record.subscription_status != record.package_status {
        violations.push(violation(
            record,
            LEGACY_STATUS_CONSISTENT,
            format!(
                "subscription_status '{}' differs from package_status '{}'",
                record.subscription_status, record.package_status
            ),
            ViolationSeverity::Medium,
        ));
    }

    if status == SubscriptionStatus::Free && record.package_name != FREE_PACKAGE_NAME {
        violations.push(violation(
            record,
            FREE_HAS_NO_PLAN,
            format!("free user still shows plan '{}'", record.package_name),
            ViolationSeverity::Low,
        ));
    }

    violations
}

/// Log any invariant the record just written breaks
///
/// Only runs in debug builds; returns the number of violations logged.
/// Legacy rows can carry inconsistencies a transition preserves, so this
/// reports instead of panicking.
pub fn audit_committed(record: &UserSubscriptionRecord) -> usize {
    if !cfg!(debug_assertions) {
        return 0;
    }

    let violations = check_record(record);
    for v in &violations {
        tracing::warn!(
            invariant = %v.invariant,
            severity = %v.severity,
            email = %record.email,
            "Committed record violates invariant: {}",
            v.description
        );
    }
    violations.len()
}

fn violation(
    record: &UserSubscriptionRecord,
    invariant: &str,
    description: String,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![record.id],
        description,
        context: serde_json::json!({
            "email": record.email,
            "subscription_status": record.subscription_status.as_str(),
            "package_status": record.package_status.as_str(),
        }),
        severity,
    }
}

/// Row type shared by the SQL checks
#[derive(Debug, sqlx::FromRow)]
struct ViolatingUserRow {
    id: Uuid,
    email: String,
    subscription_status: String,
    package_status: String,
}

/// Service for running invariant checks against Postgres
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let Some((predicate, severity, description)) = Self::check_sql(name) else {
            return Ok(vec![]);
        };

        let query = format!(
            "SELECT id, email, subscription_status, package_status FROM users WHERE {} LIMIT 1000",
            predicate
        );
        let rows: Vec<ViolatingUserRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: name.to_string(),
                user_ids: vec![row.id],
                description: description.to_string(),
                context: serde_json::json!({
                    "email": row.email,
                    "subscription_status": row.subscription_status,
                    "package_status": row.package_status,
                }),
                severity,
            })
            .collect())
    }

    fn check_sql(name: &str) -> Option<(&'static str, ViolationSeverity, &'static str)> {
        match name {
            ACTIVE_FLAG_MATCHES_STATUS => Some((
                "is_active <> (subscription_status IN ('active', 'canceled'))",
                ViolationSeverity::Critical,
                "is_active does not match subscription_status",
            )),
            ENTITLEMENT_FIELDS_CONSISTENT => Some((
                "is_active <> (subscription IS NOT NULL) \
                 OR is_active <> (subscription_end_date IS NOT NULL)",
                ViolationSeverity::Critical,
                "is_active does not match subscription / end date presence",
            )),
            END_DATE_MATCHES_SUBSCRIPTION => Some((
                "(subscription IS NULL) <> (subscription_end_date IS NULL) \
                 OR (subscription IS NOT NULL \
                     AND (subscription->>'endDate')::timestamptz <> subscription_end_date)",
                ViolationSeverity::High,
                "subscription_end_date differs from subscription.endDate",
            )),
            LEGACY_STATUS_CONSISTENT => Some((
                "subscription_status <> package_status",
                ViolationSeverity::Medium,
                "subscription_status differs from package_status",
            )),
            FREE_HAS_NO_PLAN => Some((
                "subscription_status = 'free' AND package_name <> 'Free'",
                ViolationSeverity::Low,
                "free user still shows a paid plan name",
            )),
            _ => None,
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            ACTIVE_FLAG_MATCHES_STATUS,
            ENTITLEMENT_FIELDS_CONSISTENT,
            END_DATE_MATCHES_SUBSCRIPTION,
            LEGACY_STATUS_CONSISTENT,
            FREE_HAS_NO_PLAN,
        ]
    }
}
