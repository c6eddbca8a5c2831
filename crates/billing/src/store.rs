//! User record store
//!
//! [`RecordStore`] is the only way the webhook handler and the sweep reach
//! user rows. Updates are conditional: a write applies only when the guarded
//! fields still hold the values that were read, otherwise it reports
//! [`WriteOutcome::Conflict`] and changes nothing.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::record::{
    LastPurchase, SubscriptionDetails, SubscriptionStatus, UserSubscriptionRecord, WriteGuard,
    FREE_PACKAGE_NAME,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// Guarded fields changed since the read; nothing was written
    Conflict,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Exact match on email. `None` when no user has it.
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserSubscriptionRecord>>;

    /// Records whose end date is before `now` and whose status (either field)
    /// is active or canceled, most overdue first, at most `limit`.
    async fn find_lapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserSubscriptionRecord>>;

    /// Replace the subscription fields of `record` if `guard` still matches
    async fn update_if_unchanged(
        &self,
        record: &UserSubscriptionRecord,
        guard: WriteGuard,
    ) -> BillingResult<WriteOutcome>;
}

/// Run a store or mail call under a deadline
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BillingError::Timeout(format!(
            "{} exceeded {}ms",
            what,
            limit.as_millis()
        ))),
    }
}

// =============================================================================
// Postgres
// =============================================================================

const USER_COLUMNS: &str = r#"
    id, email, name, is_active, subscription_status, package_status, package_name,
    provider_subscription_ref, subscription, subscription_end_date,
    usage_today, api_counter, last_purchase
"#;

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    name: Option<String>,
    is_active: bool,
    subscription_status: Option<String>,
    package_status: Option<String>,
    package_name: Option<String>,
    provider_subscription_ref: Option<String>,
    subscription: Option<Json<serde_json::Value>>,
    subscription_end_date: Option<OffsetDateTime>,
    usage_today: i64,
    api_counter: i64,
    last_purchase: Option<Json<serde_json::Value>>,
}

impl From<UserRow> for UserSubscriptionRecord {
    fn from(row: UserRow) -> Self {
        let subscription = row.subscription.and_then(|Json(value)| {
            serde_json::from_value::<SubscriptionDetails>(value)
                .map_err(|e| {
                    tracing::warn!(user_id = %row.id, error = %e, "Unreadable subscription column");
                })
                .ok()
        });
        let last_purchase = row.last_purchase.and_then(|Json(value)| {
            serde_json::from_value::<LastPurchase>(value)
                .map_err(|e| {
                    tracing::warn!(user_id = %row.id, error = %e, "Unreadable last_purchase column");
                })
                .ok()
        });

        Self {
            id: row.id,
            email: row.email,
            name: row.name,
            is_active: row.is_active,
            subscription_status: SubscriptionStatus::parse(
                row.subscription_status.as_deref().unwrap_or_default(),
            ),
            package_status: SubscriptionStatus::parse(
                row.package_status.as_deref().unwrap_or_default(),
            ),
            package_name: row
                .package_name
                .unwrap_or_else(|| FREE_PACKAGE_NAME.to_string()),
            provider_subscription_ref: row.provider_subscription_ref,
            subscription,
            subscription_end_date: row.subscription_end_date,
            usage_today: row.usage_today,
            api_counter: row.api_counter,
            last_purchase,
        }
    }
}

/// Record store backed by the `users` table
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserSubscriptionRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1 LIMIT 1");
        let row: Option<UserRow> = sqlx::query_as(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn find_lapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserSubscriptionRecord>> {
        let query = lapsed_sql();
        let rows: Vec<UserRow> = sqlx::query_as(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_if_unchanged(
        &self,
        record: &UserSubscriptionRecord,
        guard: WriteGuard,
    ) -> BillingResult<WriteOutcome> {
        let query = guarded_update_sql();
        let result = sqlx::query(&query)
            .bind(record.id)
            .bind(record.is_active)
            .bind(record.subscription_status.as_str())
            .bind(record.package_status.as_str())
            .bind(&record.package_name)
            .bind(&record.provider_subscription_ref)
            .bind(record.subscription.as_ref().map(Json))
            .bind(record.subscription_end_date)
            .bind(record.usage_today)
            .bind(record.api_counter)
            .bind(record.last_purchase.as_ref().map(Json))
            .bind(guard.subscription_status.as_str())
            .bind(guard.package_status.as_str())
            .bind(guard.subscription_end_date)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            Ok(WriteOutcome::Conflict)
        } else {
            Ok(WriteOutcome::Applied)
        }
    }
}

/// Lapsed paid records, most overdue first. Status columns are compared
/// through [`SubscriptionStatus::normalized_sql`] so legacy spellings match.
fn lapsed_sql() -> String {
    let subscription_status = SubscriptionStatus::normalized_sql("subscription_status");
    let package_status = SubscriptionStatus::normalized_sql("package_status");
    format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM users
        WHERE subscription_end_date IS NOT NULL
          AND subscription_end_date < $1
          AND ({subscription_status} IN ('active', 'canceled')
               OR {package_status} IN ('active', 'canceled'))
        ORDER BY subscription_end_date ASC
        LIMIT $2
        "#
    )
}

/// Full-row update guarded on the normalized status columns and the end date
fn guarded_update_sql() -> String {
    let subscription_status = SubscriptionStatus::normalized_sql("subscription_status");
    let package_status = SubscriptionStatus::normalized_sql("package_status");
    format!(
        r#"
        UPDATE users
        SET is_active = $2,
            subscription_status = $3,
            package_status = $4,
            package_name = $5,
            provider_subscription_ref = $6,
            subscription = $7,
            subscription_end_date = $8,
            usage_today = $9,
            api_counter = $10,
            last_purchase = $11,
            updated_at = NOW()
        WHERE id = $1
          AND {subscription_status} = $12
          AND {package_status} = $13
          AND subscription_end_date IS NOT DISTINCT FROM $14
        "#
    )
}

// =============================================================================
// In-memory
// =============================================================================

/// Record store held in process memory
///
/// Same semantics as [`PgRecordStore`], plus switches to simulate an
/// unavailable store or failing writes for individual users.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<Uuid, UserSubscriptionRecord>>,
    unavailable: AtomicBool,
    failing_writes: RwLock<HashSet<String>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub async fn insert(&self, record: UserSubscriptionRecord) {
        self.records.write().await.insert(record.id, record);
    }

    pub async fn get(&self, email: &str) -> Option<UserSubscriptionRecord> {
        self.records
            .read()
            .await
            .values()
            .find(|r| r.email == email)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Make every call fail with a store error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes for this user fail with a store error
    pub async fn fail_writes_for(&self, email: &str) {
        self.failing_writes.write().await.insert(email.to_string());
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Store("record store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_email(&self, email: &str) -> BillingResult<Option<UserSubscriptionRecord>> {
        self.check_available()?;
        Ok(self.get(email).await)
    }

    async fn find_lapsed(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UserSubscriptionRecord>> {
        self.check_available()?;
        let paid = |s: SubscriptionStatus| {
            matches!(s, SubscriptionStatus::Active | SubscriptionStatus::Canceled)
        };

        let mut lapsed: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| matches!(r.subscription_end_date, Some(end) if end < now))
            .filter(|r| paid(r.subscription_status) || paid(r.package_status))
            .cloned()
            .collect();

        lapsed.sort_by_key(|r| r.subscription_end_date);
        lapsed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(lapsed)
    }

    async fn update_if_unchanged(
        &self,
        record: &UserSubscriptionRecord,
        guard: WriteGuard,
    ) -> BillingResult<WriteOutcome> {
        self.check_available()?;
        if self.failing_writes.read().await.contains(&record.email) {
            return Err(BillingError::Store(format!(
                "write rejected for {}",
                record.email
            )));
        }

        let mut records = self.records.write().await;
        match records.get_mut(&record.id) {
            Some(current) if guard.matches(current) => {
                *current = record.clone();
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }
}
