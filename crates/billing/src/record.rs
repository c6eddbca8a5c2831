//! User subscription record
//!
//! The shape of a user row as far as subscriptions are concerned. Only the
//! state machine produces new values of this type; stores persist them.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Plan name shown for users without a paid subscription
pub const FREE_PACKAGE_NAME: &str = "Free";

/// Provider name stamped on subscription and purchase records
pub const PROVIDER_NAME: &str = "iyzico";

/// Value of both `subscription_status` and the legacy `package_status` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Free,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Free => "free",
        }
    }

    /// Parse a stored status. Unknown or empty values read as `Free`.
    pub fn parse(s: &str) -> Self {
        let key = s.trim().to_ascii_lowercase();
        STATUS_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map(|(_, status)| *status)
            .unwrap_or(SubscriptionStatus::Free)
    }

    /// SQL expression that reads `column` the same way [`SubscriptionStatus::parse`] does
    pub fn normalized_sql(column: &str) -> String {
        let arms: String = STATUS_ALIASES
            .iter()
            .map(|(alias, status)| format!("WHEN '{alias}' THEN '{}' ", status.as_str()))
            .collect();
        format!("(CASE lower(btrim({column}, E' \\t\\r\\n')) {arms}ELSE 'free' END)")
    }
}

/// Stored spellings, after trimming and lowercasing, and what they mean
const STATUS_ALIASES: &[(&str, SubscriptionStatus)] = &[
    ("active", SubscriptionStatus::Active),
    ("canceled", SubscriptionStatus::Canceled),
    ("cancelled", SubscriptionStatus::Canceled),
    ("free", SubscriptionStatus::Free),
];

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a user currently sits in the subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Free,
    Active,
    /// Paid access continues until `subscription_end_date`, no renewal will follow
    CanceledPendingExpiry,
    /// End date has passed but the record has not been downgraded yet
    Expired,
}

/// Structured `subscription` column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDetails {
    pub package_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub provider: String,
    pub reference_code: Option<String>,
}

/// Audit entry for the most recent successful payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPurchase {
    pub provider: String,
    pub package_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    pub amount: f64,
    pub reference_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSubscriptionRecord {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub subscription_status: SubscriptionStatus,
    pub package_status: SubscriptionStatus,
    pub package_name: String,
    pub provider_subscription_ref: Option<String>,
    pub subscription: Option<SubscriptionDetails>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_end_date: Option<OffsetDateTime>,
    pub usage_today: i64,
    pub api_counter: i64,
    pub last_purchase: Option<LastPurchase>,
}

impl UserSubscriptionRecord {
    /// A freshly registered user on the free plan
    pub fn new_free(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            name: None,
            is_active: false,
            subscription_status: SubscriptionStatus::Free,
            package_status: SubscriptionStatus::Free,
            package_name: FREE_PACKAGE_NAME.to_string(),
            provider_subscription_ref: None,
            subscription: None,
            subscription_end_date: None,
            usage_today: 0,
            api_counter: 0,
            last_purchase: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name used in emails: the stored name, or the local part of the email
    pub fn display_name(&self) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self
                .email
                .split('@')
                .next()
                .unwrap_or(&self.email)
                .to_string(),
        }
    }

    /// Either status field reads as `status`
    pub fn has_status(&self, status: SubscriptionStatus) -> bool {
        self.subscription_status == status || self.package_status == status
    }

    pub fn lifecycle_state(&self, now: OffsetDateTime) -> LifecycleState {
        if self.subscription_status == SubscriptionStatus::Free
            && self.package_status == SubscriptionStatus::Free
        {
            return LifecycleState::Free;
        }

        if matches!(self.subscription_end_date, Some(end) if end < now) {
            return LifecycleState::Expired;
        }

        if self.has_status(SubscriptionStatus::Canceled) {
            LifecycleState::CanceledPendingExpiry
        } else {
            LifecycleState::Active
        }
    }

    /// Snapshot of the fields a conditional write compares against
    pub fn write_guard(&self) -> WriteGuard {
        WriteGuard {
            subscription_status: self.subscription_status,
            package_status: self.package_status,
            subscription_end_date: self.subscription_end_date,
        }
    }
}

/// Drop sub-microsecond precision so timestamps survive a Postgres round trip
/// and still compare equal in a [`WriteGuard`].
pub fn store_precision(t: OffsetDateTime) -> OffsetDateTime {
    t.replace_nanosecond(t.nanosecond() / 1_000 * 1_000)
        .unwrap_or(t)
}

/// Fields that must be unchanged since the read for a conditional write to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGuard {
    pub subscription_status: SubscriptionStatus,
    pub package_status: SubscriptionStatus,
    pub subscription_end_date: Option<OffsetDateTime>,
}

impl WriteGuard {
    pub fn matches(&self, current: &UserSubscriptionRecord) -> bool {
        *self == current.write_guard()
    }
}
