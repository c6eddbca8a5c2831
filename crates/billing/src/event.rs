//! iyzico event normalization
//!
//! iyzico has shipped several payload shapes over time. Every concept is read
//! from a fixed precedence list and folded into one typed [`SubscriptionEvent`]
//! so nothing downstream touches the raw JSON.
//!
//! | Concept        | Fields, in order                                              |
//! |----------------|---------------------------------------------------------------|
//! | event type     | `eventType`, `iyziEventType`                                  |
//! | customer email | `customerEmail`, `customer.email`                             |
//! | reference code | `subscriptionReferenceCode`, `referenceCode`                  |
//! | plan name      | `pricingPlanName`, `pricingPlan.name`, then `"Premium"`       |
//! | period unit    | `pricingPlan.paymentInterval`, `paymentInterval`, `MONTHLY`   |
//! | period count   | `pricingPlan.paymentIntervalCount`, `paymentIntervalCount`, 1 |
//! | paid amount    | `paidPrice` (number or numeric string), 0                     |

use serde_json::Value;

use crate::error::{BillingError, BillingResult};

/// Plan name used when the payload carries none
pub const DEFAULT_PLAN_NAME: &str = "Premium";

/// Longest billing period an event may grant (ten years)
pub const MAX_PERIOD_DAYS: i64 = 3_650;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    Started,
    Renewed,
    Cancelled,
    Expired,
    PaymentFailed,
    /// Anything this service does not act on. Acknowledged, never an error.
    Unknown,
}

impl SubscriptionEventKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type.trim() {
            "subscription.started" => SubscriptionEventKind::Started,
            "subscription.renewed" => SubscriptionEventKind::Renewed,
            "subscription.cancelled" => SubscriptionEventKind::Cancelled,
            "subscription.expired" => SubscriptionEventKind::Expired,
            "subscription.payment.failed" => SubscriptionEventKind::PaymentFailed,
            _ => SubscriptionEventKind::Unknown,
        }
    }
}

/// Billing period unit of a pricing plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodUnit {
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl PeriodUnit {
    /// Case-insensitive; unknown units read as monthly
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "WEEKLY" => PeriodUnit::Weekly,
            "YEARLY" => PeriodUnit::Yearly,
            _ => PeriodUnit::Monthly,
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            PeriodUnit::Weekly => 7,
            PeriodUnit::Monthly => 30,
            PeriodUnit::Yearly => 365,
        }
    }
}

/// Canonical, provider-agnostic subscription notification
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub kind: SubscriptionEventKind,
    /// Raw event type as sent by the provider, kept for logging
    pub event_type: Option<String>,
    /// Always present unless `kind` is `Unknown`
    pub customer_email: Option<String>,
    pub reference_code: Option<String>,
    pub plan_name: String,
    pub period_unit: PeriodUnit,
    /// Always at least 1
    pub period_count: i64,
    pub paid_amount: f64,
}

impl SubscriptionEvent {
    /// Length of the paid period this event grants, at most [`MAX_PERIOD_DAYS`]
    pub fn period(&self) -> time::Duration {
        time::Duration::days(period_days(self.period_unit, self.period_count).min(MAX_PERIOD_DAYS))
    }

    pub fn customer_email(&self) -> BillingResult<&str> {
        self.customer_email
            .as_deref()
            .ok_or_else(|| BillingError::Validation("Missing customer email".to_string()))
    }
}

/// Turn a decoded webhook body into a [`SubscriptionEvent`]
///
/// Fails when a known event kind arrives without a customer email, or when a
/// started or renewed event grants more than [`MAX_PERIOD_DAYS`].
pub fn normalize(payload: &Value) -> BillingResult<SubscriptionEvent> {
    let event_type = first_str(payload, &[&["eventType"], &["iyziEventType"]]);
    let kind = event_type
        .as_deref()
        .map(SubscriptionEventKind::from_event_type)
        .unwrap_or(SubscriptionEventKind::Unknown);

    let customer_email = first_str(payload, &[&["customerEmail"], &["customer", "email"]]);
    if customer_email.is_none() && kind != SubscriptionEventKind::Unknown {
        return Err(BillingError::Validation("Missing customer email".to_string()));
    }

    let reference_code = first_str(
        payload,
        &[&["subscriptionReferenceCode"], &["referenceCode"]],
    );

    let plan_name = first_str(payload, &[&["pricingPlanName"], &["pricingPlan", "name"]])
        .unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string());

    let period_unit = first_str(
        payload,
        &[&["pricingPlan", "paymentInterval"], &["paymentInterval"]],
    )
    .map(|s| PeriodUnit::parse(&s))
    .unwrap_or_default();

    let period_count = first_number(
        payload,
        &[
            &["pricingPlan", "paymentIntervalCount"],
            &["paymentIntervalCount"],
        ],
    )
    .map(|n| n as i64)
    .filter(|n| *n > 0)
    .unwrap_or(1);

    let grants_period = matches!(
        kind,
        SubscriptionEventKind::Started | SubscriptionEventKind::Renewed
    );
    if grants_period && period_days(period_unit, period_count) > MAX_PERIOD_DAYS {
        return Err(BillingError::Validation(format!(
            "Billing period too long: {period_count} x {period_unit:?}"
        )));
    }

    let paid_amount = first_number(payload, &[&["paidPrice"]])
        .filter(|n| n.is_finite())
        .unwrap_or(0.0);

    Ok(SubscriptionEvent {
        kind,
        event_type,
        customer_email,
        reference_code,
        plan_name,
        period_unit,
        period_count,
        paid_amount,
    })
}

fn period_days(unit: PeriodUnit, count: i64) -> i64 {
    unit.days().saturating_mul(count.max(1))
}

fn lookup<'a>(payload: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(payload, |value, key| value.get(*key))
}

fn first_str(payload: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        lookup(payload, path)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn first_number(payload: &Value, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|path| match lookup(payload, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}
