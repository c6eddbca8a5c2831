//! Subscription state machine
//!
//! Pure functions from `(current record, event, now)` to a [`Transition`]:
//! the full replacement record (if anything changes) and the notification to
//! send once it is committed. Nothing here touches the store or the mailer.
//!
//! ```text
//!   Started/Renewed (any state) ───────────────▶ Active
//!   Cancelled (Active) ────────────────────────▶ CanceledPendingExpiry
//!   Expired/PaymentFailed (any state) ─────────▶ Free
//!   end date passed (Active | CanceledPending) ▶ Free   (sweep)
//! ```

use time::OffsetDateTime;

use crate::event::{SubscriptionEvent, SubscriptionEventKind, DEFAULT_PLAN_NAME};
use crate::record::{
    store_precision, LastPurchase, LifecycleState, SubscriptionDetails, SubscriptionStatus,
    UserSubscriptionRecord, FREE_PACKAGE_NAME, PROVIDER_NAME,
};

/// Why a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Provider reported `subscription.expired`
    ProviderExpired,
    /// Provider reported `subscription.payment.failed`
    PaymentFailed,
    /// End date passed without a renewal (sweep)
    PeriodElapsed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ProviderExpired => "provider_expired",
            EndReason::PaymentFailed => "payment_failed",
            EndReason::PeriodElapsed => "period_elapsed",
        }
    }
}

/// Email to send after a transition is committed
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PaymentSucceeded {
        to: String,
        user_name: String,
        package_name: String,
        end_date: OffsetDateTime,
    },
    SubscriptionEnded {
        to: String,
        user_name: String,
        /// Plan name captured before the record was cleared
        package_name: String,
        reason: EndReason,
    },
}

/// Result of applying an event to a record
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    /// Full replacement value, `None` when the event changes nothing
    pub record: Option<UserSubscriptionRecord>,
    pub notification: Option<Notification>,
}

impl Transition {
    fn noop(state: LifecycleState) -> Self {
        Self {
            from: state,
            to: state,
            record: None,
            notification: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.record.is_none()
    }
}

/// Apply a provider event to the current record
pub fn apply_transition(
    current: &UserSubscriptionRecord,
    event: &SubscriptionEvent,
    now: OffsetDateTime,
) -> Transition {
    match event.kind {
        SubscriptionEventKind::Started | SubscriptionEventKind::Renewed => {
            activate(current, event, now)
        }
        SubscriptionEventKind::Cancelled => cancel(current, now),
        SubscriptionEventKind::Expired => downgrade(current, EndReason::ProviderExpired, now),
        SubscriptionEventKind::PaymentFailed => downgrade(current, EndReason::PaymentFailed, now),
        SubscriptionEventKind::Unknown => Transition::noop(current.lifecycle_state(now)),
    }
}

/// Started/Renewed: grant a fresh period starting now
///
/// The end date is recomputed from `now` on every call, so a replayed event
/// moves the end date instead of stacking periods.
pub fn activate(
    current: &UserSubscriptionRecord,
    event: &SubscriptionEvent,
    now: OffsetDateTime,
) -> Transition {
    let now = store_precision(now);
    let end_date = now.saturating_add(event.period());
    let reference = event
        .reference_code
        .clone()
        .or_else(|| current.provider_subscription_ref.clone());

    let mut next = current.clone();
    next.is_active = true;
    next.subscription_status = SubscriptionStatus::Active;
    next.package_status = SubscriptionStatus::Active;
    next.package_name = event.plan_name.clone();
    next.provider_subscription_ref = reference.clone();
    next.subscription = Some(SubscriptionDetails {
        package_name: event.plan_name.clone(),
        start_date: now,
        end_date,
        provider: PROVIDER_NAME.to_string(),
        reference_code: reference.clone(),
    });
    next.subscription_end_date = Some(end_date);
    next.usage_today = 0;
    next.api_counter = 0;
    next.last_purchase = Some(LastPurchase {
        provider: PROVIDER_NAME.to_string(),
        package_name: event.plan_name.clone(),
        date: now,
        amount: event.paid_amount,
        reference_code: reference,
    });

    let notification = Notification::PaymentSucceeded {
        to: current.email.clone(),
        user_name: current.display_name(),
        package_name: event.plan_name.clone(),
        end_date,
    };

    Transition {
        from: current.lifecycle_state(now),
        to: LifecycleState::Active,
        record: Some(next),
        notification: Some(notification),
    }
}

/// Cancelled: stop renewal but keep paid access until the end date
///
/// Only the status fields change. Records that are not currently active are
/// left alone.
pub fn cancel(current: &UserSubscriptionRecord, now: OffsetDateTime) -> Transition {
    let from = current.lifecycle_state(now);
    if from != LifecycleState::Active {
        return Transition::noop(from);
    }

    let mut next = current.clone();
    next.subscription_status = SubscriptionStatus::Canceled;
    next.package_status = SubscriptionStatus::Canceled;

    Transition {
        from,
        to: LifecycleState::CanceledPendingExpiry,
        record: Some(next),
        notification: None,
    }
}

/// Expired/PaymentFailed: drop to the free plan
///
/// A record that is already fully free is a no-op, so a repeated expiry
/// neither writes nor emails.
pub fn downgrade(
    current: &UserSubscriptionRecord,
    reason: EndReason,
    now: OffsetDateTime,
) -> Transition {
    let from = current.lifecycle_state(now);
    if is_fully_free(current) {
        return Transition::noop(from);
    }

    let ended_package = ended_package_name(current);
    let was_subscribed = !(current.subscription_status == SubscriptionStatus::Free
        && current.package_status == SubscriptionStatus::Free);

    let mut next = current.clone();
    next.is_active = false;
    next.subscription_status = SubscriptionStatus::Free;
    next.package_status = SubscriptionStatus::Free;
    next.package_name = FREE_PACKAGE_NAME.to_string();
    next.subscription = None;
    next.subscription_end_date = None;

    let notification = was_subscribed.then(|| Notification::SubscriptionEnded {
        to: current.email.clone(),
        user_name: current.display_name(),
        package_name: ended_package,
        reason,
    });

    Transition {
        from,
        to: LifecycleState::Free,
        record: Some(next),
        notification,
    }
}

/// Time-based expiry used by the sweep
///
/// Re-checks the sweep predicate against the record as read, so a record that
/// was renewed or downgraded in the meantime is left alone.
pub fn expire_if_lapsed(current: &UserSubscriptionRecord, now: OffsetDateTime) -> Transition {
    if !matches_expiry_predicate(current, now) {
        return Transition::noop(current.lifecycle_state(now));
    }
    downgrade(current, EndReason::PeriodElapsed, now)
}

/// End date set and in the past, and still active or canceled
pub fn matches_expiry_predicate(record: &UserSubscriptionRecord, now: OffsetDateTime) -> bool {
    let lapsed = matches!(record.subscription_end_date, Some(end) if end < now);
    let paid_status = record.has_status(SubscriptionStatus::Active)
        || record.has_status(SubscriptionStatus::Canceled);
    lapsed && paid_status
}

fn is_fully_free(record: &UserSubscriptionRecord) -> bool {
    !record.is_active
        && record.subscription_status == SubscriptionStatus::Free
        && record.package_status == SubscriptionStatus::Free
        && record.package_name == FREE_PACKAGE_NAME
        && record.subscription.is_none()
        && record.subscription_end_date.is_none()
}

fn ended_package_name(record: &UserSubscriptionRecord) -> String {
    let name = record.package_name.trim();
    if name.is_empty() || name == FREE_PACKAGE_NAME {
        record
            .subscription
            .as_ref()
            .map(|s| s.package_name.clone())
            .unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string())
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PeriodUnit;
    use crate::invariants::check_record;
    use time::macros::datetime;
    use time::Duration;

    fn event(kind: SubscriptionEventKind) -> SubscriptionEvent {
        SubscriptionEvent {
            kind,
            event_type: None,
            customer_email: Some("a@x.com".to_string()),
            reference_code: Some("sub-ref-1".to_string()),
            plan_name: "Pro".to_string(),
            period_unit: PeriodUnit::Monthly,
            period_count: 1,
            paid_amount: 99.0,
        }
    }

    fn active_record(now: OffsetDateTime) -> UserSubscriptionRecord {
        let free = UserSubscriptionRecord::new_free("a@x.com");
        activate(&free, &event(SubscriptionEventKind::Started), now)
            .record
            .unwrap()
    }

    #[test]
    fn test_started_activates_free_user() {
        let t0 = datetime!(2025-01-01 10:00 UTC);
        let mut free = UserSubscriptionRecord::new_free("a@x.com");
        free.usage_today = 3;
        free.api_counter = 12;

        let transition = apply_transition(&free, &event(SubscriptionEventKind::Started), t0);
        assert_eq!(transition.from, LifecycleState::Free);
        assert_eq!(transition.to, LifecycleState::Active);

        let record = transition.record.unwrap();
        assert!(record.is_active);
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.package_status, SubscriptionStatus::Active);
        assert_eq!(record.package_name, "Pro");
        assert_eq!(record.subscription_end_date, Some(t0 + Duration::days(30)));
        assert_eq!(record.usage_today, 0);
        assert_eq!(record.api_counter, 0);
        assert_eq!(record.provider_subscription_ref.as_deref(), Some("sub-ref-1"));

        let sub = record.subscription.as_ref().unwrap();
        assert_eq!(sub.start_date, t0);
        assert_eq!(sub.end_date, t0 + Duration::days(30));
        assert_eq!(sub.provider, "iyzico");

        let purchase = record.last_purchase.as_ref().unwrap();
        assert_eq!(purchase.amount, 99.0);
        assert_eq!(purchase.date, t0);

        assert!(check_record(&record).is_empty());
        assert!(matches!(
            transition.notification,
            Some(Notification::PaymentSucceeded { ref package_name, .. }) if package_name == "Pro"
        ));
    }

    #[test]
    fn test_period_units_and_counts() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let free = UserSubscriptionRecord::new_free("a@x.com");

        let cases = [
            (PeriodUnit::Weekly, 1, 7),
            (PeriodUnit::Weekly, 3, 21),
            (PeriodUnit::Monthly, 1, 30),
            (PeriodUnit::Monthly, 6, 180),
            (PeriodUnit::Yearly, 1, 365),
            (PeriodUnit::Yearly, 2, 730),
            (PeriodUnit::Monthly, 0, 30),
            (PeriodUnit::Weekly, -4, 7),
        ];

        for (unit, count, days) in cases {
            let mut ev = event(SubscriptionEventKind::Renewed);
            ev.period_unit = unit;
            ev.period_count = count;
            let record = activate(&free, &ev, t0).record.unwrap();
            assert_eq!(
                record.subscription_end_date,
                Some(t0 + Duration::days(days)),
                "{unit:?} x {count}"
            );
        }
    }

    #[test]
    fn test_oversized_period_is_clamped() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let free = UserSubscriptionRecord::new_free("a@x.com");

        for count in [11, 100_000, i64::MAX] {
            let mut ev = event(SubscriptionEventKind::Started);
            ev.period_unit = PeriodUnit::Yearly;
            ev.period_count = count;
            assert_eq!(ev.period(), Duration::days(crate::event::MAX_PERIOD_DAYS));

            let record = activate(&free, &ev, t0).record.unwrap();
            assert_eq!(
                record.subscription_end_date,
                Some(t0 + Duration::days(crate::event::MAX_PERIOD_DAYS))
            );
        }
    }

    #[test]
    fn test_renewal_replay_is_last_event_wins() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let t1 = datetime!(2025-01-20 00:00 UTC);
        let renewed = event(SubscriptionEventKind::Renewed);

        let first = activate(&UserSubscriptionRecord::new_free("a@x.com"), &renewed, t0)
            .record
            .unwrap();
        let second = activate(&first, &renewed, t1).record.unwrap();

        assert_eq!(second.subscription_end_date, Some(t1 + Duration::days(30)));
        assert_ne!(second.subscription_end_date, Some(t0 + Duration::days(60)));
        assert!(check_record(&second).is_empty());
    }

    #[test]
    fn test_missing_reference_keeps_previous_ref() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let active = active_record(t0);
        let mut ev = event(SubscriptionEventKind::Renewed);
        ev.reference_code = None;

        let record = activate(&active, &ev, t0 + Duration::days(30))
            .record
            .unwrap();
        assert_eq!(record.provider_subscription_ref.as_deref(), Some("sub-ref-1"));
    }

    #[test]
    fn test_cancel_only_flips_status() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let active = active_record(t0);

        let transition = apply_transition(
            &active,
            &event(SubscriptionEventKind::Cancelled),
            t0 + Duration::days(5),
        );
        assert_eq!(transition.to, LifecycleState::CanceledPendingExpiry);
        assert!(transition.notification.is_none());

        let record = transition.record.unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(record.package_status, SubscriptionStatus::Canceled);
        assert_eq!(record.is_active, active.is_active);
        assert_eq!(record.subscription, active.subscription);
        assert_eq!(record.subscription_end_date, active.subscription_end_date);
        assert!(check_record(&record).is_empty());
    }

    #[test]
    fn test_cancel_is_noop_unless_active() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let free = UserSubscriptionRecord::new_free("a@x.com");
        assert!(cancel(&free, t0).is_noop());

        let canceled = cancel(&active_record(t0), t0).record.unwrap();
        assert!(cancel(&canceled, t0).is_noop());
    }

    #[test]
    fn test_expired_and_payment_failed_downgrade() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        for (kind, reason) in [
            (SubscriptionEventKind::Expired, EndReason::ProviderExpired),
            (SubscriptionEventKind::PaymentFailed, EndReason::PaymentFailed),
        ] {
            let active = active_record(t0);
            let transition = apply_transition(&active, &event(kind), t0 + Duration::days(3));
            let record = transition.record.unwrap();

            assert!(!record.is_active);
            assert!(record.subscription.is_none());
            assert!(record.subscription_end_date.is_none());
            assert_eq!(record.package_name, "Free");
            assert_eq!(record.subscription_status, SubscriptionStatus::Free);
            assert_eq!(record.package_status, SubscriptionStatus::Free);
            assert_eq!(record.provider_subscription_ref.as_deref(), Some("sub-ref-1"));
            assert!(check_record(&record).is_empty());

            assert_eq!(
                transition.notification,
                Some(Notification::SubscriptionEnded {
                    to: "a@x.com".to_string(),
                    user_name: "a".to_string(),
                    package_name: "Pro".to_string(),
                    reason,
                })
            );
        }
    }

    #[test]
    fn test_expire_twice_is_noop_second_time() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let expired_event = event(SubscriptionEventKind::Expired);

        let once = apply_transition(&active_record(t0), &expired_event, t0)
            .record
            .unwrap();
        let twice = apply_transition(&once, &expired_event, t0);

        assert!(twice.is_noop());
        assert!(twice.notification.is_none());
    }

    #[test]
    fn test_unknown_event_changes_nothing() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let transition = apply_transition(
            &active_record(t0),
            &event(SubscriptionEventKind::Unknown),
            t0,
        );
        assert!(transition.is_noop());
        assert!(transition.notification.is_none());
    }

    #[test]
    fn test_sweep_expiry_covers_canceled_records() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let canceled = cancel(&active_record(t0), t0).record.unwrap();

        assert!(expire_if_lapsed(&canceled, t0 + Duration::days(29)).is_noop());

        let transition = expire_if_lapsed(&canceled, t0 + Duration::days(31));
        assert_eq!(transition.from, LifecycleState::Expired);
        assert_eq!(transition.to, LifecycleState::Free);
        let record = transition.record.unwrap();
        assert!(!record.is_active);
        assert!(check_record(&record).is_empty());
    }

    #[test]
    fn test_sweep_predicate_excludes_free_with_stale_date() {
        let t0 = datetime!(2025-01-01 00:00 UTC);
        let mut stale = UserSubscriptionRecord::new_free("a@x.com");
        stale.subscription_end_date = Some(t0 - Duration::days(10));

        assert!(!matches_expiry_predicate(&stale, t0));
        assert!(expire_if_lapsed(&stale, t0).is_noop());
    }

    #[test]
    fn test_ended_package_name_fallbacks() {
        let mut record = UserSubscriptionRecord::new_free("a@x.com");
        record.subscription_status = SubscriptionStatus::Active;
        record.package_status = SubscriptionStatus::Active;
        record.package_name = String::new();
        assert_eq!(ended_package_name(&record), DEFAULT_PLAN_NAME);

        record.package_name = "Team".to_string();
        assert_eq!(ended_package_name(&record), "Team");
    }

    #[test]
    fn test_store_precision_applied_to_timestamps() {
        let t0 = datetime!(2025-01-01 00:00:00.123456789 UTC);
        let record = activate(
            &UserSubscriptionRecord::new_free("a@x.com"),
            &event(SubscriptionEventKind::Started),
            t0,
        )
        .record
        .unwrap();
        assert_eq!(record.subscription_end_date.unwrap().nanosecond(), 123_456_000);
    }
}
