// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! FindCo Billing Module
//!
//! Keeps user subscription records in step with iyzico.
//!
//! ## Features
//!
//! - **Event Normalization**: Fold the provider's payload shapes into one typed event
//! - **State Machine**: Pure transitions between free, active, canceled and expired
//! - **Webhooks**: Apply provider events to user records
//! - **Expiry Sweep**: Downgrade subscriptions whose period ended without renewal
//! - **Email Notifications**: Payment succeeded, plan ended
//! - **Invariants**: Consistency checks over the `users` table

pub mod config;
pub mod email;
pub mod error;
pub mod event;
pub mod invariants;
pub mod record;
pub mod state_machine;
pub mod store;
pub mod sweep;
pub mod webhooks;


// Config
pub use config::{BillingConfig, EmailConfig};

// Email
pub use email::{
    BillingEmailService, EmailTemplate, LogNotifier, Notifier, RecordingNotifier,
    ResendNotifier, SentEmail,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use event::{normalize, PeriodUnit, SubscriptionEvent, SubscriptionEventKind};

// Records
pub use record::{
    LastPurchase, LifecycleState, SubscriptionDetails, SubscriptionStatus,
    UserSubscriptionRecord, WriteGuard,
};

// State machine
pub use state_machine::{apply_transition, EndReason, Notification, Transition};

// Store
pub use store::{InMemoryRecordStore, PgRecordStore, RecordStore, WriteOutcome};

// Sweep
pub use sweep::{ExpirySweep, SweepRecordResult, SweepSummary};

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome, WebhookResponse, WebhookResponseBody};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use std::sync::Arc;

/// Webhook handler and expiry sweep sharing one store and one mailer
pub struct BillingService {
    pub email: BillingEmailService,
    pub webhooks: Arc<WebhookHandler>,
    pub sweep: Arc<ExpirySweep>,
}

impl BillingService {
    pub fn new(config: BillingConfig, email_config: EmailConfig, store: Arc<dyn RecordStore>) -> Self {
        let email = BillingEmailService::from_config(email_config, config.notify_timeout);

        Self::with_email(config, store, email)
    }

    /// Create a billing service with an explicit mailer
    pub fn with_email(
        config: BillingConfig,
        store: Arc<dyn RecordStore>,
        email: BillingEmailService,
    ) -> Self {
        if config.provider_secret.is_none() {
            tracing::warn!("IYZICO_SECRET_KEY not set, webhooks will be rejected");
        }

        Self {
            email: email.clone(),
            webhooks: Arc::new(WebhookHandler::new(
                config.clone(),
                store.clone(),
                email.clone(),
            )),
            sweep: Arc::new(ExpirySweep::new(config, store, email)),
        }
    }

    /// Create a billing service from environment variables
    pub fn from_env(store: Arc<dyn RecordStore>) -> Self {
        Self::new(BillingConfig::from_env(), EmailConfig::from_env(), store)
    }
}
