//! iyzico webhook handling
//!
//! Turns a decoded webhook body into a record mutation and a structured
//! response. [`WebhookHandler::handle`] never fails: every error is mapped to
//! a status code and a `{success: false, error}` body.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::config::BillingConfig;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::event::{normalize, SubscriptionEvent, SubscriptionEventKind};
use crate::invariants::audit_committed;
use crate::state_machine::{apply_transition, Transition};
use crate::store::{bounded, RecordStore, WriteOutcome};

/// Pause between read-modify-write attempts after a conflict
const CONFLICT_RETRY_INTERVAL_MS: u64 = 25;

/// JSON body returned to the provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookResponseBody {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Status code plus body, independent of the HTTP framework
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: WebhookResponseBody,
}

impl WebhookResponse {
    pub fn ok(message: &str, data: Option<Value>) -> Self {
        Self {
            status: 200,
            body: WebhookResponseBody {
                success: true,
                message: Some(message.to_string()),
                error: None,
                data,
            },
        }
    }

    pub fn failure(status: u16, error: &str) -> Self {
        Self {
            status,
            body: WebhookResponseBody {
                success: false,
                message: None,
                error: Some(error.to_string()),
                data: None,
            },
        }
    }
}

impl From<&BillingError> for WebhookResponse {
    fn from(err: &BillingError) -> Self {
        Self::failure(err.status_code(), &err.public_message())
    }
}

/// What a handled event did
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Activated {
        email: String,
        package_name: String,
        end_date: OffsetDateTime,
    },
    Cancelled {
        email: String,
    },
    Ended {
        email: String,
    },
    /// Known event that left the record as it was
    Unchanged {
        email: String,
        kind: SubscriptionEventKind,
    },
    /// Event type this service does not act on
    Ignored {
        event_type: Option<String>,
    },
}

impl WebhookOutcome {
    pub fn into_response(self) -> WebhookResponse {
        match self {
            WebhookOutcome::Activated {
                email,
                package_name,
                end_date,
            } => {
                let end_date = end_date
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default();
                WebhookResponse::ok(
                    "Subscription activated",
                    Some(serde_json::json!({
                        "email": email,
                        "package": package_name,
                        "endDate": end_date,
                    })),
                )
            }
            WebhookOutcome::Cancelled { .. } => WebhookResponse::ok("Subscription cancelled", None),
            WebhookOutcome::Ended { .. } => WebhookResponse::ok("Subscription expired", None),
            WebhookOutcome::Unchanged { .. } => WebhookResponse::ok("No change required", None),
            WebhookOutcome::Ignored { .. } => WebhookResponse::ok("Event ignored", None),
        }
    }
}

/// Webhook handler for iyzico subscription events
pub struct WebhookHandler {
    config: BillingConfig,
    store: Arc<dyn RecordStore>,
    email: BillingEmailService,
}

impl WebhookHandler {
    pub fn new(config: BillingConfig, store: Arc<dyn RecordStore>, email: BillingEmailService) -> Self {
        Self {
            config,
            store,
            email,
        }
    }

    /// Handle a decoded webhook body and build the response
    pub async fn handle(&self, payload: &Value) -> WebhookResponse {
        match self.process(payload).await {
            Ok(outcome) => outcome.into_response(),
            Err(e) => {
                match &e {
                    BillingError::Configuration(_) => {
                        tracing::error!(error = %e, "Webhook rejected: server configuration error");
                    }
                    BillingError::Validation(_) | BillingError::UserNotFound(_) => {
                        tracing::warn!(error = %e, "Webhook rejected");
                    }
                    _ => {
                        tracing::error!(error = %e, "Webhook processing failed");
                    }
                }
                WebhookResponse::from(&e)
            }
        }
    }

    /// Validate, normalize and apply one event
    pub async fn process(&self, payload: &Value) -> BillingResult<WebhookOutcome> {
        if self.config.provider_secret.is_none() {
            return Err(BillingError::Configuration(
                "IYZICO_SECRET_KEY is not set".to_string(),
            ));
        }

        let event = normalize(payload)?;

        tracing::info!(
            event_type = ?event.event_type,
            reference_code = ?event.reference_code,
            paid_price = event.paid_amount,
            "iyzico webhook received"
        );

        if event.kind == SubscriptionEventKind::Unknown {
            tracing::info!(event_type = ?event.event_type, "Ignoring unhandled iyzico event type");
            return Ok(WebhookOutcome::Ignored {
                event_type: event.event_type,
            });
        }

        let email = event.customer_email()?.to_string();
        let transition = self.apply_with_retry(&event, &email).await?;

        // Mutation is committed; a failed email does not change the outcome
        if let Some(notification) = &transition.notification {
            self.email.notify(notification).await;
        }

        Ok(self.outcome(&event, email, transition))
    }

    async fn apply_with_retry(
        &self,
        event: &SubscriptionEvent,
        email: &str,
    ) -> BillingResult<Transition> {
        let retries = self.config.webhook_write_attempts.saturating_sub(1);
        let strategy = FixedInterval::from_millis(CONFLICT_RETRY_INTERVAL_MS).take(retries);

        RetryIf::spawn(
            strategy,
            || self.apply_once(event, email),
            |e: &BillingError| {
                let conflict = matches!(e, BillingError::WriteConflict(_));
                if conflict {
                    tracing::warn!(email = %email, "Concurrent update on user record, retrying");
                }
                conflict
            },
        )
        .await
    }

    /// One read-modify-write cycle against the store
    async fn apply_once(
        &self,
        event: &SubscriptionEvent,
        email: &str,
    ) -> BillingResult<Transition> {
        let timeout: Duration = self.config.store_timeout;
        let current = bounded(timeout, "user lookup", self.store.find_by_email(email))
            .await?
            .ok_or_else(|| BillingError::UserNotFound(email.to_string()))?;

        let transition = apply_transition(&current, event, OffsetDateTime::now_utc());
        let Some(next) = transition.record.as_ref() else {
            return Ok(transition);
        };

        let outcome = bounded(
            timeout,
            "user update",
            self.store.update_if_unchanged(next, current.write_guard()),
        )
        .await?;

        match outcome {
            WriteOutcome::Applied => {
                tracing::info!(
                    email = %email,
                    from = ?transition.from,
                    to = ?transition.to,
                    "Subscription state updated"
                );
                audit_committed(next);
                Ok(transition)
            }
            WriteOutcome::Conflict => Err(BillingError::WriteConflict(email.to_string())),
        }
    }

    fn outcome(
        &self,
        event: &SubscriptionEvent,
        email: String,
        transition: Transition,
    ) -> WebhookOutcome {
        let Some(record) = transition.record else {
            return WebhookOutcome::Unchanged {
                email,
                kind: event.kind,
            };
        };

        match event.kind {
            SubscriptionEventKind::Started | SubscriptionEventKind::Renewed => {
                WebhookOutcome::Activated {
                    email,
                    package_name: record.package_name,
                    end_date: record
                        .subscription_end_date
                        .unwrap_or_else(OffsetDateTime::now_utc),
                }
            }
            SubscriptionEventKind::Cancelled => WebhookOutcome::Cancelled { email },
            SubscriptionEventKind::Expired | SubscriptionEventKind::PaymentFailed => {
                WebhookOutcome::Ended { email }
            }
            SubscriptionEventKind::Unknown => WebhookOutcome::Ignored {
                event_type: event.event_type.clone(),
            },
        }
    }
}
