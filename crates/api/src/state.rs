//! Application state

use std::sync::Arc;

use findco_billing::WebhookHandler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// iyzico webhook handler (owns the record store and the mailer)
    pub webhooks: Arc<WebhookHandler>,
}

impl AppState {
    pub fn new(webhooks: Arc<WebhookHandler>) -> Self {
        Self { webhooks }
    }
}
