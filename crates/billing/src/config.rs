//! Billing configuration
//!
//! Loaded once by the binaries and passed to the services at construction.

use std::time::Duration;

/// Default number of lapsed records handled per sweep tick
pub const DEFAULT_SWEEP_PAGE_SIZE: i64 = 500;

/// Settings for the webhook handler and the expiry sweep
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// iyzico secret key. Requests are rejected with a configuration error while unset.
    pub provider_secret: Option<String>,
    /// Maximum records expired per sweep tick
    pub sweep_page_size: i64,
    /// Upper bound for a single store query or write
    pub store_timeout: Duration,
    /// Upper bound for a single notification send
    pub notify_timeout: Duration,
    /// Read-modify-write attempts for a webhook before giving up on a conflict
    pub webhook_write_attempts: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            provider_secret: None,
            sweep_page_size: DEFAULT_SWEEP_PAGE_SIZE,
            store_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(10),
            webhook_write_attempts: 3,
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let provider_secret = std::env::var("IYZICO_SECRET_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            provider_secret,
            sweep_page_size: env_parse("SWEEP_PAGE_SIZE")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.sweep_page_size),
            store_timeout: env_parse("STORE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.store_timeout),
            notify_timeout: env_parse("NOTIFY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.notify_timeout),
            webhook_write_attempts: env_parse("WEBHOOK_WRITE_ATTEMPTS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.webhook_write_attempts),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.provider_secret = Some(secret.into());
        self
    }
}

/// Outbound email settings
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key. Emails are only logged when unset.
    pub resend_api_key: Option<String>,
    pub from_address: String,
    pub from_name: String,
    /// Base URL used for links inside emails
    pub app_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            resend_api_key: None,
            from_address: "no-reply@findco.ai".to_string(),
            from_name: "FindCo".to_string(),
            app_url: "https://findco.ai".to_string(),
        }
    }
}

impl EmailConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            from_address: std::env::var("EMAIL_FROM").unwrap_or(defaults.from_address),
            from_name: std::env::var("EMAIL_FROM_NAME").unwrap_or(defaults.from_name),
            app_url: std::env::var("APP_URL").unwrap_or(defaults.app_url),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
