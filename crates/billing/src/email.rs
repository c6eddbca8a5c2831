//! Subscription email notifications
//!
//! Delivery is best-effort. [`BillingEmailService`] renders the templates,
//! sends them through a [`Notifier`] under a timeout and reports success as a
//! `bool`; no failure ever reaches the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::config::EmailConfig;
use crate::error::{BillingError, BillingResult};
use crate::state_machine::Notification;
use crate::store::bounded;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Outbound mail transport
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> BillingResult<()>;
}

/// Sends email through the Resend HTTP API
pub struct ResendNotifier {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl ResendNotifier {
    pub fn new(api_key: impl Into<String>, from_name: &str, from_address: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            from: format!("{} <{}>", from_name, from_address),
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> BillingResult<()> {
        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": html,
                "text": text,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "Resend returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

/// Logs instead of sending; used when no mail provider is configured
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, _html: &str, _text: &str) -> BillingResult<()> {
        tracing::info!(to = %to, subject = %subject, "Email not sent (no provider configured)");
        Ok(())
    }
}

/// A message captured by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Keeps messages in memory instead of sending them
#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<SentEmail>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, to: &str, subject: &str, _html: &str, text: &str) -> BillingResult<()> {
        self.sent.lock().await.push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }
}

/// Rendered email content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Subscription email service
#[derive(Clone)]
pub struct BillingEmailService {
    notifier: Arc<dyn Notifier>,
    config: EmailConfig,
    timeout: Duration,
}

impl BillingEmailService {
    pub fn new(notifier: Arc<dyn Notifier>, config: EmailConfig, timeout: Duration) -> Self {
        Self {
            notifier,
            config,
            timeout,
        }
    }

    /// Resend when `RESEND_API_KEY` is set, log-only otherwise
    pub fn from_config(config: EmailConfig, timeout: Duration) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.resend_api_key {
            Some(key) => Arc::new(ResendNotifier::new(
                key.clone(),
                &config.from_name,
                &config.from_address,
            )),
            None => {
                tracing::warn!("Email notifications not configured (missing RESEND_API_KEY)");
                Arc::new(LogNotifier)
            }
        };
        Self::new(notifier, config, timeout)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.resend_api_key.is_some()
    }

    /// Render and send the email for a committed transition
    ///
    /// Returns whether the provider accepted it. Failures and timeouts are
    /// logged and swallowed.
    pub async fn notify(&self, notification: &Notification) -> bool {
        let (to, template) = self.render(notification);
        self.send(to, &template).await
    }

    pub fn render<'a>(&self, notification: &'a Notification) -> (&'a str, EmailTemplate) {
        match notification {
            Notification::PaymentSucceeded {
                to,
                user_name,
                package_name,
                end_date,
            } => (
                to,
                self.payment_success_template(user_name, package_name, *end_date),
            ),
            Notification::SubscriptionEnded {
                to,
                user_name,
                package_name,
                ..
            } => (to, self.subscription_ended_template(user_name, package_name)),
        }
    }

    async fn send(&self, to: &str, template: &EmailTemplate) -> bool {
        let result = bounded(
            self.timeout,
            "email send",
            self.notifier
                .send(to, &template.subject, &template.html, &template.text),
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(to = %to, subject = %template.subject, "Email sent");
                true
            }
            Err(e) => {
                tracing::error!(to = %to, error = %e, "Failed to send email");
                false
            }
        }
    }

    fn payment_success_template(
        &self,
        user_name: &str,
        package_name: &str,
        end_date: OffsetDateTime,
    ) -> EmailTemplate {
        let valid_until = format_date(end_date);
        let brand = &self.config.from_name;
        let html = format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: 'Segoe UI', sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background: linear-gradient(135deg, #11998e 0%, #38ef7d 100%); color: white; padding: 30px; text-align: center; border-radius: 10px 10px 0 0;">
      <h1>Your subscription is active!</h1>
    </div>
    <div style="background: #f8f9fa; padding: 30px; border-radius: 0 0 10px 10px;">
      <p>Hi {user_name},</p>
      <p>We received your payment through iyzico.</p>
      <div style="background: white; padding: 20px; border-radius: 10px; margin: 20px 0; border-left: 4px solid #11998e;">
        <h3>{package_name}</h3>
        <p><strong>Valid until:</strong> {valid_until}</p>
      </div>
      <p>Enjoy the premium features!</p>
    </div>
    <p style="text-align: center; color: #666; font-size: 12px;">&copy; {brand}</p>
  </div>
</body>
</html>"#,
            user_name = escape_html(user_name),
            package_name = escape_html(package_name),
            brand = escape_html(brand),
        );

        EmailTemplate {
            subject: "Your subscription is active!".to_string(),
            html,
            text: format!(
                "Hi {}, your {} subscription is active. Valid until: {}",
                user_name, package_name, valid_until
            ),
        }
    }

    fn subscription_ended_template(&self, user_name: &str, package_name: &str) -> EmailTemplate {
        let profile_url = format!("{}/profile", self.config.app_url.trim_end_matches('/'));
        let brand = &self.config.from_name;
        let html = format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: 'Segoe UI', sans-serif; line-height: 1.6; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; padding: 30px; text-align: center; border-radius: 10px 10px 0 0;">
      <h1>Your plan has ended</h1>
    </div>
    <div style="background: #f8f9fa; padding: 30px; border-radius: 0 0 10px 10px;">
      <p>Hi {user_name},</p>
      <p>Your <strong>{package_name}</strong> plan has ended and your account moved to the <strong>Free</strong> plan.</p>
      <div style="background: white; padding: 20px; border-radius: 10px; margin: 20px 0; border-left: 4px solid #667eea;">
        <h3>Still included</h3>
        <ul>
          <li>3 generations per day</li>
          <li>Core AI features</li>
        </ul>
      </div>
      <a href="{profile_url}" style="display: inline-block; background: #667eea; color: white; padding: 12px 30px; text-decoration: none; border-radius: 5px;">Choose a plan</a>
    </div>
    <p style="text-align: center; color: #666; font-size: 12px;">&copy; {brand}</p>
  </div>
</body>
</html>"#,
            user_name = escape_html(user_name),
            package_name = escape_html(package_name),
            profile_url = escape_html(&profile_url),
            brand = escape_html(brand),
        );

        EmailTemplate {
            subject: "Your plan has ended".to_string(),
            html,
            text: format!(
                "Hi {}, your {} plan has ended and your account moved to the Free plan. Upgrade again: {}",
                user_name, package_name, profile_url
            ),
        }
    }
}

fn format_date(date: OffsetDateTime) -> String {
    date.format(format_description!("[day] [month repr:long] [year]"))
        .unwrap_or_else(|_| date.date().to_string())
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
