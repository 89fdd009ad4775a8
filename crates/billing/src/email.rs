//! Email notifications for billing events
//!
//! Sends transactional emails via the Resend API. Delivery is fire-and-forget:
//! failures are logged and never fail the billing transition that caused them.

use async_trait::async_trait;
use larder_shared::{SubscriptionTier, UserId};
use sqlx::PgPool;
use time::macros::format_description;
use time::OffsetDateTime;

/// Outbound notifications raised by billing transitions
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_billing_confirmation(
        &self,
        user_id: UserId,
        amount_cents: i64,
        charged_at: OffsetDateTime,
        next_billing_date: Option<OffsetDateTime>,
    );

    async fn send_downgrade_confirmation(
        &self,
        user_id: UserId,
        from: SubscriptionTier,
        to: SubscriptionTier,
        effective_at: OffsetDateTime,
    );

    async fn send_operator_alert(&self, subject: &str, detail: &str);
}

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key; empty disables sending
    pub resend_api_key: String,
    pub email_from: String,
    /// Recipient of operator alerts
    pub operator_email: String,
    pub app_name: String,
    pub dashboard_url: String,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Larder <noreply@larder.app>".to_string()),
            operator_email: std::env::var("OPERATOR_EMAIL")
                .unwrap_or_else(|_| "billing-ops@larder.app".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Larder".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://larder.app".to_string()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

fn format_amount(amount_cents: i64) -> String {
    format!("${}.{:02}", amount_cents / 100, (amount_cents % 100).abs())
}

fn format_date(at: OffsetDateTime) -> String {
    at.format(format_description!("[month repr:long] [day padding:none], [year]"))
        .unwrap_or_else(|_| at.date().to_string())
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
    pool: PgPool,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig, pool: PgPool) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            pool,
        }
    }

    pub fn from_env(pool: PgPool) -> Self {
        Self::new(EmailConfig::from_env(), pool)
    }

    async fn user_email(&self, user_id: UserId) -> Option<String> {
        match sqlx::query_scalar::<_, String>("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Could not look up user email");
                None
            }
        }
    }

    /// Send an email via Resend; returns whether it was accepted
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> bool {
        if !self.config.is_enabled() {
            tracing::warn!(to = %to, subject = %subject, "Email not configured, skipping");
            return false;
        }

        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                true
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                false
            }
        }
    }

    fn wrap(&self, heading: &str, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #15803d;">{heading}</h2>
    {body}
    <p>
        <a href="{billing_link}" style="display: inline-block; padding: 12px 24px; background-color: #15803d; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            View Plan Details
        </a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            heading = heading,
            body = body,
            billing_link = format!("{}/settings/plan", self.config.dashboard_url),
            app_name = self.config.app_name,
        )
    }
}

#[async_trait]
impl Notifier for BillingEmailService {
    async fn send_billing_confirmation(
        &self,
        user_id: UserId,
        amount_cents: i64,
        charged_at: OffsetDateTime,
        next_billing_date: Option<OffsetDateTime>,
    ) {
        let Some(to) = self.user_email(user_id).await else {
            tracing::warn!(user_id = %user_id, "No email on file, skipping billing confirmation");
            return;
        };

        let next = next_billing_date
            .map(|d| format!("<p><strong>Next billing date:</strong> {}</p>", format_date(d)))
            .unwrap_or_default();
        let body = format!(
            r#"<p>Hi there,</p>
    <p>We received your payment of <strong>{amount}</strong> on {date}. Thank you!</p>
    <div style="background: #f0fdf4; border: 1px solid #bbf7d0; border-radius: 8px; padding: 16px; margin: 20px 0;">
        <p style="margin: 0;"><strong>Amount:</strong> {amount}</p>
        {next}
    </div>"#,
            amount = format_amount(amount_cents),
            date = format_date(charged_at),
            next = next,
        );

        self.send_email(
            &to,
            &format!("Payment received - {}", self.config.app_name),
            &self.wrap("Payment Confirmation", &body),
        )
        .await;
    }

    async fn send_downgrade_confirmation(
        &self,
        user_id: UserId,
        from: SubscriptionTier,
        to: SubscriptionTier,
        effective_at: OffsetDateTime,
    ) {
        let Some(address) = self.user_email(user_id).await else {
            tracing::warn!(user_id = %user_id, "No email on file, skipping downgrade confirmation");
            return;
        };

        let body = format!(
            r#"<p>Hi there,</p>
    <p>Your plan changes from <strong>{from}</strong> to <strong>{to}</strong> on {date}.</p>
    <div style="background: #fefce8; border: 1px solid #fde68a; border-radius: 8px; padding: 16px; margin: 20px 0;">
        <p style="margin: 0;">Until then you keep everything in your {from} plan. On that date, friends,
        categories and items above the {to} plan's limits are removed, newest kept first.</p>
    </div>
    <p>Changed your mind? You can cancel the change any time before {date}.</p>"#,
            from = from.display_name(),
            to = to.display_name(),
            date = format_date(effective_at),
        );

        self.send_email(
            &address,
            &format!(
                "Plan change to {} scheduled - {}",
                to.display_name(),
                self.config.app_name
            ),
            &self.wrap("Plan Change Scheduled", &body),
        )
        .await;
    }

    async fn send_operator_alert(&self, subject: &str, detail: &str) {
        tracing::error!(subject = %subject, detail = %detail, "Operator alert raised");
        let body = format!(
            r#"<pre style="background: #fef2f2; border: 1px solid #fecaca; border-radius: 8px; padding: 16px;">{}</pre>"#,
            detail
        );
        self.send_email(
            &self.config.operator_email,
            &format!("[{}] {}", self.config.app_name, subject),
            &self.wrap(subject, &body),
        )
        .await;
    }
}
