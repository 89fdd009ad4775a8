//! Stripe webhook verification and parsing
//!
//! Payloads are verified against the `Stripe-Signature` header by hand and
//! decoded into a provider-neutral [`ProviderEvent`]. Only the fields the
//! reconciliation flow reads are decoded, so newer Stripe API versions with
//! extra or reshaped fields elsewhere in the payload still parse.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::provider::{ExternalSubscription, ExternalSubscriptionStatus};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed webhook timestamp
pub const SIGNATURE_TOLERANCE: Duration = Duration::minutes(5);

/// A verified provider notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: String,
    /// Raw provider event type, e.g. `invoice.paid`
    pub event_type: String,
    pub created: OffsetDateTime,
    pub kind: ProviderEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    PaymentSucceeded(InvoiceSummary),
    PaymentFailed(InvoiceSummary),
    SubscriptionUpdated(ExternalSubscription),
    SubscriptionDeleted(ExternalSubscription),
    /// Acknowledged and ignored
    Other,
}

/// The parts of an invoice the reconciliation flow needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSummary {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub amount_cents: i64,
    pub attempt_count: u64,
    /// Why the invoice exists, e.g. `subscription_create` or `subscription_cycle`
    pub billing_reason: Option<String>,
}

impl InvoiceSummary {
    /// First invoice of a subscription this system just created
    pub fn is_subscription_start(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }
}

/// Verifies `Stripe-Signature` headers (`t=<unix>,v1=<hex hmac>[,v1=...]`)
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance", &self.tolerance)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: SIGNATURE_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Verify and parse a webhook delivery
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<ProviderEvent> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc())
    }

    pub fn verify_at(
        &self,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ProviderEvent> {
        self.verify_signature(payload, signature, now)?;
        parse_event(payload)
    }

    fn verify_signature(
        &self,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        if self.secret.is_empty() {
            tracing::error!("Webhook secret not configured");
            return Err(BillingError::Config(
                "STRIPE_WEBHOOK_SECRET not set".to_string(),
            ));
        }

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let age = now.unix_timestamp() - timestamp;
        if age.abs() > self.tolerance.whole_seconds() {
            tracing::warn!(timestamp, age_secs = age, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());

        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Header value for `payload` signed at `timestamp`; used to build test deliveries
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// `customer` and `subscription` are ids unless the payload expanded them
#[derive(Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    amount_due: i64,
    #[serde(default)]
    attempt_count: u64,
    billing_reason: Option<String>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    customer: Expandable,
    status: ExternalSubscriptionStatus,
    #[serde(default)]
    items: Option<RawList<RawSubscriptionItem>>,
    current_period_start: i64,
    current_period_end: i64,
    #[serde(default)]
    cancel_at_period_end: bool,
    cancel_at: Option<i64>,
    trial_end: Option<i64>,
}

#[derive(Deserialize)]
struct RawList<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawSubscriptionItem {
    price: Option<RawPrice>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
}

fn timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| BillingError::InvalidInput(format!("invalid timestamp {}: {}", ts, e)))
}

fn malformed(event_type: &str, e: serde_json::Error) -> BillingError {
    tracing::error!(event_type = %event_type, error = %e, "Failed to parse webhook object");
    BillingError::InvalidInput(format!("malformed {} payload: {}", event_type, e))
}

fn parse_invoice(event_type: &str, object: serde_json::Value) -> BillingResult<InvoiceSummary> {
    let raw: RawInvoice =
        serde_json::from_value(object).map_err(|e| malformed(event_type, e))?;
    let amount_cents = if raw.amount_paid > 0 {
        raw.amount_paid
    } else {
        raw.amount_due
    };
    Ok(InvoiceSummary {
        invoice_id: raw.id,
        customer_id: raw.customer.map(Expandable::into_id),
        subscription_id: raw.subscription.map(Expandable::into_id),
        amount_cents,
        attempt_count: raw.attempt_count,
        billing_reason: raw.billing_reason,
    })
}

fn parse_subscription(
    event_type: &str,
    object: serde_json::Value,
) -> BillingResult<ExternalSubscription> {
    let raw: RawSubscription =
        serde_json::from_value(object).map_err(|e| malformed(event_type, e))?;
    let price_id = raw
        .items
        .and_then(|items| items.data.into_iter().next())
        .and_then(|item| item.price)
        .map(|price| price.id);

    Ok(ExternalSubscription {
        id: raw.id,
        customer_id: raw.customer.into_id(),
        status: raw.status,
        price_id,
        current_period_start: timestamp(raw.current_period_start)?,
        current_period_end: timestamp(raw.current_period_end)?,
        cancel_at_period_end: raw.cancel_at_period_end,
        cancel_at: raw.cancel_at.map(timestamp).transpose()?,
        trial_end: raw.trial_end.map(timestamp).transpose()?,
    })
}

/// Decode a verified payload
pub fn parse_event(payload: &str) -> BillingResult<ProviderEvent> {
    let raw: RawEvent = serde_json::from_str(payload).map_err(|e| {
        tracing::error!(error = %e, "Failed to parse webhook event JSON");
        BillingError::InvalidInput(format!("malformed webhook event: {}", e))
    })?;

    let kind = match raw.event_type.as_str() {
        "invoice.paid" | "invoice.payment_succeeded" => {
            ProviderEventKind::PaymentSucceeded(parse_invoice(&raw.event_type, raw.data.object)?)
        }
        "invoice.payment_failed" => {
            ProviderEventKind::PaymentFailed(parse_invoice(&raw.event_type, raw.data.object)?)
        }
        "customer.subscription.updated" => ProviderEventKind::SubscriptionUpdated(
            parse_subscription(&raw.event_type, raw.data.object)?,
        ),
        "customer.subscription.deleted" => ProviderEventKind::SubscriptionDeleted(
            parse_subscription(&raw.event_type, raw.data.object)?,
        ),
        _ => ProviderEventKind::Other,
    };

    Ok(ProviderEvent {
        id: raw.id,
        created: timestamp(raw.created)?,
        event_type: raw.event_type,
        kind,
    })
}
