//! Billing Events Module
//!
//! Append-only audit trail of subscription transitions. Answers "why is this
//! user on this tier?" after the fact. Logging is best effort: callers log a
//! failure with `warn!` and carry on, the transition itself never depends on it.

use std::sync::Arc;

use larder_shared::{SubscriptionTier, UserId};
use serde::{Deserialize, Serialize};

use crate::error::BillingResult;
use crate::store::{BillingEventRecord, SubscriptionStore};

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    CustomerCreated,
    TierUpgraded,
    DowngradeScheduled,
    DowngradeCancelled,
    DowngradeApplied,
    UpgradeCharged,
    InvoicePaid,
    PaymentFailed,
    SubscriptionUpdated,
    SubscriptionDeleted,
    RewardGranted,
    RewardReset,
    AccountClosed,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
            BillingEventType::TierUpgraded => "TIER_UPGRADED",
            BillingEventType::DowngradeScheduled => "DOWNGRADE_SCHEDULED",
            BillingEventType::DowngradeCancelled => "DOWNGRADE_CANCELLED",
            BillingEventType::DowngradeApplied => "DOWNGRADE_APPLIED",
            BillingEventType::UpgradeCharged => "UPGRADE_CHARGED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionDeleted => "SUBSCRIPTION_DELETED",
            BillingEventType::RewardGranted => "REWARD_GRANTED",
            BillingEventType::RewardReset => "REWARD_RESET",
            BillingEventType::AccountClosed => "ACCOUNT_CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the app
    User,
    /// Scheduled sweep
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    user_id: UserId,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: UserId, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Record the tiers on both sides of a transition
    pub fn transition(self, from: SubscriptionTier, to: SubscriptionTier) -> Self {
        let mut data = self.event_data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert("from_tier".to_string(), from.as_str().into());
            map.insert("to_tier".to_string(), to.as_str().into());
        }
        self.data(data)
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn stripe_subscription_opt(mut self, subscription_id: Option<&str>) -> Self {
        self.stripe_subscription_id = subscription_id.map(str::to_string);
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> BillingEventRecord {
        BillingEventRecord {
            user_id: self.user_id,
            event_type: self.event_type.to_string(),
            event_data: self.event_data,
            stripe_event_id: self.stripe_event_id,
            stripe_subscription_id: self.stripe_subscription_id,
            actor_type: self.actor_type.to_string(),
        }
    }
}

/// Writes billing events through the subscription store
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn SubscriptionStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        self.store.append_billing_event(builder.build()).await
    }

    /// Log and swallow failures; for callers whose outcome must not depend on the audit trail
    pub async fn log_best_effort(&self, builder: BillingEventBuilder) {
        let record = builder.build();
        let user_id = record.user_id;
        let event_type = record.event_type.clone();
        if let Err(e) = self.store.append_billing_event(record).await {
            tracing::warn!(
                user_id = %user_id,
                event_type = %event_type,
                error = %e,
                "Failed to log billing event (non-fatal)"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(BillingEventType::DowngradeApplied.to_string(), "DOWNGRADE_APPLIED");
        assert_eq!(BillingEventType::RewardGranted.to_string(), "REWARD_GRANTED");
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn test_event_builder() {
        let user_id = UserId::new();
        let record = BillingEventBuilder::new(user_id, BillingEventType::DowngradeScheduled)
            .data(serde_json::json!({ "effective_at": "2026-11-01T00:00:00Z" }))
            .transition(SubscriptionTier::Premium, SubscriptionTier::Basic)
            .stripe_subscription("sub_123")
            .actor_type(ActorType::User)
            .build();

        assert_eq!(record.user_id, user_id);
        assert_eq!(record.event_type, "DOWNGRADE_SCHEDULED");
        assert_eq!(record.actor_type, "user");
        assert_eq!(record.stripe_subscription_id.as_deref(), Some("sub_123"));
        assert_eq!(record.event_data["from_tier"], "premium");
        assert_eq!(record.event_data["to_tier"], "basic");
        assert_eq!(record.event_data["effective_at"], "2026-11-01T00:00:00Z");
    }
}
