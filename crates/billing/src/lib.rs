// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries provider messages
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Larder Billing Module
//!
//! Subscription tier lifecycle on top of Stripe.
//!
//! ## Features
//!
//! - **Upgrades**: Immediate tier changes with a prorated charge for Basic → Premium
//! - **Downgrades**: Scheduled for period end, applied by the daily sweep with
//!   content retention enforced for the new tier
//! - **Referral Rewards**: Discounts and free periods for completed referrals,
//!   with a yearly reset
//! - **Reconciliation**: Signed Stripe webhooks, deduplicated by event id
//! - **Invariant Checks**: Periodic detection of billing state drift

pub mod client;
pub mod email;
pub mod error;
pub mod events;
pub mod invariants;
pub mod proration;
pub mod provider;
pub mod reconciliation;
pub mod rewards;
pub mod store;
pub mod stripe_provider;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod testing;

use std::sync::Arc;

// Client
pub use client::{PlanPrices, PriceIds, StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig, Notifier};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Proration
pub use proration::{compute_upgrade_charge, period_days};

// Provider
pub use provider::{
    ExternalSubscription, ExternalSubscriptionStatus, NewSubscription, OneOffCharge,
    PaymentProvider, ScheduledChange,
};
pub use stripe_provider::StripeProvider;

// Reconciliation
pub use reconciliation::{NotificationOutcome, ReconciliationProcessor, SweepReport};

// Rewards
pub use rewards::{ReferralStats, RewardLedger, RewardOutcome, RewardTable, RewardTier};

// Store
pub use store::{
    AnnualReset, AnnualResetMarker, PendingDowngrade, PgSubscriptionStore, PrunedContent,
    ReferralReward, RewardKind, SubscriptionStore, UserSubscription, CLAIM_TIMEOUT,
};

// Subscriptions
pub use subscriptions::{
    AppliedDowngrade, ScheduledDowngrade, SubscriptionService, SubscriptionStatusView,
    UpgradeRequest, UpgradeResult,
};

// Webhooks
pub use webhooks::{parse_event, ProviderEvent, ProviderEventKind, WebhookVerifier};

use sqlx::PgPool;

/// Main billing service that wires every lifecycle component to the same
/// store, provider and notifier
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub rewards: RewardLedger,
    pub reconciliation: ReconciliationProcessor,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let table = RewardTable::from_env()?;
        let notifier: Arc<dyn Notifier> = Arc::new(BillingEmailService::from_env(pool.clone()));
        Ok(Self::assemble(stripe, pool, notifier, table))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool, table: RewardTable) -> Self {
        let notifier: Arc<dyn Notifier> = Arc::new(BillingEmailService::from_env(pool.clone()));
        Self::assemble(StripeClient::new(config), pool, notifier, table)
    }

    fn assemble(
        stripe: StripeClient,
        pool: PgPool,
        notifier: Arc<dyn Notifier>,
        table: RewardTable,
    ) -> Self {
        let config = stripe.config().clone();
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let provider: Arc<dyn PaymentProvider> = Arc::new(StripeProvider::new(stripe));

        let subscriptions = SubscriptionService::new(
            store.clone(),
            provider.clone(),
            notifier.clone(),
            config.clone(),
        );
        let rewards = RewardLedger::new(store.clone(), provider.clone(), notifier.clone(), table);
        let reconciliation = ReconciliationProcessor::new(
            store,
            provider,
            notifier,
            subscriptions.clone(),
            rewards.clone(),
            WebhookVerifier::new(config.webhook_secret),
        );

        Self {
            subscriptions,
            rewards,
            reconciliation,
            invariants: InvariantChecker::new(pool),
        }
    }
}
