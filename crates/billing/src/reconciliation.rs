//! Reconciliation with the payment provider
//!
//! Two entry points keep local state in line with the provider:
//! webhook notifications, and the daily sweep that applies due downgrades and
//! annual referral resets. Both are safe to repeat.

use std::sync::Arc;

use larder_shared::{SubscriptionTier, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::{ExternalSubscription, PaymentProvider};
use crate::rewards::RewardLedger;
use crate::store::{
    claim_with_retry, release_quietly, EventOutcome, PendingChange, SubscriptionStore, TierCommit,
};
use crate::subscriptions::SubscriptionService;
use crate::webhooks::{InvoiceSummary, ProviderEvent, ProviderEventKind, WebhookVerifier};

/// How a notification was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Processed,
    /// Already processed, or being processed by another worker
    Duplicate,
}

/// Counts from one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub downgrades_applied: u32,
    pub downgrades_failed: u32,
    pub resets_applied: u32,
    pub resets_failed: u32,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        self.downgrades_failed > 0 || self.resets_failed > 0
    }
}

#[derive(Clone)]
pub struct ReconciliationProcessor {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    subscriptions: SubscriptionService,
    rewards: RewardLedger,
    verifier: WebhookVerifier,
    event_logger: BillingEventLogger,
}

impl ReconciliationProcessor {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        subscriptions: SubscriptionService,
        rewards: RewardLedger,
        verifier: WebhookVerifier,
    ) -> Self {
        Self {
            event_logger: BillingEventLogger::new(store.clone()),
            store,
            provider,
            notifier,
            subscriptions,
            rewards,
            verifier,
        }
    }

    /// Verify a raw webhook delivery and process it
    pub async fn handle_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<NotificationOutcome> {
        let event = self.verifier.verify(payload, signature)?;
        self.on_provider_notification(event).await
    }

    /// Process a verified notification at most once.
    ///
    /// The event id is claimed before dispatch; a redelivery of a processed
    /// event is acknowledged without side effects. A failed event is recorded
    /// as such and may be re-claimed when the provider redelivers it.
    pub async fn on_provider_notification(
        &self,
        event: ProviderEvent,
    ) -> BillingResult<NotificationOutcome> {
        let claimed = self
            .store
            .claim_event(&event.id, &event.event_type, OffsetDateTime::now_utc())
            .await?;
        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Webhook event already processed, skipping"
            );
            return Ok(NotificationOutcome::Duplicate);
        }

        let result = self.dispatch(&event).await;

        let outcome = match &result {
            Ok(()) => EventOutcome::Success,
            Err(e) => EventOutcome::Error(e.to_string()),
        };
        if let Err(e) = self.store.finish_event(&event.id, outcome).await {
            tracing::error!(
                event_id = %event.id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        match result {
            Ok(()) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event processed"
                );
                Ok(NotificationOutcome::Processed)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event processing failed"
                );
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &ProviderEvent) -> BillingResult<()> {
        match &event.kind {
            ProviderEventKind::PaymentSucceeded(invoice) => {
                self.on_payment_succeeded(event, invoice).await
            }
            ProviderEventKind::PaymentFailed(invoice) => {
                self.on_payment_failed(event, invoice).await
            }
            ProviderEventKind::SubscriptionUpdated(subscription) => {
                self.on_subscription_updated(event, subscription).await
            }
            ProviderEventKind::SubscriptionDeleted(subscription) => {
                self.on_subscription_deleted(event, subscription).await
            }
            ProviderEventKind::Other => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(())
            }
        }
    }

    async fn user_for_invoice(&self, invoice: &InvoiceSummary) -> BillingResult<Option<UserId>> {
        if let Some(subscription_id) = &invoice.subscription_id {
            if let Some(user_id) = self.store.find_user_by_subscription(subscription_id).await? {
                return Ok(Some(user_id));
            }
        }
        match &invoice.customer_id {
            Some(customer_id) => self.store.find_user_by_customer(customer_id).await,
            None => Ok(None),
        }
    }

    async fn on_payment_succeeded(
        &self,
        event: &ProviderEvent,
        invoice: &InvoiceSummary,
    ) -> BillingResult<()> {
        let Some(user_id) = self.user_for_invoice(invoice).await? else {
            tracing::warn!(invoice_id = %invoice.invoice_id, "Paid invoice for unknown customer");
            return Ok(());
        };

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::InvoicePaid)
                    .data(serde_json::json!({
                        "invoice_id": invoice.invoice_id,
                        "amount_cents": invoice.amount_cents,
                        "billing_reason": invoice.billing_reason,
                    }))
                    .stripe_event(event.id.clone())
                    .stripe_subscription_opt(invoice.subscription_id.as_deref())
                    .actor_type(ActorType::Stripe),
            )
            .await;

        // Zero-amount invoices (trials) and subscription starts, which the
        // upgrade flow confirms itself, get no email.
        if invoice.amount_cents <= 0 || invoice.is_subscription_start() {
            return Ok(());
        }
        if !self.store.record_invoice_notified(&invoice.invoice_id).await? {
            tracing::info!(
                user_id = %user_id,
                invoice_id = %invoice.invoice_id,
                "Invoice already confirmed, skipping email"
            );
            return Ok(());
        }

        let next_billing_date = match &invoice.subscription_id {
            Some(id) => match self.provider.retrieve_subscription(id).await {
                Ok(found) => found.and_then(|s| s.next_billing_date()),
                Err(e) => {
                    tracing::warn!(subscription_id = %id, error = %e, "Could not read next billing date");
                    None
                }
            },
            None => None,
        };

        self.notifier
            .send_billing_confirmation(user_id, invoice.amount_cents, event.created, next_billing_date)
            .await;
        Ok(())
    }

    /// Failed payments are left to operators; the tier is never changed here
    async fn on_payment_failed(
        &self,
        event: &ProviderEvent,
        invoice: &InvoiceSummary,
    ) -> BillingResult<()> {
        let user_id = self.user_for_invoice(invoice).await?;

        tracing::warn!(
            user_id = ?user_id,
            invoice_id = %invoice.invoice_id,
            amount_cents = invoice.amount_cents,
            attempt = invoice.attempt_count,
            "Payment failed"
        );

        if let Some(user_id) = user_id {
            self.event_logger
                .log_best_effort(
                    BillingEventBuilder::new(user_id, BillingEventType::PaymentFailed)
                        .data(serde_json::json!({
                            "invoice_id": invoice.invoice_id,
                            "amount_cents": invoice.amount_cents,
                            "attempt_count": invoice.attempt_count,
                        }))
                        .stripe_event(event.id.clone())
                        .stripe_subscription_opt(invoice.subscription_id.as_deref())
                        .actor_type(ActorType::Stripe),
                )
                .await;
        }

        self.notifier
            .send_operator_alert(
                "Payment failed",
                &format!(
                    "invoice {} for user {} failed (attempt {}, {} cents, customer {:?}, subscription {:?})",
                    invoice.invoice_id,
                    user_id.map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string()),
                    invoice.attempt_count,
                    invoice.amount_cents,
                    invoice.customer_id,
                    invoice.subscription_id,
                ),
            )
            .await;
        Ok(())
    }

    /// Mirror an out-of-band cancellation schedule into the local pending downgrade
    async fn on_subscription_updated(
        &self,
        event: &ProviderEvent,
        subscription: &ExternalSubscription,
    ) -> BillingResult<()> {
        let Some(user_id) = self.store.find_user_by_subscription(&subscription.id).await? else {
            // Replaced during an upgrade, or already cleared by a Free downgrade
            tracing::debug!(subscription_id = %subscription.id, "Update for untracked subscription");
            return Ok(());
        };

        let pending = self.store.get_pending_downgrade(user_id).await?;
        let change = match (subscription.scheduled_cancellation(), &pending) {
            (Some(cancel_at), Some(p))
                if p.target_tier == SubscriptionTier::Free && p.effective_at == cancel_at =>
            {
                None
            }
            (Some(cancel_at), _) => Some(PendingChange::Replace {
                target_tier: SubscriptionTier::Free,
                effective_at: cancel_at,
            }),
            (None, Some(p)) if p.target_tier == SubscriptionTier::Free => {
                Some(PendingChange::Clear)
            }
            (None, _) => None,
        };

        let Some(change) = change else {
            return Ok(());
        };

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;
        if snapshot.subscription_id.as_deref() != Some(subscription.id.as_str())
            || snapshot.tier == SubscriptionTier::Free
            || snapshot.tier == SubscriptionTier::Owner
        {
            release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
            return Ok(());
        }

        let description = match &change {
            PendingChange::Replace { effective_at, .. } => {
                format!("cancellation scheduled for {}", effective_at)
            }
            _ => "cancellation withdrawn".to_string(),
        };
        self.store
            .commit_transition(TierCommit {
                pending: change,
                ..TierCommit::unchanged(&snapshot)
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            change = %description,
            "Reconciled pending downgrade with provider"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionUpdated)
                    .data(serde_json::json!({
                        "status": subscription.status,
                        "cancel_at_period_end": subscription.cancel_at_period_end,
                        "change": description,
                    }))
                    .stripe_event(event.id.clone())
                    .stripe_subscription(subscription.id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await;

        Ok(())
    }

    /// A deletion we did not schedule is drift: alert, never change the tier
    async fn on_subscription_deleted(
        &self,
        event: &ProviderEvent,
        subscription: &ExternalSubscription,
    ) -> BillingResult<()> {
        let Some(user_id) = self.store.find_user_by_subscription(&subscription.id).await? else {
            tracing::debug!(subscription_id = %subscription.id, "Deletion of untracked subscription");
            return Ok(());
        };

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionDeleted)
                    .data(serde_json::json!({ "status": subscription.status }))
                    .stripe_event(event.id.clone())
                    .stripe_subscription(subscription.id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await;

        if self.store.get_pending_downgrade(user_id).await?.is_some() {
            tracing::info!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                "Subscription ended ahead of pending downgrade; sweep will apply it"
            );
            return Ok(());
        }

        let drift = BillingError::ExternalStateDrift(format!(
            "subscription {} of user {} was deleted at the provider without a pending downgrade",
            subscription.id, user_id
        ));
        tracing::error!(user_id = %user_id, error = %drift, "Subscription state drift");
        self.notifier
            .send_operator_alert("Subscription deleted out-of-band", &drift.to_string())
            .await;
        Ok(())
    }

    /// Apply every due downgrade and annual reset.
    ///
    /// Per-user failures are logged and counted; they never stop the sweep.
    /// Overlapping runs are harmless: whichever run applies a downgrade
    /// removes it, and the other finds nothing due.
    pub async fn daily_sweep(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let mut report = SweepReport::default();

        let due = self.store.list_due_downgrades(now).await?;
        tracing::info!(count = due.len(), "Applying due downgrades");
        for pending in due {
            match self.subscriptions.apply_downgrade(pending.user_id, now).await {
                Ok(Some(_)) => report.downgrades_applied += 1,
                Ok(None) => {}
                Err(e) => {
                    report.downgrades_failed += 1;
                    tracing::error!(
                        user_id = %pending.user_id,
                        target_tier = %pending.target_tier,
                        error = %e,
                        "Failed to apply downgrade"
                    );
                }
            }
        }

        let today = now.date();
        let resets = self.store.list_due_annual_resets(today).await?;
        for user_id in resets {
            match self.rewards.evaluate_annual_reset(user_id, today).await {
                Ok(true) => report.resets_applied += 1,
                Ok(false) => {}
                Err(e) => {
                    report.resets_failed += 1;
                    tracing::error!(user_id = %user_id, error = %e, "Failed to apply annual reset");
                }
            }
        }

        tracing::info!(
            downgrades_applied = report.downgrades_applied,
            downgrades_failed = report.downgrades_failed,
            resets_applied = report.resets_applied,
            resets_failed = report.resets_failed,
            "Daily sweep finished"
        );

        Ok(report)
    }
}
