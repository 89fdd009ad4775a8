//! Subscription management
//!
//! Tier transitions follow one protocol:
//! 1. claim the user's subscription row (short write, retried while busy)
//! 2. talk to the payment provider with no database lock held
//! 3. commit the outcome with a version-guarded write, or release the claim
//!
//! A provider failure therefore never leaves a half-applied tier locally.
//! Downgrades are always deferred to the end of the paid period and applied
//! later by the sweep through [`SubscriptionService::apply_downgrade`].

use std::sync::Arc;

use larder_shared::{RetentionPolicy, SubscriptionTier, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::proration::{compute_upgrade_charge, period_days};
use crate::provider::{
    ExternalSubscription, ExternalSubscriptionStatus, NewSubscription, OneOffCharge,
    PaymentProvider, ScheduledChange,
};
use crate::store::{
    claim_with_retry, release_quietly, DowngradeOutcome, PendingChange, PendingDowngrade,
    PrunedContent, SubscriptionStore, TierCommit, UserSubscription,
};

/// Request to move a user to a higher tier
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub user_id: UserId,
    pub target_tier: SubscriptionTier,
    /// Payment method to attach and make default; required when the user is
    /// not already billed
    pub payment_method_id: Option<String>,
    /// Used when a provider customer has to be created
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeResult {
    pub from_tier: SubscriptionTier,
    pub tier: SubscriptionTier,
    pub subscription_id: String,
    /// Prorated amount charged immediately, zero when the new subscription's
    /// first invoice collects the price
    pub charged_cents: i64,
    pub charge_id: Option<String>,
    pub next_billing_date: Option<OffsetDateTime>,
}

/// Information about a scheduled downgrade
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledDowngrade {
    pub current_tier: SubscriptionTier,
    pub new_tier: SubscriptionTier,
    pub effective_date: OffsetDateTime,
}

/// A downgrade that the sweep applied
#[derive(Debug, Clone, Serialize)]
pub struct AppliedDowngrade {
    pub from_tier: SubscriptionTier,
    pub to_tier: SubscriptionTier,
    pub pruned: PrunedContent,
}

/// Caller-facing view of a user's subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatusView {
    pub tier: SubscriptionTier,
    /// Provider status; `None` without a recurring subscription
    pub billing_status: Option<ExternalSubscriptionStatus>,
    pub has_active_billing: bool,
    pub next_billing_date: Option<OffsetDateTime>,
    pub pending_downgrade: Option<PendingDowngrade>,
}

/// The paid-tier state machine
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    config: StripeConfig,
    event_logger: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        config: StripeConfig,
    ) -> Self {
        Self {
            event_logger: BillingEventLogger::new(store.clone()),
            store,
            provider,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Signup: every user starts on Free
    pub async fn register_user(&self, user_id: UserId) -> BillingResult<UserSubscription> {
        self.store.create_subscription(user_id).await
    }

    async fn load(&self, user_id: UserId) -> BillingResult<UserSubscription> {
        self.store
            .get_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))
    }

    fn price_id(&self, tier: SubscriptionTier) -> BillingResult<String> {
        self.config
            .price_id_for_tier(tier)
            .map(str::to_string)
            .ok_or_else(|| BillingError::Config(format!("no price configured for {}", tier)))
    }

    fn check_upgrade(from: SubscriptionTier, to: SubscriptionTier) -> BillingResult<()> {
        if from == SubscriptionTier::Owner || to == SubscriptionTier::Owner {
            return Err(BillingError::invalid_transition(
                from,
                to,
                "the owner tier is administrative and cannot be purchased",
            ));
        }
        if !from.is_upgrade(to) {
            return Err(BillingError::invalid_transition(
                from,
                to,
                "target tier is not higher than the current tier",
            ));
        }
        if !to.is_purchasable() {
            return Err(BillingError::invalid_transition(from, to, "tier is not purchasable"));
        }
        Ok(())
    }

    fn check_downgrade(from: SubscriptionTier, to: SubscriptionTier) -> BillingResult<()> {
        if from == SubscriptionTier::Owner {
            return Err(BillingError::invalid_transition(
                from,
                to,
                "the owner tier is administrative and is not billed",
            ));
        }
        if !from.is_downgrade(to) {
            return Err(BillingError::invalid_transition(
                from,
                to,
                "target tier is not lower than the current tier",
            ));
        }
        Ok(())
    }

    /// Move the user to a higher tier.
    ///
    /// Basic → Premium inside an active billing period charges the prorated
    /// difference immediately and starts the Premium subscription with a trial
    /// that ends when the Basic period would have, so the rest of the cycle is
    /// not billed twice. Other upgrades start a new subscription whose first
    /// invoice collects the full price.
    pub async fn upgrade(&self, request: UpgradeRequest) -> BillingResult<UpgradeResult> {
        let user_id = request.user_id;
        let target = request.target_tier;

        let current = self.load(user_id).await?;
        Self::check_upgrade(current.tier, target)?;

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;
        let outcome = self.upgrade_claimed(&snapshot, &request).await;

        let (result, customer_id) = match outcome {
            Ok(done) => done,
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                tracing::warn!(
                    user_id = %user_id,
                    from_tier = %snapshot.tier,
                    to_tier = %target,
                    error = %e,
                    "Upgrade aborted"
                );
                return Err(e);
            }
        };

        let commit = TierCommit {
            tier: target,
            customer_id: Some(customer_id),
            subscription_id: Some(result.subscription_id.clone()),
            pending: PendingChange::Clear,
            ..TierCommit::unchanged(&snapshot)
        };
        if let Err(e) = self.store.commit_transition(commit).await {
            self.notifier
                .send_operator_alert(
                    "Upgrade completed at provider but not recorded",
                    &format!(
                        "user {} paid for {} (subscription {}, charge {:?}) but the local commit failed: {}",
                        user_id, target, result.subscription_id, result.charge_id, e
                    ),
                )
                .await;
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            from_tier = %result.from_tier,
            to_tier = %target,
            charged_cents = result.charged_cents,
            subscription_id = %result.subscription_id,
            "Upgraded subscription"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::TierUpgraded)
                    .transition(result.from_tier, target)
                    .data(serde_json::json!({
                        "from_tier": result.from_tier,
                        "to_tier": target,
                        "charged_cents": result.charged_cents,
                        "charge_id": result.charge_id,
                    }))
                    .stripe_subscription(result.subscription_id.clone())
                    .actor_type(ActorType::User),
            )
            .await;

        // The provider reports the charge invoice as paid too; whichever side
        // marks it first sends the confirmation.
        if let Some(charge_id) = &result.charge_id {
            match self.store.record_invoice_notified(charge_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(
                        user_id = %user_id,
                        charge_id = %charge_id,
                        "Upgrade charge already confirmed, skipping email"
                    );
                    return Ok(result);
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, charge_id = %charge_id, error = %e, "Failed to record notified invoice");
                }
            }
        }
        let amount = if result.charged_cents > 0 {
            result.charged_cents
        } else {
            self.config.price_cents_for_tier(target)
        };
        self.notifier
            .send_billing_confirmation(
                user_id,
                amount,
                OffsetDateTime::now_utc(),
                result.next_billing_date,
            )
            .await;

        Ok(result)
    }

    /// Provider side of an upgrade; returns the result and the customer handle
    async fn upgrade_claimed(
        &self,
        snapshot: &UserSubscription,
        request: &UpgradeRequest,
    ) -> BillingResult<(UpgradeResult, String)> {
        let user_id = snapshot.user_id;
        let target = request.target_tier;
        Self::check_upgrade(snapshot.tier, target)?;
        let price_id = self.price_id(target)?;

        let existing = match &snapshot.subscription_id {
            Some(id) => match self.provider.retrieve_subscription(id).await? {
                Some(sub) if sub.status.is_billing() => Some(sub),
                other => {
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %id,
                        status = ?other.map(|s| s.status),
                        "Recorded subscription is not billing at the provider"
                    );
                    None
                }
            },
            None => None,
        };

        if existing.is_none() && request.payment_method_id.is_none() {
            return Err(BillingError::PaymentMethodRequired);
        }

        let customer_id = match &snapshot.customer_id {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .provider
                    .create_customer(user_id, request.email.as_deref())
                    .await?;
                self.event_logger
                    .log_best_effort(
                        BillingEventBuilder::new(user_id, BillingEventType::CustomerCreated)
                            .data(serde_json::json!({ "customer_id": id }))
                            .actor_type(ActorType::User),
                    )
                    .await;
                id
            }
        };

        if let Some(pm) = &request.payment_method_id {
            self.provider.attach_payment_method(&customer_id, pm).await?;
        }

        let now = OffsetDateTime::now_utc();
        let Some(existing) = existing else {
            let created = self
                .provider
                .create_subscription(NewSubscription {
                    user_id,
                    customer_id: customer_id.clone(),
                    price_id,
                    trial_end: None,
                })
                .await?;
            return Ok((
                UpgradeResult {
                    from_tier: snapshot.tier,
                    tier: target,
                    next_billing_date: created.next_billing_date(),
                    subscription_id: created.id,
                    charged_cents: 0,
                    charge_id: None,
                },
                customer_id,
            ));
        };

        let prorated = snapshot.tier == SubscriptionTier::Basic
            && target == SubscriptionTier::Premium
            && existing.current_period_end > now;

        let (charged_cents, charge_id, trial_end) = if prorated {
            let (remaining, total) =
                period_days(existing.current_period_start, existing.current_period_end, now);
            let amount = compute_upgrade_charge(
                remaining,
                total,
                self.config.price_cents_for_tier(snapshot.tier),
                self.config.price_cents_for_tier(target),
            );
            let charge_id = if amount > 0 {
                Some(
                    self.provider
                        .charge_once(OneOffCharge {
                            customer_id: customer_id.clone(),
                            amount_cents: amount,
                            description: format!(
                                "Upgrade from {} to {} (prorated)",
                                snapshot.tier.display_name(),
                                target.display_name()
                            ),
                            idempotency_key: upgrade_charge_key(user_id, &existing, target),
                        })
                        .await?,
                )
            } else {
                None
            };
            if let Some(charge_id) = &charge_id {
                self.event_logger
                    .log_best_effort(
                        BillingEventBuilder::new(user_id, BillingEventType::UpgradeCharged)
                            .transition(snapshot.tier, target)
                            .data(serde_json::json!({
                                "amount_cents": amount,
                                "charge_id": charge_id,
                                "remaining_days": remaining,
                                "period_days": total,
                            }))
                            .stripe_subscription(existing.id.clone())
                            .actor_type(ActorType::User),
                    )
                    .await;
            }
            (amount, charge_id, Some(existing.current_period_end))
        } else {
            (0, None, None)
        };

        let replaced = self
            .replace_subscription(&existing, user_id, &customer_id, price_id, trial_end)
            .await;

        match replaced {
            Ok(created) => Ok((
                UpgradeResult {
                    from_tier: snapshot.tier,
                    tier: target,
                    next_billing_date: created.next_billing_date(),
                    subscription_id: created.id,
                    charged_cents,
                    charge_id,
                },
                customer_id,
            )),
            Err(e) => {
                if let Some(charge_id) = &charge_id {
                    self.notifier
                        .send_operator_alert(
                            "Upgrade charge collected without a subscription change",
                            &format!(
                                "user {} was charged {} cents (charge {}) for {} but replacing subscription {} failed: {}. Refund or complete manually.",
                                user_id, charged_cents, charge_id, target, existing.id, e
                            ),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Start the new subscription, then cancel the old one. If the old one
    /// cannot be cancelled the new one is rolled back so the user is never
    /// billed for both.
    async fn replace_subscription(
        &self,
        old: &ExternalSubscription,
        user_id: UserId,
        customer_id: &str,
        price_id: String,
        trial_end: Option<OffsetDateTime>,
    ) -> BillingResult<ExternalSubscription> {
        let created = self
            .provider
            .create_subscription(NewSubscription {
                user_id,
                customer_id: customer_id.to_string(),
                price_id,
                trial_end,
            })
            .await?;

        if let Err(e) = self.provider.cancel_subscription(&old.id).await {
            if let Err(rollback) = self.provider.cancel_subscription(&created.id).await {
                tracing::error!(
                    user_id = %user_id,
                    old_subscription = %old.id,
                    new_subscription = %created.id,
                    error = %rollback,
                    "Failed to roll back new subscription; customer may be billed twice"
                );
                self.notifier
                    .send_operator_alert(
                        "Duplicate subscriptions after failed upgrade",
                        &format!(
                            "user {} holds subscriptions {} and {}; cancel one manually",
                            user_id, old.id, created.id
                        ),
                    )
                    .await;
            }
            return Err(e);
        }

        Ok(created)
    }

    /// Schedule a move to a lower tier at the end of the current billing period.
    ///
    /// Replaces any existing pending downgrade, keeping its effective date.
    /// The user keeps the current tier until the sweep applies the change.
    pub async fn schedule_downgrade(
        &self,
        user_id: UserId,
        new_tier: SubscriptionTier,
    ) -> BillingResult<ScheduledDowngrade> {
        let current = self.load(user_id).await?;
        Self::check_downgrade(current.tier, new_tier)?;

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;
        let outcome = self.schedule_claimed(&snapshot, new_tier).await;

        let (scheduled, subscription_id) = match outcome {
            Ok(done) => done,
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Err(e);
            }
        };

        let commit = TierCommit {
            pending: PendingChange::Replace {
                target_tier: new_tier,
                effective_at: scheduled.effective_date,
            },
            ..TierCommit::unchanged(&snapshot)
        };
        self.store.commit_transition(commit).await?;

        tracing::info!(
            user_id = %user_id,
            current_tier = %scheduled.current_tier,
            new_tier = %new_tier,
            effective_date = %scheduled.effective_date,
            "Scheduled subscription downgrade for period end"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::DowngradeScheduled)
                    .data(serde_json::json!({
                        "effective_at": scheduled.effective_date.unix_timestamp(),
                    }))
                    .transition(scheduled.current_tier, new_tier)
                    .stripe_subscription(subscription_id)
                    .actor_type(ActorType::User),
            )
            .await;

        self.notifier
            .send_downgrade_confirmation(
                user_id,
                scheduled.current_tier,
                new_tier,
                scheduled.effective_date,
            )
            .await;

        Ok(scheduled)
    }

    async fn schedule_claimed(
        &self,
        snapshot: &UserSubscription,
        new_tier: SubscriptionTier,
    ) -> BillingResult<(ScheduledDowngrade, String)> {
        let user_id = snapshot.user_id;
        Self::check_downgrade(snapshot.tier, new_tier)?;

        let subscription_id = snapshot.subscription_id.clone().ok_or_else(|| {
            BillingError::invalid_transition(
                snapshot.tier,
                new_tier,
                "no active subscription to downgrade",
            )
        })?;

        let external = self
            .provider
            .retrieve_subscription(&subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::ExternalStateDrift(format!(
                    "subscription {} for user {} is missing at the provider",
                    subscription_id, user_id
                ))
            })?;

        let effective_date = match self.store.get_pending_downgrade(user_id).await? {
            Some(existing) => existing.effective_at,
            None => external.current_period_end,
        };

        let change = if new_tier == SubscriptionTier::Free {
            ScheduledChange::Cancel
        } else {
            ScheduledChange::SwitchPrice(self.price_id(new_tier)?)
        };
        self.provider
            .schedule_change(&subscription_id, change)
            .await?;

        Ok((
            ScheduledDowngrade {
                current_tier: snapshot.tier,
                new_tier,
                effective_date,
            },
            subscription_id,
        ))
    }

    /// Drop the pending downgrade and undo its provider-side instruction.
    /// Returns false when there was nothing to cancel.
    pub async fn cancel_pending_downgrade(&self, user_id: UserId) -> BillingResult<bool> {
        if self.store.get_pending_downgrade(user_id).await?.is_none() {
            return Ok(false);
        }

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;
        let outcome: BillingResult<Option<PendingDowngrade>> = async {
            let Some(pending) = self.store.get_pending_downgrade(user_id).await? else {
                return Ok(None);
            };
            if let Some(subscription_id) = &snapshot.subscription_id {
                let price_id = self.price_id(snapshot.tier)?;
                self.provider
                    .clear_scheduled_change(subscription_id, &price_id)
                    .await?;
            }
            Ok(Some(pending))
        }
        .await;

        let pending = match outcome {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Ok(false);
            }
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Err(e);
            }
        };

        self.store
            .commit_transition(TierCommit {
                pending: PendingChange::Clear,
                ..TierCommit::unchanged(&snapshot)
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            target_tier = %pending.target_tier,
            "Cancelled scheduled downgrade"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::DowngradeCancelled)
                    .transition(snapshot.tier, pending.target_tier)
                    .stripe_subscription_opt(snapshot.subscription_id.as_deref())
                    .actor_type(ActorType::User),
            )
            .await;

        Ok(true)
    }

    /// Apply a due pending downgrade. Called by the sweep.
    ///
    /// Prunes content above the new tier's retention limits. This deletes
    /// user data and cannot be undone. Returns `None` when there was nothing
    /// due, which is what a second overlapping run sees.
    pub async fn apply_downgrade(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedDowngrade>> {
        match self.store.get_pending_downgrade(user_id).await? {
            Some(pending) if pending.is_due(now) => {}
            _ => return Ok(None),
        }

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;
        let outcome: BillingResult<Option<PendingDowngrade>> = async {
            let pending = match self.store.get_pending_downgrade(user_id).await? {
                Some(pending) if pending.is_due(now) => pending,
                _ => return Ok(None),
            };
            if pending.target_tier == SubscriptionTier::Free {
                if let Some(subscription_id) = &snapshot.subscription_id {
                    self.provider.cancel_subscription(subscription_id).await?;
                }
            }
            Ok(Some(pending))
        }
        .await;

        let pending = match outcome {
            Ok(Some(pending)) => pending,
            Ok(None) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Ok(None);
            }
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Err(e);
            }
        };

        if !snapshot.tier.is_downgrade(pending.target_tier) {
            tracing::warn!(
                user_id = %user_id,
                current_tier = %snapshot.tier,
                target_tier = %pending.target_tier,
                "Pending downgrade does not lower the tier; applying retention anyway"
            );
        }

        let target = pending.target_tier;
        let DowngradeOutcome {
            subscription,
            pruned,
        } = self
            .store
            .complete_downgrade(
                user_id,
                snapshot.version,
                target,
                RetentionPolicy::for_tier(target),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            from_tier = %snapshot.tier,
            to_tier = %subscription.tier,
            pruned_friendships = pruned.friendships,
            pruned_categories = pruned.categories,
            pruned_items = pruned.items,
            "Applied scheduled downgrade"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::DowngradeApplied)
                    .data(serde_json::json!({ "pruned": pruned }))
                    .transition(snapshot.tier, target)
                    .stripe_subscription_opt(snapshot.subscription_id.as_deref())
                    .actor_type(ActorType::System),
            )
            .await;

        Ok(Some(AppliedDowngrade {
            from_tier: snapshot.tier,
            to_tier: target,
            pruned,
        }))
    }

    pub async fn get_subscription_status(
        &self,
        user_id: UserId,
    ) -> BillingResult<SubscriptionStatusView> {
        let subscription = self.load(user_id).await?;
        let pending_downgrade = self.store.get_pending_downgrade(user_id).await?;

        let external = match &subscription.subscription_id {
            Some(id) => {
                let found = self.provider.retrieve_subscription(id).await?;
                if found.is_none() {
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %id,
                        "Recorded subscription not found at provider"
                    );
                }
                found
            }
            None => None,
        };

        Ok(SubscriptionStatusView {
            tier: subscription.tier,
            billing_status: external.as_ref().map(|s| s.status),
            has_active_billing: subscription.has_active_billing(),
            next_billing_date: external.as_ref().and_then(|s| s.next_billing_date()),
            pending_downgrade,
        })
    }

    /// Account deletion: cancel recurring billing, then drop billing records
    pub async fn close_account(&self, user_id: UserId) -> BillingResult<()> {
        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;

        if let Some(subscription_id) = &snapshot.subscription_id {
            if let Err(e) = self.provider.cancel_subscription(subscription_id).await {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Err(e);
            }
        }

        self.store.delete_account(user_id).await?;

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::AccountClosed)
                    .data(serde_json::json!({ "tier": snapshot.tier }))
                    .stripe_subscription_opt(snapshot.subscription_id.as_deref())
                    .actor_type(ActorType::User),
            )
            .await;

        tracing::info!(user_id = %user_id, tier = %snapshot.tier, "Closed account billing");
        Ok(())
    }
}

/// Idempotency key for the prorated upgrade charge. Built only from state a
/// failed attempt leaves unchanged, so a retry of the same upgrade in the same
/// billing period reuses the provider's charge.
fn upgrade_charge_key(
    user_id: UserId,
    existing: &ExternalSubscription,
    target: SubscriptionTier,
) -> String {
    format!(
        "upgrade-{}-{}-{}-{}",
        user_id,
        existing.id,
        target,
        existing.current_period_end.unix_timestamp()
    )
}
