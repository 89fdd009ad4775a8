//! Test doubles for the provider and notifier seams

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use larder_shared::{SubscriptionTier, UserId};
use time::{Duration, OffsetDateTime};

use crate::client::test_config;
use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    add_months, ExternalSubscription, ExternalSubscriptionStatus, NewSubscription, OneOffCharge,
    PaymentProvider, ScheduledChange,
};
use crate::reconciliation::ReconciliationProcessor;
use crate::rewards::{RewardLedger, RewardTable};
use crate::store::memory::MemoryStore;
use crate::subscriptions::SubscriptionService;
use crate::webhooks::WebhookVerifier;

#[derive(Default)]
struct ProviderState {
    next_id: u64,
    customers: Vec<String>,
    attached: Vec<(String, String)>,
    subscriptions: HashMap<String, ExternalSubscription>,
    charges: Vec<OneOffCharge>,
    charge_ids: HashMap<String, String>,
    discounts: Vec<(String, u32)>,
    deferrals: Vec<(String, u32)>,
    calls: Vec<&'static str>,
    failing: HashSet<&'static str>,
}

impl ProviderState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }
}

/// Payment provider that keeps subscriptions in memory and records every call.
/// Operations named in [`MockProvider::fail_on`] fail with a retryable error.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<ProviderState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: &'static str) -> BillingResult<MutexGuard<'_, ProviderState>> {
        let mut state = self.lock();
        state.calls.push(op);
        if state.failing.contains(op) {
            return Err(BillingError::provider(format!("{} unavailable", op)));
        }
        Ok(state)
    }

    pub fn fail_on(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.lock().failing.remove(op);
    }

    /// An active subscription whose period started `elapsed_days` ago and
    /// runs `total_days` in all
    pub fn insert_subscription(
        &self,
        id: &str,
        customer_id: &str,
        price_id: &str,
        elapsed_days: i64,
        total_days: i64,
    ) -> ExternalSubscription {
        // A minute of slack keeps the remaining whole days exact while the test runs
        let start = OffsetDateTime::now_utc() - Duration::days(elapsed_days) + Duration::minutes(1);
        let sub = ExternalSubscription {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: ExternalSubscriptionStatus::Active,
            price_id: Some(price_id.to_string()),
            current_period_start: start,
            current_period_end: start + Duration::days(total_days),
            cancel_at_period_end: false,
            cancel_at: None,
            trial_end: None,
        };
        self.lock().subscriptions.insert(id.to_string(), sub.clone());
        sub
    }

    pub fn remove_subscription(&self, id: &str) {
        self.lock().subscriptions.remove(id);
    }

    pub fn subscription(&self, id: &str) -> Option<ExternalSubscription> {
        self.lock().subscriptions.get(id).cloned()
    }

    pub fn charges(&self) -> Vec<OneOffCharge> {
        self.lock().charges.clone()
    }

    pub fn discounts(&self) -> Vec<(String, u32)> {
        self.lock().discounts.clone()
    }

    pub fn deferrals(&self) -> Vec<(String, u32)> {
        self.lock().deferrals.clone()
    }

    pub fn customers(&self) -> Vec<String> {
        self.lock().customers.clone()
    }

    pub fn attached(&self) -> Vec<(String, String)> {
        self.lock().attached.clone()
    }

    /// Number of calls made to `op`, including failed ones
    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_customer(&self, _user_id: UserId, _email: Option<&str>) -> BillingResult<String> {
        let mut state = self.enter("create_customer")?;
        let id = state.next("cus");
        state.customers.push(id.clone());
        Ok(id)
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let mut state = self.enter("attach_payment_method")?;
        if payment_method_id.starts_with("pm_declined") {
            return Err(BillingError::provider_rejected("card declined"));
        }
        state
            .attached
            .push((customer_id.to_string(), payment_method_id.to_string()));
        Ok(())
    }

    async fn charge_once(&self, charge: OneOffCharge) -> BillingResult<String> {
        let mut state = self.enter("charge_once")?;
        if charge.amount_cents <= 0 {
            return Err(BillingError::InvalidInput("charge must be positive".to_string()));
        }
        if let Some(existing) = state.charge_ids.get(&charge.idempotency_key) {
            return Ok(existing.clone());
        }
        let id = state.next("in");
        state
            .charge_ids
            .insert(charge.idempotency_key.clone(), id.clone());
        state.charges.push(charge);
        Ok(id)
    }

    async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> BillingResult<ExternalSubscription> {
        let mut state = self.enter("create_subscription")?;
        let id = state.next("sub");
        let now = OffsetDateTime::now_utc();
        let (status, period_end) = match request.trial_end {
            Some(trial_end) => (ExternalSubscriptionStatus::Trialing, trial_end),
            None => (ExternalSubscriptionStatus::Active, add_months(now, 1)),
        };
        let sub = ExternalSubscription {
            id: id.clone(),
            customer_id: request.customer_id,
            status,
            price_id: Some(request.price_id),
            current_period_start: now,
            current_period_end: period_end,
            cancel_at_period_end: false,
            cancel_at: None,
            trial_end: request.trial_end,
        };
        state.subscriptions.insert(id, sub.clone());
        Ok(sub)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let mut state = self.enter("cancel_subscription")?;
        if let Some(sub) = state.subscriptions.get_mut(subscription_id) {
            sub.status = ExternalSubscriptionStatus::Canceled;
        }
        Ok(())
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ExternalSubscription>> {
        let state = self.enter("retrieve_subscription")?;
        Ok(state.subscriptions.get(subscription_id).cloned())
    }

    async fn schedule_change(
        &self,
        subscription_id: &str,
        change: ScheduledChange,
    ) -> BillingResult<ExternalSubscription> {
        let mut state = self.enter("schedule_change")?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ExternalStateDrift(subscription_id.to_string()))?;
        match change {
            ScheduledChange::Cancel => sub.cancel_at_period_end = true,
            ScheduledChange::SwitchPrice(price_id) => {
                sub.price_id = Some(price_id);
                sub.cancel_at_period_end = false;
            }
        }
        Ok(sub.clone())
    }

    async fn clear_scheduled_change(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription> {
        let mut state = self.enter("clear_scheduled_change")?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ExternalStateDrift(subscription_id.to_string()))?;
        sub.cancel_at_period_end = false;
        sub.price_id = Some(price_id.to_string());
        Ok(sub.clone())
    }

    async fn apply_one_time_discount(
        &self,
        subscription_id: &str,
        percent_off: u32,
    ) -> BillingResult<()> {
        let mut state = self.enter("apply_one_time_discount")?;
        state
            .discounts
            .push((subscription_id.to_string(), percent_off));
        Ok(())
    }

    async fn defer_next_billing(
        &self,
        subscription_id: &str,
        months: u32,
    ) -> BillingResult<ExternalSubscription> {
        let mut state = self.enter("defer_next_billing")?;
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::ExternalStateDrift(subscription_id.to_string()))?;
        let from = sub.next_billing_date().unwrap_or(sub.current_period_end);
        sub.trial_end = Some(add_months(from, months));
        sub.status = ExternalSubscriptionStatus::Trialing;
        let deferred = sub.clone();
        state.deferrals.push((subscription_id.to_string(), months));
        Ok(deferred)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    BillingConfirmation {
        user_id: UserId,
        amount_cents: i64,
        next_billing_date: Option<OffsetDateTime>,
    },
    DowngradeConfirmation {
        user_id: UserId,
        from: SubscriptionTier,
        to: SubscriptionTier,
        effective_at: OffsetDateTime,
    },
    OperatorAlert {
        subject: String,
        detail: String,
    },
}

/// Notifier that only records what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification);
    }

    pub fn all(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn confirmations(&self) -> Vec<Notification> {
        self.all()
            .into_iter()
            .filter(|n| matches!(n, Notification::BillingConfirmation { .. }))
            .collect()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::OperatorAlert { subject, .. } => Some(subject),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_billing_confirmation(
        &self,
        user_id: UserId,
        amount_cents: i64,
        _charged_at: OffsetDateTime,
        next_billing_date: Option<OffsetDateTime>,
    ) {
        self.push(Notification::BillingConfirmation {
            user_id,
            amount_cents,
            next_billing_date,
        });
    }

    async fn send_downgrade_confirmation(
        &self,
        user_id: UserId,
        from: SubscriptionTier,
        to: SubscriptionTier,
        effective_at: OffsetDateTime,
    ) {
        self.push(Notification::DowngradeConfirmation {
            user_id,
            from,
            to,
            effective_at,
        });
    }

    async fn send_operator_alert(&self, subject: &str, detail: &str) {
        self.push(Notification::OperatorAlert {
            subject: subject.to_string(),
            detail: detail.to_string(),
        });
    }
}

/// Every component wired to in-memory doubles
pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub subscriptions: SubscriptionService,
    pub rewards: RewardLedger,
    pub reconciliation: ReconciliationProcessor,
    pub verifier: WebhookVerifier,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let config = test_config();
        let verifier = WebhookVerifier::new(config.webhook_secret.clone());

        let subscriptions = SubscriptionService::new(
            store.clone(),
            provider.clone(),
            notifier.clone(),
            config,
        );
        let rewards = RewardLedger::new(
            store.clone(),
            provider.clone(),
            notifier.clone(),
            RewardTable::default(),
        );
        let reconciliation = ReconciliationProcessor::new(
            store.clone(),
            provider.clone(),
            notifier.clone(),
            subscriptions.clone(),
            rewards.clone(),
            verifier.clone(),
        );

        Self {
            store,
            provider,
            notifier,
            subscriptions,
            rewards,
            reconciliation,
            verifier,
        }
    }

    /// A user on `tier` billed through an active subscription halfway
    /// through a 30-day period
    pub async fn paid_user(&self, tier: SubscriptionTier) -> UserId {
        let user_id = UserId::new();
        let price = match tier {
            SubscriptionTier::Premium => "price_premium",
            _ => "price_basic",
        };
        let sub_id = format!("sub_{}", user_id.0.simple());
        let customer_id = format!("cus_{}", user_id.0.simple());
        self.provider
            .insert_subscription(&sub_id, &customer_id, price, 15, 30);
        self.store
            .seed(user_id, tier, Some(&customer_id), Some(&sub_id))
            .await;
        user_id
    }

    pub async fn free_user(&self) -> UserId {
        let user_id = UserId::new();
        self.subscriptions
            .register_user(user_id)
            .await
            .expect("register user");
        user_id
    }
}
