//! In-memory [`SubscriptionStore`] for unit tests

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use larder_shared::{RetentionPolicy, SubscriptionTier, UserId};
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AnnualReset, AnnualResetMarker, BillingEventRecord, ContentCounts, DowngradeOutcome, EventOutcome,
    PendingChange, PendingDowngrade, PrunedContent, ReferralReward, SubscriptionStore, TierCommit,
    UserSubscription, CLAIM_TIMEOUT, EVENT_PROCESSING_TIMEOUT,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
struct ContentRow {
    id: Uuid,
    user_id: UserId,
    parent: Option<Uuid>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct EventRow {
    result: &'static str,
    started_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<UserId, UserSubscription>,
    pending: HashMap<UserId, PendingDowngrade>,
    rewards: Vec<ReferralReward>,
    markers: HashMap<UserId, AnnualResetMarker>,
    /// Completion time of each referral, by referrer
    referrals: HashMap<UserId, Vec<OffsetDateTime>>,
    events: HashMap<String, EventRow>,
    notified_invoices: HashSet<String>,
    billing_events: Vec<BillingEventRecord>,
    friendships: Vec<ContentRow>,
    categories: Vec<ContentRow>,
    items: Vec<ContentRow>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn missed_guard(&self, user_id: UserId, action: &str) -> BillingError {
        if self.subscriptions.contains_key(&user_id) {
            BillingError::ConcurrentModification(format!(
                "{} for user {} lost its claim",
                action, user_id
            ))
        } else {
            BillingError::NotFound(format!("subscription for user {}", user_id))
        }
    }

    fn claimed_row(&mut self, user_id: UserId, version: i64) -> Option<&mut UserSubscription> {
        self.subscriptions
            .get_mut(&user_id)
            .filter(|row| row.version == version && row.transition_claimed_at.is_some())
    }

    fn deactivate_rewards(&mut self, user_id: UserId) {
        for reward in self.rewards.iter_mut().filter(|r| r.user_id == user_id) {
            reward.active = false;
        }
    }

    /// Keep the newest `keep` rows per group; returns the ids removed
    fn prune(rows: &mut Vec<ContentRow>, user_id: UserId, keep: u32, by_parent: bool) -> Vec<Uuid> {
        let mut owned: Vec<ContentRow> = rows
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.seq.cmp(&a.seq));

        let mut kept_per_group: HashMap<Option<Uuid>, u32> = HashMap::new();
        let mut removed = Vec::new();
        for row in owned {
            let group = if by_parent { row.parent } else { None };
            let kept = kept_per_group.entry(group).or_insert(0);
            if *kept < keep {
                *kept += 1;
            } else {
                removed.push(row.id);
            }
        }
        rows.retain(|r| !removed.contains(&r.id));
        removed
    }
}

/// Shared-nothing store backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a user's row directly
    pub async fn seed(
        &self,
        user_id: UserId,
        tier: SubscriptionTier,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) {
        let mut state = self.state.lock().await;
        state.subscriptions.insert(
            user_id,
            UserSubscription {
                user_id,
                tier,
                customer_id: customer_id.map(str::to_string),
                subscription_id: subscription_id.map(str::to_string),
                version: 0,
                transition_claimed_at: None,
                created_at: OffsetDateTime::now_utc(),
            },
        );
    }

    pub async fn add_friendships(&self, user_id: UserId, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            let seq = state.next_seq();
            state.friendships.push(ContentRow {
                id: Uuid::new_v4(),
                user_id,
                parent: None,
                seq,
            });
        }
    }

    /// Adds a category holding `items` items; returns the category id
    pub async fn add_category(&self, user_id: UserId, items: usize) -> Uuid {
        let mut state = self.state.lock().await;
        let category_id = Uuid::new_v4();
        let seq = state.next_seq();
        state.categories.push(ContentRow {
            id: category_id,
            user_id,
            parent: None,
            seq,
        });
        for _ in 0..items {
            let seq = state.next_seq();
            state.items.push(ContentRow {
                id: Uuid::new_v4(),
                user_id,
                parent: Some(category_id),
                seq,
            });
        }
        category_id
    }

    pub async fn category_ids(&self, user_id: UserId) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .categories
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.id)
            .collect()
    }

    /// Replace the user's referrals with `count` completed just now
    pub async fn set_completed_referrals(&self, user_id: UserId, count: usize) {
        let now = OffsetDateTime::now_utc();
        self.state
            .lock()
            .await
            .referrals
            .insert(user_id, vec![now; count]);
    }

    pub async fn add_completed_referrals(&self, user_id: UserId, count: usize, at: OffsetDateTime) {
        self.state
            .lock()
            .await
            .referrals
            .entry(user_id)
            .or_default()
            .extend(std::iter::repeat(at).take(count));
    }

    pub async fn set_reset_marker(&self, marker: AnnualResetMarker) {
        self.state
            .lock()
            .await
            .markers
            .insert(marker.user_id, marker);
    }

    pub async fn insert_pending(&self, pending: PendingDowngrade) {
        self.state
            .lock()
            .await
            .pending
            .insert(pending.user_id, pending);
    }

    pub async fn rewards_for(&self, user_id: UserId) -> Vec<ReferralReward> {
        let state = self.state.lock().await;
        state
            .rewards
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn billing_events(&self) -> Vec<BillingEventRecord> {
        self.state.lock().await.billing_events.clone()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get_subscription(&self, user_id: UserId) -> BillingResult<Option<UserSubscription>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn create_subscription(&self, user_id: UserId) -> BillingResult<UserSubscription> {
        let mut state = self.state.lock().await;
        let row = state
            .subscriptions
            .entry(user_id)
            .or_insert_with(|| UserSubscription {
                user_id,
                tier: SubscriptionTier::Free,
                customer_id: None,
                subscription_id: None,
                version: 0,
                transition_claimed_at: None,
                created_at: OffsetDateTime::now_utc(),
            })
            .clone();
        state
            .markers
            .entry(user_id)
            .or_insert_with(|| AnnualResetMarker {
                user_id,
                anchor_date: row.created_at.date(),
                reset_year: row.created_at.year(),
                window_start: row.created_at,
            });
        Ok(row)
    }

    async fn delete_account(&self, user_id: UserId) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.subscriptions.remove(&user_id);
        state.pending.remove(&user_id);
        state.markers.remove(&user_id);
        state.rewards.retain(|r| r.user_id != user_id);
        Ok(())
    }

    async fn claim_transition(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<UserSubscription> {
        let mut state = self.state.lock().await;
        let row = state
            .subscriptions
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("subscription for user {}", user_id)))?;

        match row.transition_claimed_at {
            Some(claimed_at) if claimed_at >= now - CLAIM_TIMEOUT => {
                Err(BillingError::ConcurrentModification(format!(
                    "user {} has a transition in progress",
                    user_id
                )))
            }
            _ => {
                row.version += 1;
                row.transition_claimed_at = Some(now);
                Ok(row.clone())
            }
        }
    }

    async fn release_transition(&self, user_id: UserId, version: i64) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.subscriptions.get_mut(&user_id) {
            if row.version == version {
                row.transition_claimed_at = None;
            }
        }
        Ok(())
    }

    async fn commit_transition(&self, commit: TierCommit) -> BillingResult<UserSubscription> {
        let mut state = self.state.lock().await;
        if state.claimed_row(commit.user_id, commit.version).is_none() {
            return Err(state.missed_guard(commit.user_id, "commit"));
        }
        if let Some(reset) = &commit.reward_reset {
            let current = state.markers.get(&commit.user_id).map(|m| m.reset_year);
            if current != Some(reset.expected_reset_year) {
                return Err(BillingError::ConcurrentModification(format!(
                    "reset marker for user {} moved",
                    commit.user_id
                )));
            }
        }
        let Some(row) = state.claimed_row(commit.user_id, commit.version) else {
            return Err(state.missed_guard(commit.user_id, "commit"));
        };
        row.tier = commit.tier;
        row.customer_id = commit.customer_id.clone();
        row.subscription_id = commit.subscription_id.clone();
        row.version += 1;
        row.transition_claimed_at = None;
        let updated = row.clone();

        match commit.pending {
            PendingChange::Keep => {}
            PendingChange::Replace {
                target_tier,
                effective_at,
            } => {
                state.pending.insert(
                    commit.user_id,
                    PendingDowngrade {
                        user_id: commit.user_id,
                        target_tier,
                        effective_at,
                        created_at: OffsetDateTime::now_utc(),
                    },
                );
            }
            PendingChange::Clear => {
                state.pending.remove(&commit.user_id);
            }
        }

        if let Some(AnnualReset {
            reset_year,
            anchor_date,
            window_start,
            ..
        }) = commit.reward_reset
        {
            if let Some(marker) = state.markers.get_mut(&commit.user_id) {
                marker.reset_year = reset_year;
                marker.anchor_date = anchor_date;
                marker.window_start = window_start;
            }
            state.deactivate_rewards(commit.user_id);
        }

        if let Some(reward) = commit.reward {
            state.deactivate_rewards(commit.user_id);
            state.rewards.push(ReferralReward {
                active: true,
                ..reward
            });
        }

        Ok(updated)
    }

    async fn complete_downgrade(
        &self,
        user_id: UserId,
        version: i64,
        target: SubscriptionTier,
        retention: RetentionPolicy,
    ) -> BillingResult<DowngradeOutcome> {
        let mut state = self.state.lock().await;
        let Some(row) = state.claimed_row(user_id, version) else {
            return Err(state.missed_guard(user_id, "downgrade"));
        };
        row.tier = target;
        if target == SubscriptionTier::Free {
            row.subscription_id = None;
        }
        row.version += 1;
        row.transition_claimed_at = None;
        let updated = row.clone();

        let mut pruned = PrunedContent::default();
        if let Some(keep) = retention.max_friendships {
            pruned.friendships = State::prune(&mut state.friendships, user_id, keep, false).len() as u64;
        }
        if let Some(keep) = retention.max_categories {
            let removed = State::prune(&mut state.categories, user_id, keep, false);
            pruned.categories = removed.len() as u64;
            state
                .items
                .retain(|item| !item.parent.is_some_and(|p| removed.contains(&p)));
        }
        if let Some(keep) = retention.max_items_per_category {
            pruned.items = State::prune(&mut state.items, user_id, keep, true).len() as u64;
        }
        state.pending.remove(&user_id);

        Ok(DowngradeOutcome {
            subscription: updated,
            pruned,
        })
    }

    async fn get_pending_downgrade(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<PendingDowngrade>> {
        Ok(self.state.lock().await.pending.get(&user_id).cloned())
    }

    async fn list_due_downgrades(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PendingDowngrade>> {
        let state = self.state.lock().await;
        let mut due: Vec<PendingDowngrade> = state
            .pending
            .values()
            .filter(|p| p.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.effective_at);
        Ok(due)
    }

    async fn count_successful_referrals(
        &self,
        user_id: UserId,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let state = self.state.lock().await;
        let count = state
            .referrals
            .get(&user_id)
            .map(|completed| completed.iter().filter(|at| **at >= since).count())
            .unwrap_or(0);
        Ok(count as i64)
    }

    async fn get_active_reward(&self, user_id: UserId) -> BillingResult<Option<ReferralReward>> {
        let state = self.state.lock().await;
        Ok(state
            .rewards
            .iter()
            .find(|r| r.user_id == user_id && r.active)
            .cloned())
    }

    async fn get_reset_marker(&self, user_id: UserId) -> BillingResult<Option<AnnualResetMarker>> {
        Ok(self.state.lock().await.markers.get(&user_id).cloned())
    }

    async fn ensure_reset_marker(&self, user_id: UserId) -> BillingResult<AnnualResetMarker> {
        let mut state = self.state.lock().await;
        let signed_up = state
            .subscriptions
            .get(&user_id)
            .map(|s| s.created_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        Ok(state
            .markers
            .entry(user_id)
            .or_insert_with(|| AnnualResetMarker {
                user_id,
                anchor_date: signed_up.date(),
                reset_year: signed_up.year(),
                window_start: signed_up,
            })
            .clone())
    }

    async fn list_due_annual_resets(&self, today: Date) -> BillingResult<Vec<UserId>> {
        let state = self.state.lock().await;
        Ok(state
            .markers
            .values()
            .filter(|m| {
                m.reset_year < today.year()
                    && crate::rewards::anchor_in_year(m.anchor_date, today.year()) <= today
            })
            .map(|m| m.user_id)
            .collect())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let reclaimable = match state.events.get(event_id) {
            None => true,
            Some(row) => {
                row.result == "error"
                    || (row.result == "processing"
                        && row.started_at < now - EVENT_PROCESSING_TIMEOUT)
            }
        };
        if reclaimable {
            state.events.insert(
                event_id.to_string(),
                EventRow {
                    result: "processing",
                    started_at: now,
                },
            );
        }
        Ok(reclaimable)
    }

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.events.get_mut(event_id) {
            row.result = match outcome {
                EventOutcome::Success => "success",
                EventOutcome::Error(_) => "error",
            };
        }
        Ok(())
    }

    async fn record_invoice_notified(&self, invoice_id: &str) -> BillingResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .notified_invoices
            .insert(invoice_id.to_string()))
    }

    async fn append_billing_event(&self, event: BillingEventRecord) -> BillingResult<()> {
        self.state.lock().await.billing_events.push(event);
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.customer_id.as_deref() == Some(customer_id))
            .map(|s| s.user_id))
    }

    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.subscription_id.as_deref() == Some(subscription_id))
            .map(|s| s.user_id))
    }

    async fn content_counts(&self, user_id: UserId) -> BillingResult<ContentCounts> {
        let state = self.state.lock().await;
        let mut per_category: HashMap<Option<Uuid>, i64> = HashMap::new();
        for item in state.items.iter().filter(|i| i.user_id == user_id) {
            *per_category.entry(item.parent).or_insert(0) += 1;
        }
        Ok(ContentCounts {
            friendships: state
                .friendships
                .iter()
                .filter(|f| f.user_id == user_id)
                .count() as i64,
            categories: state
                .categories
                .iter()
                .filter(|c| c.user_id == user_id)
                .count() as i64,
            items: per_category.values().sum(),
            max_items_in_category: per_category.values().copied().max().unwrap_or(0),
        })
    }
}
