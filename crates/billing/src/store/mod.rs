//! Durable subscription state
//!
//! The per-user `user_subscriptions` row is the unit of mutual exclusion.
//! A transition first *claims* the row (bumping its version), performs any
//! provider calls with no database lock held, then *commits* with a
//! version-guarded write that also carries the pending downgrade and reward
//! changes belonging to the same transition.

use async_trait::async_trait;
use larder_shared::{RetentionPolicy, SubscriptionTier, UserId};
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[cfg(test)]
pub(crate) mod memory;
mod postgres;

pub use postgres::PgSubscriptionStore;

/// A claim older than this is treated as abandoned by a crashed worker
pub const CLAIM_TIMEOUT: Duration = Duration::minutes(10);

/// Webhook events stuck in `processing` longer than this may be re-claimed
pub const EVENT_PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

const CLAIM_ATTEMPTS: usize = 3;
const CLAIM_RETRY_BASE_MS: u64 = 50;
const CLAIM_RETRY_MAX_DELAY: std::time::Duration = std::time::Duration::from_millis(500);

/// A user's tier and provider handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSubscription {
    pub user_id: UserId,
    pub tier: SubscriptionTier,
    #[sqlx(rename = "stripe_customer_id")]
    pub customer_id: Option<String>,
    #[sqlx(rename = "stripe_subscription_id")]
    pub subscription_id: Option<String>,
    pub version: i64,
    pub transition_claimed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl UserSubscription {
    /// Whether a recurring subscription is currently billing this user
    pub fn has_active_billing(&self) -> bool {
        self.subscription_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingDowngrade {
    pub user_id: UserId,
    pub target_tier: SubscriptionTier,
    pub effective_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

impl PendingDowngrade {
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.effective_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    /// Next billing date pushed out by `magnitude` months
    FreePeriod,
    /// `magnitude` percent off the next invoice only
    PercentageDiscount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralReward {
    pub id: Uuid,
    pub user_id: UserId,
    pub threshold: i32,
    #[sqlx(rename = "reward_kind")]
    pub kind: RewardKind,
    pub magnitude: i32,
    pub expires_at: OffsetDateTime,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

/// Anniversary anchor for the yearly referral program reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnnualResetMarker {
    pub user_id: UserId,
    pub anchor_date: Date,
    /// Calendar year in which the reset last ran
    pub reset_year: i32,
    /// Start of the current program year; only referrals completed since
    /// then count towards rewards
    #[sqlx(rename = "window_started_at")]
    pub window_start: OffsetDateTime,
}

/// Marker move committed by a yearly reset. The active reward is deactivated
/// in the same write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnualReset {
    /// `reset_year` the marker must still carry
    pub expected_reset_year: i32,
    pub reset_year: i32,
    pub anchor_date: Date,
    pub window_start: OffsetDateTime,
}

/// What a committed transition does to the user's pending downgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    Keep,
    /// Insert, or replace the existing one (last request wins)
    Replace {
        target_tier: SubscriptionTier,
        effective_at: OffsetDateTime,
    },
    Clear,
}

/// Version-guarded write of a claimed subscription row
#[derive(Debug, Clone)]
pub struct TierCommit {
    pub user_id: UserId,
    /// Version returned by `claim_transition`
    pub version: i64,
    pub tier: SubscriptionTier,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub pending: PendingChange,
    /// Becomes the only active reward; any previous one is deactivated
    pub reward: Option<ReferralReward>,
    pub reward_reset: Option<AnnualReset>,
}

impl TierCommit {
    /// A commit that leaves the claimed row's state untouched
    pub fn unchanged(snapshot: &UserSubscription) -> Self {
        Self {
            user_id: snapshot.user_id,
            version: snapshot.version,
            tier: snapshot.tier,
            customer_id: snapshot.customer_id.clone(),
            subscription_id: snapshot.subscription_id.clone(),
            pending: PendingChange::Keep,
            reward: None,
            reward_reset: None,
        }
    }
}

/// Rows removed when a downgrade enforced its retention policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrunedContent {
    pub friendships: u64,
    pub categories: u64,
    pub items: u64,
}

#[derive(Debug, Clone)]
pub struct DowngradeOutcome {
    pub subscription: UserSubscription,
    pub pruned: PrunedContent,
}

/// Current amount of tier-gated content a user holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContentCounts {
    pub friendships: i64,
    pub categories: i64,
    pub items: i64,
    pub max_items_in_category: i64,
}

impl ContentCounts {
    pub fn within(&self, policy: &RetentionPolicy) -> bool {
        let fits = |count: i64, limit: Option<u32>| limit.map_or(true, |l| count <= i64::from(l));
        fits(self.friendships, policy.max_friendships)
            && fits(self.categories, policy.max_categories)
            && fits(self.max_items_in_category, policy.max_items_per_category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Success,
    Error(String),
}

/// Append-only audit row
#[derive(Debug, Clone, Serialize)]
pub struct BillingEventRecord {
    pub user_id: UserId,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_type: String,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, user_id: UserId) -> BillingResult<Option<UserSubscription>>;

    /// Signup: a Free row plus the referral reset anchor. Existing rows are returned unchanged.
    async fn create_subscription(&self, user_id: UserId) -> BillingResult<UserSubscription>;

    /// Remove every billing record of the user
    async fn delete_account(&self, user_id: UserId) -> BillingResult<()>;

    /// Take exclusive transition rights on the user's row.
    ///
    /// Fails with `NotFound` for unknown users and `ConcurrentModification`
    /// while another live claim is held.
    async fn claim_transition(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<UserSubscription>;

    /// Drop a claim without changing state
    async fn release_transition(&self, user_id: UserId, version: i64) -> BillingResult<()>;

    /// Write a claimed transition and drop the claim. A `reward_reset` fails
    /// with `ConcurrentModification` if the marker's year has already moved.
    async fn commit_transition(&self, commit: TierCommit) -> BillingResult<UserSubscription>;

    /// Apply a due downgrade in one transaction: tier, handle (cleared for
    /// Free), content pruning and removal of the pending downgrade.
    async fn complete_downgrade(
        &self,
        user_id: UserId,
        version: i64,
        target: SubscriptionTier,
        retention: RetentionPolicy,
    ) -> BillingResult<DowngradeOutcome>;

    async fn get_pending_downgrade(&self, user_id: UserId)
        -> BillingResult<Option<PendingDowngrade>>;

    async fn list_due_downgrades(&self, now: OffsetDateTime)
        -> BillingResult<Vec<PendingDowngrade>>;

    /// Completed referrals made by the user since `since`
    async fn count_successful_referrals(
        &self,
        user_id: UserId,
        since: OffsetDateTime,
    ) -> BillingResult<i64>;

    async fn get_active_reward(&self, user_id: UserId) -> BillingResult<Option<ReferralReward>>;

    async fn get_reset_marker(&self, user_id: UserId) -> BillingResult<Option<AnnualResetMarker>>;

    /// Marker anchored on the account creation date, created on first use
    async fn ensure_reset_marker(&self, user_id: UserId) -> BillingResult<AnnualResetMarker>;

    /// Users whose anniversary in `today`'s year has passed without a reset
    async fn list_due_annual_resets(&self, today: Date) -> BillingResult<Vec<UserId>>;

    /// Returns false when the event is done or being processed elsewhere
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> BillingResult<()>;

    /// Returns false when a confirmation for this invoice was already recorded
    async fn record_invoice_notified(&self, invoice_id: &str) -> BillingResult<bool>;

    async fn append_billing_event(&self, event: BillingEventRecord) -> BillingResult<()>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>>;

    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<UserId>>;

    async fn content_counts(&self, user_id: UserId) -> BillingResult<ContentCounts>;
}

/// Claim the user's row, backing off briefly while another transition holds it.
/// Gives up with `ConcurrentModification` after three attempts.
pub async fn claim_with_retry(
    store: &dyn SubscriptionStore,
    user_id: UserId,
) -> BillingResult<UserSubscription> {
    let strategy = ExponentialBackoff::from_millis(CLAIM_RETRY_BASE_MS)
        .max_delay(CLAIM_RETRY_MAX_DELAY)
        .take(CLAIM_ATTEMPTS - 1)
        .map(jitter);

    RetryIf::spawn(
        strategy,
        || store.claim_transition(user_id, OffsetDateTime::now_utc()),
        |e: &BillingError| {
            let busy = matches!(e, BillingError::ConcurrentModification(_));
            if busy {
                tracing::debug!(user_id = %user_id, "Subscription row busy, retrying claim");
            }
            busy
        },
    )
    .await
}

/// Drop a claim after a failed transition; failure only delays the next
/// claim until the abandonment window passes.
pub async fn release_quietly(store: &dyn SubscriptionStore, user_id: UserId, version: i64) {
    if let Err(e) = store.release_transition(user_id, version).await {
        tracing::warn!(user_id = %user_id, error = %e, "Failed to release transition claim");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_within_retention_policy() {
        let counts = ContentCounts {
            friendships: 0,
            categories: 3,
            items: 15,
            max_items_in_category: 5,
        };
        assert!(counts.within(&RetentionPolicy::for_tier(SubscriptionTier::Free)));

        let over = ContentCounts {
            friendships: 1,
            ..counts
        };
        assert!(!over.within(&RetentionPolicy::for_tier(SubscriptionTier::Free)));
        assert!(over.within(&RetentionPolicy::for_tier(SubscriptionTier::Basic)));
        assert!(over.within(&RetentionPolicy::UNLIMITED));
    }

    #[test]
    fn test_reward_kind_serializes_snake_case() {
        let json = serde_json::to_string(&RewardKind::PercentageDiscount).unwrap();
        assert_eq!(json, "\"percentage_discount\"");
    }
}
