//! Referral rewards
//!
//! A user holds at most one active reward: the one for the highest referral
//! threshold reached. Granting a reward changes the user's next invoice at the
//! provider (one-time coupon or a deferred billing date), so the provider call
//! happens under the user's transition claim and the ledger row is committed
//! only once the provider accepted it.

use std::sync::Arc;

use larder_shared::UserId;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::PaymentProvider;
use crate::store::{
    claim_with_retry, release_quietly, AnnualReset, AnnualResetMarker, ReferralReward, RewardKind,
    SubscriptionStore, TierCommit,
};

/// One row of the reward table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTier {
    /// Completed referrals needed
    pub threshold: u32,
    pub kind: RewardKind,
    /// Months for `FreePeriod`, percent for `PercentageDiscount`
    pub magnitude: u32,
}

/// Reward tiers ordered by descending threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardTable {
    tiers: Vec<RewardTier>,
}

impl Default for RewardTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                RewardTier {
                    threshold: 10,
                    kind: RewardKind::FreePeriod,
                    magnitude: 2,
                },
                RewardTier {
                    threshold: 5,
                    kind: RewardKind::FreePeriod,
                    magnitude: 1,
                },
                RewardTier {
                    threshold: 3,
                    kind: RewardKind::PercentageDiscount,
                    magnitude: 50,
                },
                RewardTier {
                    threshold: 1,
                    kind: RewardKind::PercentageDiscount,
                    magnitude: 20,
                },
            ],
        }
    }
}

impl RewardTable {
    pub fn new(mut tiers: Vec<RewardTier>) -> BillingResult<Self> {
        for tier in &tiers {
            if tier.threshold == 0 || tier.magnitude == 0 {
                return Err(BillingError::Config(format!(
                    "reward tier {:?} needs a positive threshold and magnitude",
                    tier
                )));
            }
            if tier.kind == RewardKind::PercentageDiscount && tier.magnitude > 100 {
                return Err(BillingError::Config(format!(
                    "reward discount of {}% exceeds 100%",
                    tier.magnitude
                )));
            }
        }
        tiers.sort_by(|a, b| b.threshold.cmp(&a.threshold));
        if tiers.windows(2).any(|w| w[0].threshold == w[1].threshold) {
            return Err(BillingError::Config(
                "reward table has duplicate thresholds".to_string(),
            ));
        }
        Ok(Self { tiers })
    }

    /// `REFERRAL_REWARD_TABLE` as a JSON array of tiers, or the default table
    pub fn from_env() -> BillingResult<Self> {
        match std::env::var("REFERRAL_REWARD_TABLE") {
            Ok(raw) if !raw.trim().is_empty() => {
                let tiers: Vec<RewardTier> = serde_json::from_str(&raw).map_err(|e| {
                    BillingError::Config(format!("REFERRAL_REWARD_TABLE is not valid: {}", e))
                })?;
                Self::new(tiers)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Highest tier whose threshold `referral_count` meets
    pub fn best_for(&self, referral_count: i64) -> Option<RewardTier> {
        self.tiers
            .iter()
            .find(|tier| i64::from(tier.threshold) <= referral_count)
            .copied()
    }

    pub fn tiers(&self) -> &[RewardTier] {
        &self.tiers
    }
}

/// The anchor's month and day in `year`; Feb 29 falls back to Feb 28
pub fn anchor_in_year(anchor: Date, year: i32) -> Date {
    Date::from_calendar_date(year, anchor.month(), anchor.day())
        .or_else(|_| Date::from_calendar_date(year, Month::February, 28))
        .unwrap_or(anchor)
}

pub fn is_reset_due(marker: &AnnualResetMarker, today: Date) -> bool {
    marker.reset_year < today.year() && anchor_in_year(marker.anchor_date, today.year()) <= today
}

/// Date on which the referral program next resets for this user
pub fn next_reset_date(marker: &AnnualResetMarker, today: Date) -> Date {
    let this_year = anchor_in_year(marker.anchor_date, today.year());
    if marker.reset_year >= today.year() || this_year <= today {
        anchor_in_year(marker.anchor_date, today.year() + 1)
    } else {
        this_year
    }
}

/// Result of a reward evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardOutcome {
    /// No threshold reached
    NotEligible,
    /// The active reward already covers the highest threshold reached
    Unchanged(ReferralReward),
    Granted(ReferralReward),
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralStats {
    /// Completed referrals in the current program year
    pub referral_count: i64,
    pub active_reward: Option<ReferralReward>,
    pub next_reset_date: Date,
}

/// Referral reward bookkeeping
#[derive(Clone)]
pub struct RewardLedger {
    store: Arc<dyn SubscriptionStore>,
    provider: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn Notifier>,
    event_logger: BillingEventLogger,
    table: RewardTable,
}

impl RewardLedger {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
        table: RewardTable,
    ) -> Self {
        Self {
            event_logger: BillingEventLogger::new(store.clone()),
            store,
            provider,
            notifier,
            table,
        }
    }

    pub fn table(&self) -> &RewardTable {
        &self.table
    }

    /// Grant the reward for the highest threshold the user has reached in the
    /// current program year.
    ///
    /// Fails with `RewardTargetMissing` when a reward is due but the user has no
    /// subscription to apply it to; the ledger is left untouched in that case,
    /// as it is when the provider call fails.
    pub async fn evaluate_and_apply_rewards(&self, user_id: UserId) -> BillingResult<RewardOutcome> {
        let marker = self.store.ensure_reset_marker(user_id).await?;
        let referral_count = self
            .store
            .count_successful_referrals(user_id, marker.window_start)
            .await?;
        let Some(best) = self.table.best_for(referral_count) else {
            return Ok(RewardOutcome::NotEligible);
        };

        if let Some(active) = self.current_reward_covering(user_id, best).await? {
            return Ok(RewardOutcome::Unchanged(active));
        }

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;

        // Ok(Err(outcome)): a reset or another grant landed while we waited for the claim
        let result: BillingResult<Result<(i64, String, ReferralReward), RewardOutcome>> = async {
            let marker = self.store.ensure_reset_marker(user_id).await?;
            let referral_count = self
                .store
                .count_successful_referrals(user_id, marker.window_start)
                .await?;
            let Some(best) = self.table.best_for(referral_count) else {
                return Ok(Err(RewardOutcome::NotEligible));
            };
            if let Some(active) = self.current_reward_covering(user_id, best).await? {
                return Ok(Err(RewardOutcome::Unchanged(active)));
            }

            let subscription_id = snapshot
                .subscription_id
                .clone()
                .ok_or_else(|| BillingError::RewardTargetMissing(user_id.to_string()))?;

            match best.kind {
                RewardKind::PercentageDiscount => {
                    self.provider
                        .apply_one_time_discount(&subscription_id, best.magnitude)
                        .await?;
                }
                RewardKind::FreePeriod => {
                    self.provider
                        .defer_next_billing(&subscription_id, best.magnitude)
                        .await?;
                }
            }

            let now = OffsetDateTime::now_utc();
            let expires_at = next_reset_date(&marker, now.date()).midnight().assume_utc();

            Ok(Ok((
                referral_count,
                subscription_id,
                ReferralReward {
                    id: Uuid::new_v4(),
                    user_id,
                    threshold: best.threshold as i32,
                    kind: best.kind,
                    magnitude: best.magnitude as i32,
                    expires_at,
                    active: true,
                    created_at: now,
                },
            )))
        }
        .await;

        let (referral_count, subscription_id, reward) = match result {
            Ok(Ok(granted)) => granted,
            Ok(Err(outcome)) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Ok(outcome);
            }
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                tracing::warn!(
                    user_id = %user_id,
                    threshold = best.threshold,
                    error = %e,
                    "Referral reward not applied"
                );
                return Err(e);
            }
        };

        let commit = TierCommit {
            reward: Some(reward.clone()),
            ..TierCommit::unchanged(&snapshot)
        };
        if let Err(e) = self.store.commit_transition(commit).await {
            self.notifier
                .send_operator_alert(
                    "Referral reward applied at provider but not recorded",
                    &format!(
                        "user {} subscription {}: {:?} x{} applied, ledger write failed: {}",
                        user_id, subscription_id, reward.kind, reward.magnitude, e
                    ),
                )
                .await;
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            referral_count = referral_count,
            threshold = reward.threshold,
            kind = ?reward.kind,
            magnitude = reward.magnitude,
            "Granted referral reward"
        );

        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::RewardGranted)
                    .data(serde_json::json!({
                        "referral_count": referral_count,
                        "threshold": reward.threshold,
                        "kind": reward.kind,
                        "magnitude": reward.magnitude,
                    }))
                    .stripe_subscription(subscription_id)
                    .actor_type(ActorType::System),
            )
            .await;

        Ok(RewardOutcome::Granted(reward))
    }

    /// Clear the active reward once a year on the account anniversary and
    /// start a new program year. Returns whether a reset ran; safe to call
    /// repeatedly.
    pub async fn evaluate_annual_reset(&self, user_id: UserId, today: Date) -> BillingResult<bool> {
        let marker = self.store.ensure_reset_marker(user_id).await?;
        if !is_reset_due(&marker, today) {
            return Ok(false);
        }

        let snapshot = claim_with_retry(self.store.as_ref(), user_id).await?;

        let marker = match self.store.ensure_reset_marker(user_id).await {
            Ok(marker) if is_reset_due(&marker, today) => marker,
            Ok(_) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Ok(false);
            }
            Err(e) => {
                release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
                return Err(e);
            }
        };

        let new_anchor = anchor_in_year(marker.anchor_date, today.year() + 1);
        let commit = TierCommit {
            reward_reset: Some(AnnualReset {
                expected_reset_year: marker.reset_year,
                reset_year: today.year(),
                anchor_date: new_anchor,
                window_start: OffsetDateTime::now_utc(),
            }),
            ..TierCommit::unchanged(&snapshot)
        };
        if let Err(e) = self.store.commit_transition(commit).await {
            release_quietly(self.store.as_ref(), user_id, snapshot.version).await;
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            year = today.year(),
            next_anchor = %new_anchor,
            "Referral program reset for the year"
        );
        self.event_logger
            .log_best_effort(
                BillingEventBuilder::new(user_id, BillingEventType::RewardReset)
                    .data(serde_json::json!({
                        "year": today.year(),
                        "next_anchor": new_anchor.to_string(),
                    }))
                    .actor_type(ActorType::System),
            )
            .await;

        Ok(true)
    }

    pub async fn referral_stats(&self, user_id: UserId, today: Date) -> BillingResult<ReferralStats> {
        if let Err(e) = self.evaluate_annual_reset(user_id, today).await {
            if !e.is_retryable() {
                return Err(e);
            }
            // The sweep retries it; report the current year as it stands
            tracing::warn!(user_id = %user_id, error = %e, "Annual reset deferred");
        }

        let marker = self.store.ensure_reset_marker(user_id).await?;
        let referral_count = self
            .store
            .count_successful_referrals(user_id, marker.window_start)
            .await?;
        let active_reward = self.store.get_active_reward(user_id).await?;

        Ok(ReferralStats {
            referral_count,
            active_reward,
            next_reset_date: next_reset_date(&marker, today),
        })
    }

    async fn current_reward_covering(
        &self,
        user_id: UserId,
        best: RewardTier,
    ) -> BillingResult<Option<ReferralReward>> {
        Ok(self
            .store
            .get_active_reward(user_id)
            .await?
            .filter(|active| i64::from(active.threshold) >= i64::from(best.threshold)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_default_table_is_descending() {
        let table = RewardTable::default();
        let thresholds: Vec<u32> = table.tiers().iter().map(|t| t.threshold).collect();
        assert_eq!(thresholds, vec![10, 5, 3, 1]);
    }

    #[test]
    fn test_best_for_picks_highest_met_threshold() {
        let table = RewardTable::default();
        assert_eq!(table.best_for(0), None);
        assert_eq!(table.best_for(1).map(|t| t.threshold), Some(1));
        assert_eq!(table.best_for(4).map(|t| t.threshold), Some(3));
        let five = table.best_for(7).unwrap();
        assert_eq!(five.threshold, 5);
        assert_eq!(five.kind, RewardKind::FreePeriod);
        assert_eq!(table.best_for(250).map(|t| t.threshold), Some(10));
    }

    #[test]
    fn test_table_rejects_invalid_tiers() {
        let dup = RewardTable::new(vec![
            RewardTier {
                threshold: 2,
                kind: RewardKind::FreePeriod,
                magnitude: 1,
            },
            RewardTier {
                threshold: 2,
                kind: RewardKind::PercentageDiscount,
                magnitude: 10,
            },
        ]);
        assert!(matches!(dup, Err(BillingError::Config(_))));

        let too_generous = RewardTable::new(vec![RewardTier {
            threshold: 1,
            kind: RewardKind::PercentageDiscount,
            magnitude: 150,
        }]);
        assert!(too_generous.is_err());
    }

    #[test]
    fn test_table_parses_from_json() {
        let tiers: Vec<RewardTier> = serde_json::from_str(
            r#"[{"threshold":2,"kind":"percentage_discount","magnitude":15},
                {"threshold":8,"kind":"free_period","magnitude":3}]"#,
        )
        .unwrap();
        let table = RewardTable::new(tiers).unwrap();
        assert_eq!(table.tiers()[0].threshold, 8);
    }

    #[test]
    fn test_anchor_in_year_handles_leap_day() {
        assert_eq!(anchor_in_year(date!(2024 - 02 - 29), 2025), date!(2025 - 02 - 28));
        assert_eq!(anchor_in_year(date!(2024 - 02 - 29), 2028), date!(2028 - 02 - 29));
        assert_eq!(anchor_in_year(date!(2023 - 07 - 04), 2026), date!(2026 - 07 - 04));
    }

    #[test]
    fn test_reset_due_only_after_anchor_and_once_per_year() {
        let marker = AnnualResetMarker {
            user_id: UserId::new(),
            anchor_date: date!(2025 - 03 - 10),
            reset_year: 2025,
            window_start: date!(2025 - 03 - 10).midnight().assume_utc(),
        };
        assert!(!is_reset_due(&marker, date!(2026 - 03 - 09)));
        assert!(is_reset_due(&marker, date!(2026 - 03 - 10)));
        assert!(is_reset_due(&marker, date!(2026 - 12 - 31)));

        let applied = AnnualResetMarker {
            reset_year: 2026,
            anchor_date: date!(2027 - 03 - 10),
            ..marker
        };
        assert!(!is_reset_due(&applied, date!(2026 - 12 - 31)));
    }

    #[test]
    fn test_next_reset_date() {
        let marker = AnnualResetMarker {
            user_id: UserId::new(),
            anchor_date: date!(2025 - 03 - 10),
            reset_year: 2025,
            window_start: date!(2025 - 03 - 10).midnight().assume_utc(),
        };
        assert_eq!(next_reset_date(&marker, date!(2026 - 01 - 15)), date!(2026 - 03 - 10));
        let applied = AnnualResetMarker {
            reset_year: 2026,
            anchor_date: date!(2027 - 03 - 10),
            ..marker
        };
        assert_eq!(next_reset_date(&applied, date!(2026 - 10 - 16)), date!(2027 - 03 - 10));
    }
}
