//! Billing Invariants Module
//!
//! Read-only consistency checks over the subscription tables. The worker runs
//! them after each sweep; any violation is logged for an operator. Checks
//! never write.

use std::collections::HashSet;

use larder_shared::UserId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::CLAIM_TIMEOUT;

/// Rank of a tier column, matching `SubscriptionTier::rank`
const TIER_RANK_SQL: &str = "CASE {col} WHEN 'owner' THEN 1 WHEN 'premium' THEN 2 WHEN 'basic' THEN 3 ELSE 4 END";

fn tier_rank(column: &str) -> String {
    TIER_RANK_SQL.replace("{col}", column)
}

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub user_ids: Vec<UserId>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Someone is being billed wrongly, or not at all
    Critical,
    /// Local state contradicts itself
    High,
    /// Stuck work that should resolve on its own
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TierHandleRow {
    user_id: UserId,
    tier: String,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleRewardsRow {
    user_id: UserId,
    reward_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PendingMismatchRow {
    user_id: UserId,
    tier: String,
    target_tier: String,
    effective_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleClaimRow {
    user_id: UserId,
    transition_claimed_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OverdueDowngradeRow {
    user_id: UserId,
    target_tier: String,
    effective_at: OffsetDateTime,
}

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_paid_tier_has_subscription().await?);
        violations.extend(self.check_free_tier_has_no_subscription().await?);
        violations.extend(self.check_single_active_reward().await?);
        violations.extend(self.check_pending_is_downgrade().await?);
        violations.extend(self.check_no_stale_claims(now).await?);
        violations.extend(self.check_no_overdue_downgrades(now).await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// Invariant 1: Basic and Premium users have a recurring subscription
    async fn check_paid_tier_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierHandleRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, stripe_customer_id, stripe_subscription_id
            FROM user_subscriptions
            WHERE tier IN ('basic', 'premium')
              AND stripe_subscription_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_tier_has_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User on tier '{}' has no recurring subscription and is not being billed",
                    row.tier
                ),
                context: serde_json::json!({
                    "tier": row.tier,
                    "stripe_customer_id": row.stripe_customer_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Free users are not billed
    async fn check_free_tier_has_no_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierHandleRow> = sqlx::query_as(
            r#"
            SELECT user_id, tier, stripe_customer_id, stripe_subscription_id
            FROM user_subscriptions
            WHERE tier = 'free'
              AND stripe_subscription_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_tier_has_no_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Free user still holds subscription '{}'",
                    row.stripe_subscription_id.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "stripe_customer_id": row.stripe_customer_id,
                    "stripe_subscription_id": row.stripe_subscription_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: At most one active referral reward per user
    async fn check_single_active_reward(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleRewardsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS reward_count
            FROM referral_rewards
            WHERE active
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_reward".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} active referral rewards (expected at most 1)",
                    row.reward_count
                ),
                context: serde_json::json!({ "reward_count": row.reward_count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: A pending downgrade lowers the user's current tier
    async fn check_pending_is_downgrade(&self) -> BillingResult<Vec<InvariantViolation>> {
        let query = format!(
            r#"
            SELECT s.user_id, s.tier, p.target_tier, p.effective_at
            FROM pending_downgrades p
            JOIN user_subscriptions s ON s.user_id = p.user_id
            WHERE {} <= {}
            "#,
            tier_rank("p.target_tier"),
            tier_rank("s.tier"),
        );
        let rows: Vec<PendingMismatchRow> = sqlx::query_as(&query).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "pending_is_downgrade".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Pending change from '{}' to '{}' is not a downgrade",
                    row.tier, row.target_tier
                ),
                context: serde_json::json!({
                    "tier": row.tier,
                    "target_tier": row.target_tier,
                    "effective_at": row.effective_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: No transition claim outlives the abandonment window
    async fn check_no_stale_claims(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleClaimRow> = sqlx::query_as(
            r#"
            SELECT user_id, transition_claimed_at
            FROM user_subscriptions
            WHERE transition_claimed_at IS NOT NULL
              AND transition_claimed_at < $1
            "#,
        )
        .bind(now - CLAIM_TIMEOUT)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_claims".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transition claimed at {} was never committed or released",
                    row.transition_claimed_at
                ),
                context: serde_json::json!({
                    "claimed_at": row.transition_claimed_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: The sweep keeps up; nothing stays due for more than a day
    async fn check_no_overdue_downgrades(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverdueDowngradeRow> = sqlx::query_as(
            r#"
            SELECT user_id, target_tier, effective_at
            FROM pending_downgrades
            WHERE effective_at < $1
            "#,
        )
        .bind(now - time::Duration::days(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_overdue_downgrades".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Downgrade to '{}' was due at {} and has not been applied",
                    row.target_tier, row.effective_at
                ),
                context: serde_json::json!({
                    "target_tier": row.target_tier,
                    "effective_at": row.effective_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let now = OffsetDateTime::now_utc();
        match name {
            "paid_tier_has_subscription" => self.check_paid_tier_has_subscription().await,
            "free_tier_has_no_subscription" => self.check_free_tier_has_no_subscription().await,
            "single_active_reward" => self.check_single_active_reward().await,
            "pending_is_downgrade" => self.check_pending_is_downgrade().await,
            "no_stale_claims" => self.check_no_stale_claims(now).await,
            "no_overdue_downgrades" => self.check_no_overdue_downgrades(now).await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_tier_has_subscription",
            "free_tier_has_no_subscription",
            "single_active_reward",
            "pending_is_downgrade",
            "no_stale_claims",
            "no_overdue_downgrades",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_tier_rank_sql_names_column() {
        let sql = tier_rank("p.target_tier");
        assert!(sql.starts_with("CASE p.target_tier WHEN 'owner' THEN 1"));
        assert!(sql.ends_with("ELSE 4 END"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let violation = |invariant: &str| InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![UserId::new()],
            description: String::new(),
            context: serde_json::json!({}),
            severity: ViolationSeverity::High,
        };
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("single_active_reward"),
                violation("single_active_reward"),
                violation("no_stale_claims"),
            ],
        );
        assert_eq!(summary.checks_run, 6);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 6);
    }
}
