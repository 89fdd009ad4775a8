//! Postgres implementation of [`SubscriptionStore`]

use async_trait::async_trait;
use larder_shared::{RetentionPolicy, SubscriptionTier, UserId};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};

use super::{
    AnnualResetMarker, BillingEventRecord, ContentCounts, DowngradeOutcome, EventOutcome,
    PendingChange, PendingDowngrade, PrunedContent, ReferralReward, SubscriptionStore, TierCommit,
    UserSubscription, CLAIM_TIMEOUT, EVENT_PROCESSING_TIMEOUT,
};
use crate::error::{BillingError, BillingResult};

#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a guarded update matched nothing
    async fn missed_guard(&self, user_id: UserId, action: &str) -> BillingError {
        let exists: Result<Option<(i64,)>, sqlx::Error> =
            sqlx::query_as("SELECT version FROM user_subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await;
        match exists {
            Ok(None) => BillingError::NotFound(format!("subscription for user {}", user_id)),
            Ok(Some(_)) => BillingError::ConcurrentModification(format!(
                "{} for user {} lost its claim",
                action, user_id
            )),
            Err(e) => e.into(),
        }
    }
}

async fn prune_content(
    tx: &mut Transaction<'_, Postgres>,
    user_id: UserId,
    retention: &RetentionPolicy,
) -> BillingResult<PrunedContent> {
    let mut pruned = PrunedContent::default();

    if let Some(keep) = retention.max_friendships {
        pruned.friendships = sqlx::query(
            r#"
            DELETE FROM friendships
            WHERE user_id = $1
              AND id NOT IN (
                  SELECT id FROM friendships
                  WHERE user_id = $1
                  ORDER BY created_at DESC, id DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(user_id)
        .bind(i64::from(keep))
        .execute(&mut **tx)
        .await?
        .rows_affected();
    }

    // Items of removed categories go with them (ON DELETE CASCADE)
    if let Some(keep) = retention.max_categories {
        pruned.categories = sqlx::query(
            r#"
            DELETE FROM interest_categories
            WHERE user_id = $1
              AND id NOT IN (
                  SELECT id FROM interest_categories
                  WHERE user_id = $1
                  ORDER BY created_at DESC, id DESC
                  LIMIT $2
              )
            "#,
        )
        .bind(user_id)
        .bind(i64::from(keep))
        .execute(&mut **tx)
        .await?
        .rows_affected();
    }

    if let Some(keep) = retention.max_items_per_category {
        pruned.items = sqlx::query(
            r#"
            DELETE FROM items
            WHERE id IN (
                SELECT id FROM (
                    SELECT id,
                           ROW_NUMBER() OVER (
                               PARTITION BY category_id
                               ORDER BY created_at DESC, id DESC
                           ) AS position
                    FROM items
                    WHERE user_id = $1
                ) ranked
                WHERE ranked.position > $2
            )
            "#,
        )
        .bind(user_id)
        .bind(i64::from(keep))
        .execute(&mut **tx)
        .await?
        .rows_affected();
    }

    Ok(pruned)
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get_subscription(&self, user_id: UserId) -> BillingResult<Option<UserSubscription>> {
        let row = sqlx::query_as::<_, UserSubscription>(
            r#"
            SELECT user_id, tier, stripe_customer_id, stripe_subscription_id,
                   version, transition_claimed_at, created_at
            FROM user_subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_subscription(&self, user_id: UserId) -> BillingResult<UserSubscription> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO user_subscriptions (user_id, tier)
            VALUES ($1, 'free')
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO referral_reset_markers (user_id, anchor_date, reset_year, window_started_at)
            SELECT $1, (signed_up AT TIME ZONE 'UTC')::date,
                   EXTRACT(YEAR FROM signed_up AT TIME ZONE 'UTC')::int, signed_up
            FROM (SELECT COALESCE((SELECT created_at FROM users WHERE id = $1), NOW()) AS signed_up) s
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, UserSubscription>(
            r#"
            SELECT user_id, tier, stripe_customer_id, stripe_subscription_id,
                   version, transition_claimed_at, created_at
            FROM user_subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn delete_account(&self, user_id: UserId) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM pending_downgrades WHERE user_id = $1",
            "DELETE FROM referral_rewards WHERE user_id = $1",
            "DELETE FROM referral_reset_markers WHERE user_id = $1",
            "DELETE FROM user_subscriptions WHERE user_id = $1",
        ] {
            sqlx::query(statement).bind(user_id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::info!(user_id = %user_id, "Deleted billing records for closed account");
        Ok(())
    }

    async fn claim_transition(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<UserSubscription> {
        // UPDATE ... RETURNING: only one caller can hold the claim
        let claimed = sqlx::query_as::<_, UserSubscription>(
            r#"
            UPDATE user_subscriptions
            SET version = version + 1,
                transition_claimed_at = $2,
                updated_at = NOW()
            WHERE user_id = $1
              AND (transition_claimed_at IS NULL OR transition_claimed_at < $3)
            RETURNING user_id, tier, stripe_customer_id, stripe_subscription_id,
                      version, transition_claimed_at, created_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now - CLAIM_TIMEOUT)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(row) => Ok(row),
            None => match self.missed_guard(user_id, "claim").await {
                BillingError::ConcurrentModification(_) => Err(BillingError::ConcurrentModification(
                    format!("user {} has a transition in progress", user_id),
                )),
                other => Err(other),
            },
        }
    }

    async fn release_transition(&self, user_id: UserId, version: i64) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE user_subscriptions
            SET transition_claimed_at = NULL, updated_at = NOW()
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(user_id)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_transition(&self, commit: TierCommit) -> BillingResult<UserSubscription> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, UserSubscription>(
            r#"
            UPDATE user_subscriptions
            SET tier = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                version = version + 1,
                transition_claimed_at = NULL,
                updated_at = NOW()
            WHERE user_id = $1
              AND version = $5
              AND transition_claimed_at IS NOT NULL
            RETURNING user_id, tier, stripe_customer_id, stripe_subscription_id,
                      version, transition_claimed_at, created_at
            "#,
        )
        .bind(commit.user_id)
        .bind(commit.tier)
        .bind(&commit.customer_id)
        .bind(&commit.subscription_id)
        .bind(commit.version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            return Err(self.missed_guard(commit.user_id, "commit").await);
        };

        match &commit.pending {
            PendingChange::Keep => {}
            PendingChange::Replace {
                target_tier,
                effective_at,
            } => {
                sqlx::query(
                    r#"
                    INSERT INTO pending_downgrades (user_id, target_tier, effective_at, created_at)
                    VALUES ($1, $2, $3, NOW())
                    ON CONFLICT (user_id) DO UPDATE SET
                        target_tier = EXCLUDED.target_tier,
                        effective_at = EXCLUDED.effective_at,
                        created_at = EXCLUDED.created_at
                    "#,
                )
                .bind(commit.user_id)
                .bind(*target_tier)
                .bind(*effective_at)
                .execute(&mut *tx)
                .await?;
            }
            PendingChange::Clear => {
                sqlx::query("DELETE FROM pending_downgrades WHERE user_id = $1")
                    .bind(commit.user_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        if let Some(reset) = &commit.reward_reset {
            let moved = sqlx::query(
                r#"
                UPDATE referral_reset_markers
                SET reset_year = $3, anchor_date = $4, window_started_at = $5, updated_at = NOW()
                WHERE user_id = $1 AND reset_year = $2
                "#,
            )
            .bind(commit.user_id)
            .bind(reset.expected_reset_year)
            .bind(reset.reset_year)
            .bind(reset.anchor_date)
            .bind(reset.window_start)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if moved == 0 {
                tx.rollback().await?;
                return Err(BillingError::ConcurrentModification(format!(
                    "reset marker for user {} moved",
                    commit.user_id
                )));
            }

            sqlx::query("UPDATE referral_rewards SET active = FALSE WHERE user_id = $1 AND active")
                .bind(commit.user_id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(reward) = &commit.reward {
            sqlx::query(
                "UPDATE referral_rewards SET active = FALSE WHERE user_id = $1 AND active",
            )
            .bind(commit.user_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO referral_rewards
                    (id, user_id, threshold, reward_kind, magnitude, expires_at, active, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, TRUE, $7)
                "#,
            )
            .bind(reward.id)
            .bind(commit.user_id)
            .bind(reward.threshold)
            .bind(reward.kind)
            .bind(reward.magnitude)
            .bind(reward.expires_at)
            .bind(reward.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn complete_downgrade(
        &self,
        user_id: UserId,
        version: i64,
        target: SubscriptionTier,
        retention: RetentionPolicy,
    ) -> BillingResult<DowngradeOutcome> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query_as::<_, UserSubscription>(
            r#"
            UPDATE user_subscriptions
            SET tier = $2,
                stripe_subscription_id = CASE WHEN $3 THEN NULL ELSE stripe_subscription_id END,
                version = version + 1,
                transition_claimed_at = NULL,
                updated_at = NOW()
            WHERE user_id = $1
              AND version = $4
              AND transition_claimed_at IS NOT NULL
            RETURNING user_id, tier, stripe_customer_id, stripe_subscription_id,
                      version, transition_claimed_at, created_at
            "#,
        )
        .bind(user_id)
        .bind(target)
        .bind(target == SubscriptionTier::Free)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            tx.rollback().await?;
            return Err(self.missed_guard(user_id, "downgrade").await);
        };

        let pruned = prune_content(&mut tx, user_id, &retention).await?;

        sqlx::query("DELETE FROM pending_downgrades WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(DowngradeOutcome {
            subscription: updated,
            pruned,
        })
    }

    async fn get_pending_downgrade(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<PendingDowngrade>> {
        let row = sqlx::query_as::<_, PendingDowngrade>(
            r#"
            SELECT user_id, target_tier, effective_at, created_at
            FROM pending_downgrades
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_due_downgrades(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PendingDowngrade>> {
        let rows = sqlx::query_as::<_, PendingDowngrade>(
            r#"
            SELECT user_id, target_tier, effective_at, created_at
            FROM pending_downgrades
            WHERE effective_at <= $1
            ORDER BY effective_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_successful_referrals(
        &self,
        user_id: UserId,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM referrals
            WHERE referrer_id = $1 AND status = 'completed' AND completed_at >= $2
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_active_reward(&self, user_id: UserId) -> BillingResult<Option<ReferralReward>> {
        let row = sqlx::query_as::<_, ReferralReward>(
            r#"
            SELECT id, user_id, threshold, reward_kind, magnitude, expires_at, active, created_at
            FROM referral_rewards
            WHERE user_id = $1 AND active
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_reset_marker(&self, user_id: UserId) -> BillingResult<Option<AnnualResetMarker>> {
        let row = sqlx::query_as::<_, AnnualResetMarker>(
            r#"
            SELECT user_id, anchor_date, reset_year, window_started_at
            FROM referral_reset_markers
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn ensure_reset_marker(&self, user_id: UserId) -> BillingResult<AnnualResetMarker> {
        let row = sqlx::query_as::<_, AnnualResetMarker>(
            r#"
            WITH inserted AS (
                INSERT INTO referral_reset_markers (user_id, anchor_date, reset_year, window_started_at)
                SELECT $1, (signed_up AT TIME ZONE 'UTC')::date,
                       EXTRACT(YEAR FROM signed_up AT TIME ZONE 'UTC')::int, signed_up
                FROM (SELECT COALESCE((SELECT created_at FROM users WHERE id = $1), NOW()) AS signed_up) s
                ON CONFLICT (user_id) DO NOTHING
                RETURNING user_id, anchor_date, reset_year, window_started_at
            )
            SELECT user_id, anchor_date, reset_year, window_started_at FROM inserted
            UNION ALL
            SELECT user_id, anchor_date, reset_year, window_started_at
            FROM referral_reset_markers WHERE user_id = $1
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_due_annual_resets(&self, today: Date) -> BillingResult<Vec<UserId>> {
        let rows: Vec<(UserId,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM referral_reset_markers
            WHERE reset_year < $2
              AND (anchor_date
                   + make_interval(years => $2 - EXTRACT(YEAR FROM anchor_date)::int))::date <= $1
            "#,
        )
        .bind(today)
        .bind(today.year())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        // Errored events and abandoned claims can be picked up again on redelivery
        let claimed: Option<(uuid::Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', $3)
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $3,
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < $4)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(now)
        .bind(now - EVENT_PROCESSING_TIMEOUT)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn finish_event(&self, event_id: &str, outcome: EventOutcome) -> BillingResult<()> {
        let (result, message) = match outcome {
            EventOutcome::Success => ("success", None),
            EventOutcome::Error(message) => ("error", Some(message)),
        };
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $2, error_message = $3
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_invoice_notified(&self, invoice_id: &str) -> BillingResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO notified_invoices (stripe_invoice_id) VALUES ($1) ON CONFLICT (stripe_invoice_id) DO NOTHING",
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    async fn append_billing_event(&self, event: BillingEventRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, event_type, event_data, stripe_event_id,
                 stripe_subscription_id, actor_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(event.user_id)
        .bind(&event.event_type)
        .bind(&event.event_data)
        .bind(&event.stripe_event_id)
        .bind(&event.stripe_subscription_id)
        .bind(&event.actor_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<UserId>> {
        let row: Option<(UserId,)> =
            sqlx::query_as("SELECT user_id FROM user_subscriptions WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn find_user_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<UserId>> {
        let row: Option<(UserId,)> = sqlx::query_as(
            "SELECT user_id FROM user_subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn content_counts(&self, user_id: UserId) -> BillingResult<ContentCounts> {
        let (friendships, categories, items, max_items_in_category): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM friendships WHERE user_id = $1),
                    (SELECT COUNT(*) FROM interest_categories WHERE user_id = $1),
                    (SELECT COUNT(*) FROM items WHERE user_id = $1),
                    COALESCE((
                        SELECT MAX(per_category) FROM (
                            SELECT COUNT(*) AS per_category
                            FROM items
                            WHERE user_id = $1
                            GROUP BY category_id
                        ) counts
                    ), 0)
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(ContentCounts {
            friendships,
            categories,
            items,
            max_items_in_category,
        })
    }
}
