//! Payment provider boundary
//!
//! The provider owns money movement and the recurring subscription objects.
//! Everything this crate needs from it goes through [`PaymentProvider`], so the
//! lifecycle code never touches provider SDK types directly.

use async_trait::async_trait;
use larder_shared::UserId;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::error::BillingResult;

/// Status of a recurring subscription at the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    Canceled,
}

impl ExternalSubscriptionStatus {
    /// Statuses in which the subscription still bills the customer
    pub fn is_billing(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

/// Provider-side view of a recurring subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: ExternalSubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
}

impl ExternalSubscription {
    /// When the subscription will stop if a cancellation is scheduled
    pub fn scheduled_cancellation(&self) -> Option<OffsetDateTime> {
        if self.cancel_at_period_end {
            Some(self.cancel_at.unwrap_or(self.current_period_end))
        } else {
            self.cancel_at
        }
    }

    /// Next date the customer will be invoiced, if any
    pub fn next_billing_date(&self) -> Option<OffsetDateTime> {
        if !self.status.is_billing() || self.scheduled_cancellation().is_some() {
            return None;
        }
        match self.trial_end {
            Some(trial_end) if self.status == ExternalSubscriptionStatus::Trialing => {
                Some(trial_end)
            }
            _ => Some(self.current_period_end),
        }
    }
}

/// Move an instant forward by whole calendar months, clamping the day to the
/// target month's length (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let zero_based = at.month() as i64 - 1 + i64::from(months);
    let year = at.year() as i64 + zero_based.div_euclid(12);
    let month = Month::January.nth_next(zero_based.rem_euclid(12) as u8);

    let Ok(year) = i32::try_from(year) else {
        return at;
    };
    let day = at.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day)
        .map(|date| at.replace_date(date))
        .unwrap_or(at)
}

/// Request to create a recurring subscription
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub customer_id: String,
    pub price_id: String,
    /// Billing starts at this instant instead of immediately
    pub trial_end: Option<OffsetDateTime>,
}

/// One-off charge against the customer's default payment method
#[derive(Debug, Clone)]
pub struct OneOffCharge {
    pub customer_id: String,
    pub amount_cents: i64,
    pub description: String,
    /// Replaying a charge with the same key must not charge twice
    pub idempotency_key: String,
}

/// Change applied by the provider when the current period ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledChange {
    /// Do not renew; the subscription ends at period end
    Cancel,
    /// Renew at a different price, without mid-cycle proration
    SwitchPrice(String),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a customer record and return its handle
    async fn create_customer(&self, user_id: UserId, email: Option<&str>) -> BillingResult<String>;

    /// Attach a payment method and make it the customer's default
    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()>;

    /// Charge immediately; returns the provider's charge/invoice handle
    async fn charge_once(&self, charge: OneOffCharge) -> BillingResult<String>;

    async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> BillingResult<ExternalSubscription>;

    /// Cancel immediately. Cancelling an already cancelled or unknown
    /// subscription succeeds.
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// `None` when the provider has no such subscription
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ExternalSubscription>>;

    async fn schedule_change(
        &self,
        subscription_id: &str,
        change: ScheduledChange,
    ) -> BillingResult<ExternalSubscription>;

    /// Undo any scheduled change, keeping the subscription at `price_id`
    async fn clear_scheduled_change(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription>;

    /// Percentage discount applied to the next invoice only
    async fn apply_one_time_discount(
        &self,
        subscription_id: &str,
        percent_off: u32,
    ) -> BillingResult<()>;

    /// Push the next billing date forward by whole months
    async fn defer_next_billing(
        &self,
        subscription_id: &str,
        months: u32,
    ) -> BillingResult<ExternalSubscription>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn subscription() -> ExternalSubscription {
        ExternalSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: ExternalSubscriptionStatus::Active,
            price_id: Some("price_basic".to_string()),
            current_period_start: datetime!(2026-10-01 0:00 UTC),
            current_period_end: datetime!(2026-11-01 0:00 UTC),
            cancel_at_period_end: false,
            cancel_at: None,
            trial_end: None,
        }
    }

    #[test]
    fn test_next_billing_date_is_period_end() {
        let sub = subscription();
        assert_eq!(sub.next_billing_date(), Some(datetime!(2026-11-01 0:00 UTC)));
    }

    #[test]
    fn test_cancelling_subscription_has_no_next_billing_date() {
        let sub = ExternalSubscription {
            cancel_at_period_end: true,
            ..subscription()
        };
        assert_eq!(
            sub.scheduled_cancellation(),
            Some(datetime!(2026-11-01 0:00 UTC))
        );
        assert!(sub.next_billing_date().is_none());
    }

    #[test]
    fn test_trialing_bills_at_trial_end() {
        let sub = ExternalSubscription {
            status: ExternalSubscriptionStatus::Trialing,
            trial_end: Some(datetime!(2026-10-20 0:00 UTC)),
            ..subscription()
        };
        assert_eq!(sub.next_billing_date(), Some(datetime!(2026-10-20 0:00 UTC)));
    }

    #[test]
    fn test_add_months_clamps_and_rolls_years() {
        assert_eq!(
            add_months(datetime!(2026-11-15 9:30 UTC), 2),
            datetime!(2027-01-15 9:30 UTC)
        );
        assert_eq!(
            add_months(datetime!(2027-01-31 0:00 UTC), 1),
            datetime!(2027-02-28 0:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2028-01-31 0:00 UTC), 1),
            datetime!(2028-02-29 0:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2026-10-01 0:00 UTC), 0),
            datetime!(2026-10-01 0:00 UTC)
        );
    }
}
