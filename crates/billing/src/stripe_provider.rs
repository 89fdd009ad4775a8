//! Stripe-backed [`PaymentProvider`]
//!
//! Every request is bounded by `StripeConfig::request_timeout`; a timeout is a
//! retryable [`BillingError::ExternalProviderFailure`], never a success.
//! Only reads are retried here. Writes are attempted once and charges carry a
//! caller-supplied idempotency key so a caller-level retry cannot double charge.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use larder_shared::UserId;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    AttachPaymentMethod, CancelSubscription, CouponDuration, CreateCoupon, CreateCustomer,
    CreateInvoice, CreateInvoiceItem, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, CustomerInvoiceSettings, Invoice, InvoiceId, PaymentMethod, PaymentMethodId,
    RequestStrategy, Subscription, SubscriptionId, SubscriptionStatus as StripeSubStatus,
    UpdateCustomer, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    add_months, ExternalSubscription, ExternalSubscriptionStatus, NewSubscription, OneOffCharge,
    PaymentProvider, ScheduledChange,
};

const READ_RETRY_BASE_MS: u64 = 250;
const READ_RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

/// Payment provider talking to the Stripe API
#[derive(Clone)]
pub struct StripeProvider {
    stripe: StripeClient,
}

impl StripeProvider {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    /// Run one Stripe request under the configured timeout
    async fn call<T, F>(&self, operation: &'static str, request: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        let timeout = self.stripe.config().request_timeout;
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(operation = operation, error = %e, "Stripe request failed");
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_secs = timeout.as_secs(),
                    "Stripe request timed out"
                );
                Err(BillingError::provider(format!(
                    "{} timed out after {} seconds",
                    operation,
                    timeout.as_secs()
                )))
            }
        }
    }

    fn idempotent_client(&self, key: String) -> stripe::Client {
        self.stripe
            .inner()
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key))
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        let strategy = ExponentialBackoff::from_millis(READ_RETRY_BASE_MS)
            .max_delay(READ_RETRY_MAX_DELAY)
            .take(self.stripe.config().read_retries)
            .map(jitter);

        RetryIf::spawn(
            strategy,
            || async {
                let result = tokio::time::timeout(
                    self.stripe.config().request_timeout,
                    Subscription::retrieve(self.stripe.inner(), subscription_id, &[]),
                )
                .await;
                match result {
                    Ok(Ok(sub)) => Ok(Some(sub)),
                    Ok(Err(stripe::StripeError::Stripe(ref req))) if req.http_status == 404 => {
                        Ok(None)
                    }
                    Ok(Err(e)) => Err(BillingError::from(e)),
                    Err(_) => Err(BillingError::provider("retrieve_subscription timed out")),
                }
            },
            |e: &BillingError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Retrying Stripe subscription read"
                    );
                }
                retry
            },
        )
        .await
    }

    async fn require_subscription(
        &self,
        subscription_id: &SubscriptionId,
    ) -> BillingResult<Subscription> {
        self.fetch_subscription(subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::ExternalStateDrift(format!(
                    "subscription {} does not exist at Stripe",
                    subscription_id
                ))
            })
    }

    async fn update(
        &self,
        operation: &'static str,
        subscription_id: &SubscriptionId,
        params: UpdateSubscription<'_>,
    ) -> BillingResult<ExternalSubscription> {
        let updated = self
            .call(
                operation,
                Subscription::update(self.stripe.inner(), subscription_id, params),
            )
            .await?;
        map_subscription(updated)
    }
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse::<CustomerId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))
}

pub(crate) fn from_timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| BillingError::Internal(format!("Invalid Stripe timestamp {}: {}", ts, e)))
}

fn first_item_id(sub: &Subscription) -> BillingResult<String> {
    sub.items
        .data
        .first()
        .map(|item| item.id.to_string())
        .ok_or_else(|| {
            BillingError::ExternalStateDrift(format!("subscription {} has no items", sub.id))
        })
}

fn map_status(status: &StripeSubStatus) -> ExternalSubscriptionStatus {
    match status {
        StripeSubStatus::Active => ExternalSubscriptionStatus::Active,
        StripeSubStatus::Trialing => ExternalSubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => ExternalSubscriptionStatus::PastDue,
        StripeSubStatus::Unpaid => ExternalSubscriptionStatus::Unpaid,
        StripeSubStatus::Incomplete => ExternalSubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => ExternalSubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => ExternalSubscriptionStatus::Paused,
        StripeSubStatus::Canceled => ExternalSubscriptionStatus::Canceled,
    }
}

pub(crate) fn map_subscription(sub: Subscription) -> BillingResult<ExternalSubscription> {
    let customer_id = match &sub.customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(c) => c.id.to_string(),
    };
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    Ok(ExternalSubscription {
        id: sub.id.to_string(),
        customer_id,
        status: map_status(&sub.status),
        price_id,
        current_period_start: from_timestamp(sub.current_period_start)?,
        current_period_end: from_timestamp(sub.current_period_end)?,
        cancel_at_period_end: sub.cancel_at_period_end,
        cancel_at: sub.cancel_at.map(from_timestamp).transpose()?,
        trial_end: sub.trial_end.map(from_timestamp).transpose()?,
    })
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_customer(&self, user_id: UserId, email: Option<&str>) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("platform".to_string(), "larder".to_string());

        let params = CreateCustomer {
            email,
            metadata: Some(metadata),
            ..Default::default()
        };

        let client = self.idempotent_client(format!("customer-{}", user_id));
        let customer = self
            .call("create_customer", Customer::create(&client, params))
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created new Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        let customer = parse_customer_id(customer_id)?;
        let pm_id = payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment method ID: {}", e)))?;

        self.call(
            "attach_payment_method",
            PaymentMethod::attach(
                self.stripe.inner(),
                &pm_id,
                AttachPaymentMethod {
                    customer: customer.clone(),
                },
            ),
        )
        .await?;

        let mut params = UpdateCustomer::new();
        params.invoice_settings = Some(CustomerInvoiceSettings {
            default_payment_method: Some(payment_method_id.to_string()),
            ..Default::default()
        });
        self.call(
            "set_default_payment_method",
            Customer::update(self.stripe.inner(), &customer, params),
        )
        .await?;

        tracing::info!(
            customer_id = %customer_id,
            payment_method_id = %payment_method_id,
            "Attached default payment method"
        );

        Ok(())
    }

    async fn charge_once(&self, charge: OneOffCharge) -> BillingResult<String> {
        if charge.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "charge amount must be positive, got {}",
                charge.amount_cents
            )));
        }
        let customer_id = parse_customer_id(&charge.customer_id)?;

        // Stripe rejects one key reused across endpoints, so each step derives its own
        let item_client = self.idempotent_client(format!("{}-item", charge.idempotency_key));
        let mut item_params = CreateInvoiceItem::new(customer_id.clone());
        item_params.amount = Some(charge.amount_cents);
        item_params.currency = Some(stripe::Currency::USD);
        item_params.description = Some(&charge.description);
        self.call(
            "create_invoice_item",
            stripe::InvoiceItem::create(&item_client, item_params),
        )
        .await?;

        let invoice_client = self.idempotent_client(format!("{}-invoice", charge.idempotency_key));
        let mut invoice_params = CreateInvoice::new();
        invoice_params.customer = Some(customer_id);
        invoice_params.auto_advance = Some(false);
        invoice_params.collection_method = Some(stripe::CollectionMethod::ChargeAutomatically);
        invoice_params.description = Some(&charge.description);
        let invoice = self
            .call(
                "create_invoice",
                Invoice::create(&invoice_client, invoice_params),
            )
            .await?;

        let invoice_id = invoice
            .id
            .as_str()
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::Internal(format!("Invalid invoice ID: {}", e)))?;

        self.call(
            "finalize_invoice",
            Invoice::finalize(self.stripe.inner(), &invoice_id, Default::default()),
        )
        .await?;

        let paid = self
            .call("pay_invoice", Invoice::pay(self.stripe.inner(), &invoice_id))
            .await
            .map_err(|e| {
                tracing::error!(
                    invoice_id = %invoice_id,
                    amount_cents = charge.amount_cents,
                    error = %e,
                    "Immediate charge was not collected"
                );
                e
            })?;

        tracing::info!(
            invoice_id = %paid.id,
            amount_cents = charge.amount_cents,
            "Immediate charge collected via Stripe"
        );

        Ok(paid.id.to_string())
    }

    async fn create_subscription(
        &self,
        request: NewSubscription,
    ) -> BillingResult<ExternalSubscription> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), request.user_id.to_string());
        metadata.insert("price_id".to_string(), request.price_id.clone());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        if let Some(trial_end) = request.trial_end {
            params.trial_end = Some(stripe::Scheduled::Timestamp(trial_end.unix_timestamp()));
        }

        let subscription = self
            .call(
                "create_subscription",
                Subscription::create(self.stripe.inner(), params),
            )
            .await?;

        tracing::info!(
            user_id = %request.user_id,
            subscription_id = %subscription.id,
            price_id = %request.price_id,
            trial_end = ?request.trial_end,
            "Created Stripe subscription"
        );

        map_subscription(subscription)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let result = self
            .call(
                "cancel_subscription",
                Subscription::cancel(self.stripe.inner(), &sub_id, CancelSubscription::default()),
            )
            .await;

        match result {
            Ok(_) => {
                tracing::info!(subscription_id = %subscription_id, "Cancelled Stripe subscription");
                Ok(())
            }
            // Already gone: cancelling twice is a no-op
            Err(BillingError::ExternalProviderFailure {
                retryable: false, ..
            }) => match self.fetch_subscription(&sub_id).await? {
                None => Ok(()),
                Some(sub) if sub.status == StripeSubStatus::Canceled => Ok(()),
                Some(_) => Err(BillingError::provider_rejected(format!(
                    "Stripe refused to cancel subscription {}",
                    subscription_id
                ))),
            },
            Err(e) => Err(e),
        }
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<ExternalSubscription>> {
        let sub_id = parse_subscription_id(subscription_id)?;
        self.fetch_subscription(&sub_id)
            .await?
            .map(map_subscription)
            .transpose()
    }

    async fn schedule_change(
        &self,
        subscription_id: &str,
        change: ScheduledChange,
    ) -> BillingResult<ExternalSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        match change {
            ScheduledChange::Cancel => {
                let params = UpdateSubscription {
                    cancel_at_period_end: Some(true),
                    ..Default::default()
                };
                self.update("schedule_cancellation", &sub_id, params).await
            }
            ScheduledChange::SwitchPrice(price_id) => {
                // Without proration the new price first bills at the next renewal
                let current = self.require_subscription(&sub_id).await?;
                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        id: Some(first_item_id(&current)?),
                        price: Some(price_id),
                        ..Default::default()
                    }]),
                    proration_behavior: Some(SubscriptionProrationBehavior::None),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                };
                self.update("schedule_price_switch", &sub_id, params).await
            }
        }
    }

    async fn clear_scheduled_change(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<ExternalSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let current = self.require_subscription(&sub_id).await?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(first_item_id(&current)?),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            cancel_at_period_end: Some(false),
            ..Default::default()
        };
        self.update("clear_scheduled_change", &sub_id, params).await
    }

    async fn apply_one_time_discount(
        &self,
        subscription_id: &str,
        percent_off: u32,
    ) -> BillingResult<()> {
        if percent_off == 0 || percent_off > 100 {
            return Err(BillingError::InvalidInput(format!(
                "percent_off must be within 1..=100, got {}",
                percent_off
            )));
        }
        let sub_id = parse_subscription_id(subscription_id)?;

        let coupon_name = format!("Referral reward {}% off", percent_off);
        let mut params = CreateCoupon::new();
        params.percent_off = Some(f64::from(percent_off));
        params.duration = Some(CouponDuration::Once);
        params.max_redemptions = Some(1);
        params.name = Some(&coupon_name);

        let coupon = self
            .call("create_coupon", stripe::Coupon::create(self.stripe.inner(), params))
            .await?;

        let update = UpdateSubscription {
            coupon: Some(coupon.id.clone()),
            ..Default::default()
        };
        self.update("apply_coupon", &sub_id, update).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            coupon_id = %coupon.id,
            percent_off = percent_off,
            "Applied one-time referral discount"
        );

        Ok(())
    }

    async fn defer_next_billing(
        &self,
        subscription_id: &str,
        months: u32,
    ) -> BillingResult<ExternalSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let current = map_subscription(self.require_subscription(&sub_id).await?)?;

        let anchor = current
            .next_billing_date()
            .unwrap_or(current.current_period_end);
        let deferred_to = add_months(anchor, months);

        // A trial until the deferred date skips the intervening invoices
        let params = UpdateSubscription {
            trial_end: Some(stripe::Scheduled::Timestamp(deferred_to.unix_timestamp())),
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };
        let updated = self.update("defer_next_billing", &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            months = months,
            next_billing = %deferred_to,
            "Deferred next billing date"
        );

        Ok(updated)
    }
}
