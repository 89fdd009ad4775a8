//! Stripe client configuration

use std::time::Duration;

use larder_shared::SubscriptionTier;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default timeout applied to every Stripe call
pub const DEFAULT_STRIPE_TIMEOUT_SECS: u64 = 20;

/// Default number of retries for read-only Stripe calls
pub const DEFAULT_STRIPE_READ_RETRIES: usize = 2;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each purchasable tier
    pub price_ids: PriceIds,
    /// List prices in cents, used for proration and confirmations
    pub plan_prices: PlanPrices,
    /// Upper bound on any single Stripe round trip
    pub request_timeout: Duration,
    /// Retries for idempotent reads (retrieve subscription)
    pub read_retries: usize,
}

/// Stripe price IDs for subscription tiers
/// Tier hierarchy: Free (no price) → Basic → Premium. Owner is never billed.
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub basic: String,
    pub premium: String,
}

/// Monthly list prices in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPrices {
    pub basic_cents: i64,
    pub premium_cents: i64,
}

impl Default for PlanPrices {
    fn default() -> Self {
        Self {
            basic_cents: 999,
            premium_cents: 1999,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} is not a valid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let defaults = PlanPrices::default();
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                basic: std::env::var("STRIPE_PRICE_BASIC")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_BASIC not set".to_string()))?,
                premium: std::env::var("STRIPE_PRICE_PREMIUM").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PREMIUM not set".to_string())
                })?,
            },
            plan_prices: PlanPrices {
                basic_cents: env_parse("BASIC_PRICE_CENTS", defaults.basic_cents)?,
                premium_cents: env_parse("PREMIUM_PRICE_CENTS", defaults.premium_cents)?,
            },
            request_timeout: Duration::from_secs(env_parse(
                "STRIPE_TIMEOUT_SECS",
                DEFAULT_STRIPE_TIMEOUT_SECS,
            )?),
            read_retries: env_parse("STRIPE_READ_RETRIES", DEFAULT_STRIPE_READ_RETRIES)?,
        })
    }

    /// Get price ID for a purchasable tier
    pub fn price_id_for_tier(&self, tier: SubscriptionTier) -> Option<&str> {
        match tier {
            SubscriptionTier::Basic => Some(&self.price_ids.basic),
            SubscriptionTier::Premium => Some(&self.price_ids.premium),
            SubscriptionTier::Free | SubscriptionTier::Owner => None,
        }
    }

    /// Get tier from price ID
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        if price_id == self.price_ids.basic {
            Some(SubscriptionTier::Basic)
        } else if price_id == self.price_ids.premium {
            Some(SubscriptionTier::Premium)
        } else {
            None
        }
    }

    /// Monthly list price for a tier; zero for tiers that are never billed
    pub fn price_cents_for_tier(&self, tier: SubscriptionTier) -> i64 {
        match tier {
            SubscriptionTier::Basic => self.plan_prices.basic_cents,
            SubscriptionTier::Premium => self.plan_prices.premium_cents,
            SubscriptionTier::Free | SubscriptionTier::Owner => 0,
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_123".to_string(),
        webhook_secret: "whsec_test_secret".to_string(),
        price_ids: PriceIds {
            basic: "price_basic".to_string(),
            premium: "price_premium".to_string(),
        },
        plan_prices: PlanPrices::default(),
        request_timeout: Duration::from_secs(DEFAULT_STRIPE_TIMEOUT_SECS),
        read_retries: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_lookup_round_trips_for_purchasable_tiers() {
        let config = test_config();
        for tier in [SubscriptionTier::Basic, SubscriptionTier::Premium] {
            let price = config.price_id_for_tier(tier).unwrap();
            assert_eq!(config.tier_for_price_id(price), Some(tier));
        }
        assert!(config.price_id_for_tier(SubscriptionTier::Free).is_none());
        assert!(config.price_id_for_tier(SubscriptionTier::Owner).is_none());
        assert!(config.tier_for_price_id("price_unknown").is_none());
    }

    #[test]
    fn test_unbilled_tiers_cost_nothing() {
        let config = test_config();
        assert_eq!(config.price_cents_for_tier(SubscriptionTier::Free), 0);
        assert_eq!(config.price_cents_for_tier(SubscriptionTier::Owner), 0);
        assert_eq!(config.price_cents_for_tier(SubscriptionTier::Basic), 999);
        assert_eq!(config.price_cents_for_tier(SubscriptionTier::Premium), 1999);
    }
}
