//! Common types used across Larder

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LarderError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier.
///
/// Ranked from most privileged (`Owner`, rank 1) to least (`Free`, rank 4).
/// `Owner` is administrative: it is never purchased and bypasses billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Owner,
    Premium,
    Basic,
    Free,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [Self::Owner, Self::Premium, Self::Basic, Self::Free];

    /// Rank of the tier; lower is more privileged
    pub fn rank(&self) -> u8 {
        match self {
            Self::Owner => 1,
            Self::Premium => 2,
            Self::Basic => 3,
            Self::Free => 4,
        }
    }

    /// Moving from `self` to `to` is an upgrade
    pub fn is_upgrade(&self, to: SubscriptionTier) -> bool {
        to.rank() < self.rank()
    }

    /// Moving from `self` to `to` is a downgrade
    pub fn is_downgrade(&self, to: SubscriptionTier) -> bool {
        to.rank() > self.rank()
    }

    /// Tiers a user can buy through the billing flow
    pub fn is_purchasable(&self) -> bool {
        matches!(self, Self::Basic | Self::Premium)
    }

    /// Tiers backed by a recurring external subscription
    pub fn is_paid(&self) -> bool {
        self.is_purchasable()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Premium => "premium",
            Self::Basic => "basic",
            Self::Free => "free",
        }
    }

    /// Human readable name for notifications
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Owner => "Owner",
            Self::Premium => "Premium",
            Self::Basic => "Basic",
            Self::Free => "Free",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = LarderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "owner" => Ok(Self::Owner),
            "premium" => Ok(Self::Premium),
            "basic" => Ok(Self::Basic),
            "free" => Ok(Self::Free),
            other => Err(LarderError::InvalidTier(other.to_string())),
        }
    }
}

// =============================================================================
// Data retention
// =============================================================================

/// How much user content survives when a user lands on a tier.
/// `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_friendships: Option<u32>,
    pub max_categories: Option<u32>,
    pub max_items_per_category: Option<u32>,
}

impl RetentionPolicy {
    pub const UNLIMITED: RetentionPolicy = RetentionPolicy {
        max_friendships: None,
        max_categories: None,
        max_items_per_category: None,
    };

    /// Retention limits for a tier.
    /// Basic keeps 10 friendships, 10 categories, 20 items per category.
    /// Free keeps no friendships, 3 categories, 5 items per category.
    pub fn for_tier(tier: SubscriptionTier) -> Self {
        match tier {
            SubscriptionTier::Owner | SubscriptionTier::Premium => Self::UNLIMITED,
            SubscriptionTier::Basic => Self {
                max_friendships: Some(10),
                max_categories: Some(10),
                max_items_per_category: Some(20),
            },
            SubscriptionTier::Free => Self {
                max_friendships: Some(0),
                max_categories: Some(3),
                max_items_per_category: Some(5),
            },
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::UNLIMITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ranks() {
        assert_eq!(SubscriptionTier::Owner.rank(), 1);
        assert_eq!(SubscriptionTier::Premium.rank(), 2);
        assert_eq!(SubscriptionTier::Basic.rank(), 3);
        assert_eq!(SubscriptionTier::Free.rank(), 4);
    }

    #[test]
    fn test_upgrade_and_downgrade_are_strict() {
        for from in SubscriptionTier::ALL {
            for to in SubscriptionTier::ALL {
                assert_eq!(from.is_upgrade(to), to.rank() < from.rank());
                assert_eq!(from.is_downgrade(to), to.rank() > from.rank());
                // never both
                assert!(!(from.is_upgrade(to) && from.is_downgrade(to)));
            }
            assert!(!from.is_upgrade(from));
            assert!(!from.is_downgrade(from));
        }
    }

    #[test]
    fn test_only_basic_and_premium_are_purchasable() {
        assert!(SubscriptionTier::Basic.is_purchasable());
        assert!(SubscriptionTier::Premium.is_purchasable());
        assert!(!SubscriptionTier::Owner.is_purchasable());
        assert!(!SubscriptionTier::Free.is_purchasable());
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!(
            "Premium".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        assert_eq!(
            " free ".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Free
        );
        assert!("enterprise".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_tier_serde_is_lowercase() {
        let json = serde_json::to_string(&SubscriptionTier::Basic).unwrap();
        assert_eq!(json, "\"basic\"");
        let tier: SubscriptionTier = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(tier, SubscriptionTier::Owner);
    }

    #[test]
    fn test_retention_policies() {
        let basic = RetentionPolicy::for_tier(SubscriptionTier::Basic);
        assert_eq!(basic.max_friendships, Some(10));
        assert_eq!(basic.max_categories, Some(10));
        assert_eq!(basic.max_items_per_category, Some(20));

        let free = RetentionPolicy::for_tier(SubscriptionTier::Free);
        assert_eq!(free.max_friendships, Some(0));
        assert_eq!(free.max_categories, Some(3));
        assert_eq!(free.max_items_per_category, Some(5));

        assert!(RetentionPolicy::for_tier(SubscriptionTier::Premium).is_unlimited());
    }
}
