//! Mid-cycle upgrade proration
//!
//! Only used for strict upgrades inside an existing billing relationship.
//! Free → paid upgrades are charged the plan's full price by the new
//! subscription's first invoice instead.

use time::OffsetDateTime;

/// Charge, in cents, for moving to a higher tier mid-cycle.
///
/// The unused value of the current plan (`ceil(current * remaining / total)`)
/// is credited against the new plan's price. Never negative. When
/// `days_remaining >= total_days` (clock skew, or a zero-length period) the
/// whole current price is credited.
pub fn compute_upgrade_charge(
    days_remaining: i64,
    total_days: i64,
    current_price_cents: i64,
    new_price_cents: i64,
) -> i64 {
    let current_price_cents = current_price_cents.max(0);
    let days_remaining = days_remaining.max(0);

    let unused_current_value = if total_days <= 0 || days_remaining >= total_days {
        current_price_cents
    } else {
        // Integer ceil division keeps the result exact in minor units
        let numerator = current_price_cents as i128 * days_remaining as i128;
        let total = total_days as i128;
        ((numerator + total - 1) / total) as i64
    };

    (new_price_cents - unused_current_value).max(0)
}

/// Whole days remaining and total whole days in a billing period as seen at `now`.
pub fn period_days(
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> (i64, i64) {
    let total = (period_end - period_start).whole_days().max(0);
    let remaining = if now >= period_end {
        0
    } else {
        (period_end - now).whole_days().max(0)
    };
    (remaining, total)
}
