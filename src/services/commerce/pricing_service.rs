//! Tiered unit pricing.
//!
//! Prices are derived from the product on every read and are never stored on
//! cart lines; only order lines capture them.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::entities::product;
use crate::errors::ServiceError;

/// Decimal places money is kept at.
pub const MONEY_SCALE: u32 = 2;

/// Unit and line price for a quantity of one product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub bulk_applied: bool,
}

/// True when the bulk tier applies to `quantity`.
pub fn bulk_applies(product: &product::Model, quantity: i32) -> bool {
    product.bulk_price.is_some() && quantity >= product.bulk_min_quantity
}

/// Unit price for `quantity` units: the bulk price once the threshold is met,
/// the selling price otherwise.
pub fn effective_price(product: &product::Model, quantity: i32) -> Decimal {
    match product.bulk_price {
        Some(bulk) if quantity >= product.bulk_min_quantity => bulk,
        _ => product.selling_price,
    }
}

pub fn line_total(product: &product::Model, quantity: i32) -> Decimal {
    round_money(effective_price(product, quantity) * Decimal::from(quantity))
}

pub fn quote(product: &product::Model, quantity: i32) -> PriceQuote {
    PriceQuote {
        unit_price: effective_price(product, quantity),
        line_total: line_total(product, quantity),
        bulk_applied: bulk_applies(product, quantity),
    }
}

/// Rounds half away from zero to two decimal places.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts a money amount into gateway minor units (e.g. rupees to paise).
pub fn to_minor_units(amount: Decimal) -> Result<i64, ServiceError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| ServiceError::InternalError(format!("amount {} out of range", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn product(selling: Decimal, bulk: Option<Decimal>, threshold: i32) -> product::Model {
        product::Model {
            id: Uuid::new_v4(),
            name: "Widget".into(),
            selling_price: selling,
            bulk_price: bulk,
            bulk_min_quantity: threshold,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ==================== Effective Price Tests ====================

    #[rstest]
    #[case(1, dec!(100.00), false)]
    #[case(49, dec!(100.00), false)]
    #[case(50, dec!(80.00), true)]
    #[case(500, dec!(80.00), true)]
    fn bulk_tier_applies_at_threshold(
        #[case] quantity: i32,
        #[case] expected: Decimal,
        #[case] bulk: bool,
    ) {
        let p = product(dec!(100.00), Some(dec!(80.00)), 50);
        assert_eq!(effective_price(&p, quantity), expected);
        assert_eq!(bulk_applies(&p, quantity), bulk);
    }

    #[test]
    fn no_bulk_price_means_selling_price_everywhere() {
        let p = product(dec!(100.00), None, 50);
        assert_eq!(effective_price(&p, 1_000), dec!(100.00));
        assert!(!bulk_applies(&p, 1_000));
    }

    // ==================== Line Total Tests ====================

    #[test]
    fn line_total_follows_cumulative_quantity() {
        let p = product(dec!(100.00), Some(dec!(80.00)), 50);
        assert_eq!(line_total(&p, 49), dec!(4900.00));
        assert_eq!(line_total(&p, 50), dec!(4000.00));
    }

    #[test]
    fn quote_bundles_price_and_flag() {
        let p = product(dec!(12.50), Some(dec!(10.00)), 10);
        let q = quote(&p, 10);
        assert_eq!(q.unit_price, dec!(10.00));
        assert_eq!(q.line_total, dec!(100.00));
        assert!(q.bulk_applied);
    }

    // ==================== Minor Unit Tests ====================

    #[rstest]
    #[case(dec!(0), 0)]
    #[case(dec!(1), 100)]
    #[case(dec!(499.99), 49_999)]
    #[case(dec!(10.005), 1_001)]
    fn converts_to_minor_units(#[case] amount: Decimal, #[case] minor: i64) {
        assert_eq!(to_minor_units(amount).unwrap(), minor);
    }
}
