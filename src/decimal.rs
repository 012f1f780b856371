//! Fixed-point helpers shared by the matcher, settlement and candle aggregator.
//!
//! Every monetary quantity is a `rust_decimal::Decimal` stored with scale 18
//! (precision 36,18, matching the persisted `Numeric(36,18)` columns).
//! Derived values round HALF_EVEN; deposit-style quantization rounds DOWN.

use rust_decimal::{Decimal, RoundingStrategy};

pub const SCALE: u32 = 18;

/// Round a derived amount (trade proceeds, fee splits, ...) HALF_EVEN at scale 18.
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Round a quantity DOWN at scale 18, used for deposit quantization.
pub fn round_down(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(SCALE, RoundingStrategy::ToZero)
}

/// `volume * price`, computed at full precision and then rounded HALF_EVEN.
pub fn notional(volume: Decimal, price: Decimal) -> Decimal {
    round_amount(volume.saturating_mul(price))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn round_amount_breaks_ties_to_even() {
        assert_eq!(round_amount(dec!(1.0000000000000000005)), dec!(1.000000000000000000));
        assert_eq!(round_amount(dec!(1.0000000000000000015)), dec!(1.000000000000000002));
    }

    #[test]
    fn round_down_truncates_towards_zero() {
        assert_eq!(round_down(dec!(1.9999999999999999999)), dec!(1.999999999999999999));
    }

    #[test]
    fn notional_rounds_the_product() {
        assert_eq!(notional(dec!(3), dec!(10000.5)), dec!(30001.5));
        assert_eq!(notional(dec!(0.1), dec!(0.1)), dec!(0.01));
    }
}
