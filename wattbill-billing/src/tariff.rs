//! Tariff arithmetic: reading rollover, the bill total formula and the total tolerance band.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use wattbill_core::MonetaryItems;

use crate::{BillingError, BillingResult};

/// Number of decimal digits in the integer part of `value` (at least one).
pub fn digit_count(value: Decimal) -> u32 {
    let mut remaining = value.abs().trunc();
    let mut digits = 0;
    while remaining >= Decimal::ONE {
        remaining = (remaining / Decimal::TEN).trunc();
        digits += 1;
    }
    digits.max(1)
}

/// Consumed units between two readings.
///
/// A current reading below the previous one means the counter wrapped; the difference is
/// corrected by `10^d - 1` where `d` is the digit count of the previous reading.
pub fn reading_diff(previous: Decimal, current: Decimal) -> BillingResult<Decimal> {
    let diff = current - previous;
    if diff >= Decimal::ZERO {
        return Ok(diff);
    }
    let digits = digit_count(previous);
    let modulus = (0..digits)
        .try_fold(Decimal::ONE, |acc, _| acc.checked_mul(Decimal::TEN))
        .ok_or_else(|| {
            BillingError::InvalidReading(format!("reading {previous} is too wide to roll over"))
        })?;
    let corrected = diff + (modulus - Decimal::ONE);
    if corrected < Decimal::ZERO {
        return Err(BillingError::InvalidReading(format!(
            "current reading {current} is below previous reading {previous} even after rollover"
        )));
    }
    Ok(corrected)
}

/// Components of a computed bill total.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TotalBreakdown {
    pub reading_diff: Decimal,
    pub consumption_cost: Decimal,
    pub total: Decimal,
}

/// `reading_diff × factor × tariff_cost + fixed_fee + installment + settlements + stamp
/// − prior_payments + rounding`.
///
/// Amounts too large for a `Decimal` are rejected instead of overflowing.
pub fn compute_total(
    reading_diff: Decimal,
    factor: i64,
    tariff_cost: Decimal,
    fixed_fee: Decimal,
    items: &MonetaryItems,
) -> BillingResult<TotalBreakdown> {
    let consumption_cost = reading_diff
        .checked_mul(Decimal::from(factor))
        .and_then(|units| units.checked_mul(tariff_cost))
        .ok_or_else(|| {
            BillingError::InvalidReading(format!(
                "consumption of {reading_diff} units at factor {factor} overflows the tariff cost"
            ))
        })?;
    let total = consumption_cost
        .checked_add(fixed_fee)
        .and_then(|sum| sum.checked_add(items.fixed_installment))
        .and_then(|sum| sum.checked_add(items.settlements))
        .and_then(|sum| sum.checked_add(items.stamp))
        .and_then(|sum| sum.checked_sub(items.prior_payments))
        .and_then(|sum| sum.checked_add(items.rounding))
        .ok_or_else(|| {
            BillingError::InvalidReading(format!(
                "bill items overflow the total for consumption cost {consumption_cost}"
            ))
        })?;
    Ok(TotalBreakdown {
        reading_diff,
        consumption_cost,
        total,
    })
}

/// Accept `claimed` when its integer part is within `tolerance` units of `computed`'s.
pub fn check_total(claimed: Decimal, computed: Decimal, tolerance: i64) -> BillingResult<()> {
    let delta = claimed
        .trunc()
        .checked_sub(computed.trunc())
        .ok_or_else(|| {
            BillingError::InvalidReading(format!("bill total {claimed} is out of range"))
        })?;
    if delta.abs() > Decimal::from(tolerance) {
        return Err(BillingError::TotalMismatch {
            claimed,
            computed,
            delta,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn counts_integer_digits() {
        assert_eq!(digit_count(dec!(9998)), 4);
        assert_eq!(digit_count(dec!(9998.75)), 4);
        assert_eq!(digit_count(dec!(0)), 1);
        assert_eq!(digit_count(dec!(100000)), 6);
    }

    #[test]
    fn forward_readings_are_plain_differences() {
        assert_eq!(reading_diff(dec!(1000), dec!(1050)).unwrap(), dec!(50));
        assert_eq!(reading_diff(dec!(1000), dec!(1000)).unwrap(), dec!(0));
    }

    #[test]
    fn rollover_adds_counter_width() {
        assert_eq!(reading_diff(dec!(9998), dec!(3)).unwrap(), dec!(4));
        let previous = dec!(987654);
        let current = dec!(12);
        let diff = reading_diff(previous, current).unwrap();
        assert_eq!(diff, current - previous + dec!(999999));
        assert!(diff >= Decimal::ZERO);
    }

    #[test]
    fn fractional_underflow_after_rollover_is_rejected() {
        let err = reading_diff(dec!(9999.5), dec!(0)).unwrap_err();
        assert!(matches!(err, BillingError::InvalidReading(_)));
    }

    #[test]
    fn computes_total_from_tariff_and_items() {
        let breakdown =
            compute_total(dec!(50), 1, dec!(2.00), dec!(5), &MonetaryItems::default()).unwrap();
        assert_eq!(breakdown.consumption_cost, dec!(100.00));
        assert_eq!(breakdown.total, dec!(105.00));

        let items = MonetaryItems {
            fixed_installment: dec!(12.5),
            settlements: dec!(3),
            settlement_qty: dec!(7),
            stamp: dec!(1.25),
            prior_payments: dec!(20),
            rounding: dec!(0.25),
        };
        let breakdown = compute_total(dec!(40), 3, dec!(0.75), dec!(10), &items).unwrap();
        // 40 * 3 * 0.75 = 90; 90 + 10 + 12.5 + 3 + 1.25 - 20 + 0.25
        assert_eq!(breakdown.total, dec!(97.00));
    }

    #[test]
    fn oversized_consumption_is_rejected() {
        let err = compute_total(Decimal::MAX, 10, dec!(2.00), dec!(5), &MonetaryItems::default())
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidReading(_)));

        let items = MonetaryItems {
            fixed_installment: Decimal::MAX,
            ..MonetaryItems::default()
        };
        let err = compute_total(dec!(50), 1, dec!(2.00), dec!(5), &items).unwrap_err();
        assert!(matches!(err, BillingError::InvalidReading(_)));
    }

    #[test]
    fn tolerance_band_is_one_unit() {
        let computed = dec!(105.00);
        assert!(check_total(dec!(104), computed, 1).is_ok());
        assert!(check_total(dec!(106), computed, 1).is_ok());
        assert!(check_total(dec!(105.99), computed, 1).is_ok());
        let err = check_total(dec!(110), computed, 1).unwrap_err();
        match err {
            BillingError::TotalMismatch { delta, .. } => assert_eq!(delta, dec!(5)),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
