//! # Exchange rates and payout amounts
//!
//! Rates are configured as strings, either decimal (`"0.0008"`) or
//! rational (`"1/2"`), and parsed into exact big rationals; floats never
//! enter the calculation. The payout amount is
//!
//! ```text
//! mdl_droplets = floor((amount_native / native_unit_scale)
//!                      * rate * 10^max_decimals) * 10^(6 - max_decimals)
//! ```
//!
//! where `max_decimals` truncates payout precision below 10^-max_decimals
//! MDL.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Signed as _;
use num_traits::ToPrimitive as _;
use num_traits::Zero as _;

use crate::error::Error;
use crate::storage::model::CoinType;

/// Parse a configured exchange rate. Accepts a decimal (`"500"`,
/// `"0.05"`) or a rational (`"1/2"`); the result must be positive.
pub fn parse_rate(rate: &str) -> Result<BigRational, Error> {
    let rate = rate.trim();
    let invalid = || Error::InvalidRate(rate.to_string());

    let parsed = match rate.split_once('/') {
        Some((numerator, denominator)) => {
            let numerator: BigInt = numerator.trim().parse().map_err(|_| invalid())?;
            let denominator: BigInt = denominator.trim().parse().map_err(|_| invalid())?;
            if denominator.is_zero() {
                return Err(invalid());
            }
            BigRational::new(numerator, denominator)
        }
        None => parse_decimal(rate).ok_or_else(invalid)?,
    };

    if parsed.is_positive() {
        Ok(parsed)
    } else {
        Err(invalid())
    }
}

/// Parse a plain decimal string into a rational.
fn parse_decimal(decimal: &str) -> Option<BigRational> {
    let (integer, fraction) = match decimal.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (decimal, ""),
    };
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }

    let digits: String = format!("{integer}{fraction}");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mantissa: BigInt = digits.parse().ok()?;
    let scale = BigInt::from(10u8).pow(fraction.len() as u32);
    Some(BigRational::new(mantissa, scale))
}

/// Compute the droplets to pay for a deposit of `amount_native` smallest
/// units of `coin_type` at `rate`.
pub fn calculate_mdl_droplets(
    amount_native: i128,
    coin_type: CoinType,
    rate: &BigRational,
    max_decimals: u32,
) -> Result<u64, Error> {
    if amount_native < 0 {
        return Err(Error::NegativeDeposit(amount_native));
    }
    if max_decimals > mdl::amount::MAX_DECIMALS {
        return Err(Error::InvalidMaxDecimals(max_decimals));
    }

    let native = BigRational::from_integer(BigInt::from(amount_native));
    let scale = BigInt::from(coin_type.native_unit_scale());
    let precision = BigInt::from(10u8).pow(max_decimals);

    let scaled = native / scale * rate * precision;
    let truncated = scaled.floor().to_integer();
    let droplets = truncated * BigInt::from(10u8).pow(mdl::amount::MAX_DECIMALS - max_decimals);

    droplets.to_u64().ok_or(Error::AmountOverflow)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("500", 500, 1; "integer")]
    #[test_case("0.05", 5, 100; "decimal")]
    #[test_case("1/2", 1, 2; "rational")]
    #[test_case(" 3 / 4 ", 3, 4; "rational with spaces")]
    #[test_case("2.50", 5, 2; "reduced decimal")]
    fn parses_rates_exactly(rate: &str, numerator: i64, denominator: i64) {
        let expected = BigRational::new(BigInt::from(numerator), BigInt::from(denominator));
        assert_eq!(parse_rate(rate).unwrap(), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("0"; "zero")]
    #[test_case("0/5"; "zero rational")]
    #[test_case("1/0"; "zero denominator")]
    #[test_case("-2"; "negative")]
    #[test_case("-1/2"; "negative rational")]
    #[test_case("1.2.3"; "double dot")]
    #[test_case("abc"; "not a number")]
    fn rejects_bad_rates(rate: &str) {
        assert!(matches!(parse_rate(rate), Err(Error::InvalidRate(_))));
    }

    // 0.002 BTC at 500 MDL/BTC pays exactly 1 MDL.
    #[test_case(200_000, CoinType::Btc, "500", 0, 1_000_000; "btc exact rate")]
    // 12345 BTC at 1/2 with one decimal of precision pays 6172.5 MDL.
    #[test_case(1_234_500_000_000, CoinType::Btc, "1/2", 1, 6_172_500_000; "fractional rate")]
    // 224.5236 ETH at 1568: 352053.0048 floors to 352053 MDL.
    #[test_case(224_523_600_000_000_000_000, CoinType::Eth, "1568", 0, 352_053_000_000; "eth precision loss")]
    // Zero in, zero out.
    #[test_case(0, CoinType::Sky, "1000", 6, 0; "zero deposit")]
    // 1 droplet of SKY at 1/3, full precision: floor(1/3) of a droplet.
    #[test_case(1, CoinType::Sky, "1/3", 6, 0; "sub droplet truncates")]
    fn computes_payout_amounts(
        native: i128,
        coin_type: CoinType,
        rate: &str,
        max_decimals: u32,
        expected: u64,
    ) {
        let rate = parse_rate(rate).unwrap();
        let droplets = calculate_mdl_droplets(native, coin_type, &rate, max_decimals).unwrap();
        assert_eq!(droplets, expected);
    }

    #[test]
    fn rejects_negative_deposits() {
        let rate = parse_rate("1").unwrap();
        let result = calculate_mdl_droplets(-5, CoinType::Btc, &rate, 0);
        assert!(matches!(result, Err(Error::NegativeDeposit(-5))));
    }

    #[test]
    fn rejects_excessive_precision() {
        let rate = parse_rate("1").unwrap();
        let result = calculate_mdl_droplets(5, CoinType::Btc, &rate, 7);
        assert!(matches!(result, Err(Error::InvalidMaxDecimals(7))));
    }

    #[test]
    fn rejects_amounts_past_u64_droplets() {
        let rate = parse_rate("1000000000").unwrap();
        let result =
            calculate_mdl_droplets(i128::from(u64::MAX), CoinType::Sky, &rate, 0);
        assert!(matches!(result, Err(Error::AmountOverflow)));
    }

    proptest! {
        /// The truncation rule: the payout is a multiple of
        /// 10^(6 - max_decimals), never exceeds the exact conversion, and
        /// is within one truncation step below it.
        #[test]
        fn payout_follows_the_truncation_rule(
            native in 0i128..2_000_000_000_000,
            numerator in 1u64..10_000,
            denominator in 1u64..10_000,
            max_decimals in 0u32..=6,
        ) {
            let rate = BigRational::new(BigInt::from(numerator), BigInt::from(denominator));
            let droplets =
                calculate_mdl_droplets(native, CoinType::Btc, &rate, max_decimals).unwrap();

            let step = 10u64.pow(6 - max_decimals);
            prop_assert_eq!(droplets % step, 0);

            let exact = BigRational::from_integer(BigInt::from(native))
                / BigInt::from(CoinType::Btc.native_unit_scale())
                * &rate
                * BigInt::from(1_000_000u64);
            let paid = BigRational::from_integer(BigInt::from(droplets));
            prop_assert!(paid <= exact);
            let next_step = paid + BigRational::from_integer(BigInt::from(step));
            prop_assert!(next_step > exact);
        }

        /// Zero native always pays zero.
        #[test]
        fn zero_native_pays_zero(
            numerator in 1u64..10_000,
            denominator in 1u64..10_000,
            max_decimals in 0u32..=6,
        ) {
            let rate = BigRational::new(BigInt::from(numerator), BigInt::from(denominator));
            let droplets =
                calculate_mdl_droplets(0, CoinType::Waves, &rate, max_decimals).unwrap();
            prop_assert_eq!(droplets, 0);
        }
    }
}
