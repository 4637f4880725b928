//! # Droplet arithmetic
//!
//! MDL amounts on the wire are decimal coin strings; the teller computes
//! in droplets, the smallest unit. 1 MDL = 10^6 droplets. Parsing never
//! goes through floating point: digits beyond the sixth decimal place are
//! truncated, which matches the node's own flooring behavior.

/// Droplets per whole MDL coin.
pub const DROPLETS_PER_COIN: u64 = 1_000_000;

/// Number of decimal places a droplet amount can carry.
pub const MAX_DECIMALS: u32 = 6;

/// Ways a coin string can fail to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    /// The string is not a non-negative decimal number.
    #[error("invalid coin amount: {0:?}")]
    Invalid(String),
    /// The amount does not fit in 64 bits of droplets.
    #[error("coin amount out of range: {0:?}")]
    OutOfRange(String),
}

/// Parse a decimal coin string into droplets, flooring anything beyond
/// [`MAX_DECIMALS`] decimal places.
pub fn droplets_from_coin_string(coins: &str) -> Result<u64, AmountError> {
    let coins = coins.trim();
    let invalid = || AmountError::Invalid(coins.to_string());

    let (integer, fraction) = match coins.split_once('.') {
        Some((integer, fraction)) => (integer, fraction),
        None => (coins, ""),
    };

    if integer.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(integer) || !all_digits(fraction) {
        return Err(invalid());
    }

    let whole: u64 = match integer {
        "" => 0,
        digits => digits
            .parse()
            .map_err(|_| AmountError::OutOfRange(coins.to_string()))?,
    };

    // Truncating to six places is the flooring step.
    let taken = fraction.len().min(MAX_DECIMALS as usize);
    let mut fractional: u64 = 0;
    for digit in fraction.bytes().take(taken) {
        fractional = fractional * 10 + u64::from(digit - b'0');
    }
    fractional *= 10u64.pow(MAX_DECIMALS - taken as u32);

    whole
        .checked_mul(DROPLETS_PER_COIN)
        .and_then(|droplets| droplets.checked_add(fractional))
        .ok_or_else(|| AmountError::OutOfRange(coins.to_string()))
}

/// Render droplets as the decimal coin string the node APIs expect.
pub fn coin_string_from_droplets(droplets: u64) -> String {
    let whole = droplets / DROPLETS_PER_COIN;
    let fraction = droplets % DROPLETS_PER_COIN;
    if fraction == 0 {
        return whole.to_string();
    }

    let fraction = format!("{fraction:06}");
    format!("{whole}.{}", fraction.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("0", 0; "zero")]
    #[test_case("1", 1_000_000; "whole coin")]
    #[test_case("0.5", 500_000; "half coin")]
    #[test_case("132.000001", 132_000_001; "single droplet fraction")]
    #[test_case(".25", 250_000; "no integer part")]
    #[test_case("3.", 3_000_000; "trailing dot")]
    #[test_case("0.0000019", 1; "floors beyond six decimals")]
    #[test_case("  2.5 ", 2_500_000; "surrounding whitespace")]
    fn parses_coin_strings(coins: &str, droplets: u64) {
        assert_eq!(droplets_from_coin_string(coins), Ok(droplets));
    }

    #[test_case(""; "empty")]
    #[test_case("."; "lone dot")]
    #[test_case("-1"; "negative")]
    #[test_case("1e6"; "scientific notation")]
    #[test_case("12.3.4"; "double dot")]
    #[test_case("coins"; "not a number")]
    fn rejects_invalid_coin_strings(coins: &str) {
        assert!(droplets_from_coin_string(coins).is_err());
    }

    #[test]
    fn rejects_out_of_range_amounts() {
        let coins = u64::MAX.to_string();
        assert_eq!(
            droplets_from_coin_string(&coins),
            Err(AmountError::OutOfRange(coins))
        );
    }

    #[test_case(0, "0"; "zero")]
    #[test_case(1_000_000, "1"; "whole coin")]
    #[test_case(2_500_000, "2.5"; "fraction trimmed")]
    #[test_case(1, "0.000001"; "single droplet")]
    fn renders_coin_strings(droplets: u64, coins: &str) {
        assert_eq!(coin_string_from_droplets(droplets), coins);
    }

    proptest! {
        #[test]
        fn round_trips_through_coin_strings(droplets in 0u64..=u64::MAX / DROPLETS_PER_COIN) {
            let coins = coin_string_from_droplets(droplets);
            prop_assert_eq!(droplets_from_coin_string(&coins), Ok(droplets));
        }
    }
}
