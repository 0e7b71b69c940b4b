//! Status strings published to the chat platform. Pure functions of the current snapshot.
use bigdecimal::{BigDecimal, RoundingMode};
use color_eyre::eyre::{self, eyre};
use num_bigint::Sign;
use num_traits::Zero as _;

use crate::{config::TokenConfig, state::PriceState};

/// `"<icon> $<price> (<reference per token>)"`, both to 4 decimals.
pub fn nickname(state: &PriceState, token: &TokenConfig) -> String {
    format!(
        "{} ${} ({})",
        token.icon,
        fixed(&state.price, 4),
        fixed(&reference_rate(&state.reference_amount, &state.token_amount), 4)
    )
}

/// Reference units per token unit.
pub fn reference_rate(reference_amount: &BigDecimal, token_amount: &BigDecimal) -> BigDecimal {
    // an empty pool has no rate, report it like its price
    if token_amount.is_zero() {
        return BigDecimal::zero();
    }
    reference_amount / token_amount
}

/// LP unit composition and implied value, assuming a balanced two-asset pool.
///
/// Returns `None` until a cycle has seen a token reserve, in which case nothing should be
/// published.
pub fn presence(
    state: &PriceState,
    token: &TokenConfig,
    reference_symbol: &str,
) -> eyre::Result<Option<String>> {
    if state.is_empty() {
        return Ok(None);
    }
    if state.total_supply.is_zero() {
        return Err(eyre!(
            "{}'s pool holds reserves but has no LP supply",
            token.name
        ));
    }

    let token_share = &state.token_amount / &state.total_supply;
    let reference_share = &state.reference_amount / &state.total_supply;
    let lp_price = &state.price * &token_share * BigDecimal::from(2);

    Ok(Some(format!(
        "LP ≈${} | {} {} + {} {}",
        trimmed(&lp_price, 2),
        trimmed(&token_share, 4),
        token.icon,
        trimmed(&reference_share, 4),
        reference_symbol,
    )))
}

/// Rounds half-even to exactly `places` fractional digits.
pub fn fixed(value: &BigDecimal, places: u32) -> String {
    let (digits, scale) = value
        .with_scale_round(i64::from(places), RoundingMode::HalfEven)
        .as_bigint_and_exponent();
    let places = usize::try_from(scale).unwrap_or_default();

    let sign = if digits.sign() == Sign::Minus { "-" } else { "" };
    let mut magnitude = digits.magnitude().to_string();
    if magnitude.len() <= places {
        magnitude.insert_str(0, &"0".repeat(places + 1 - magnitude.len()));
    }

    let (integer, fraction) = magnitude.split_at(magnitude.len() - places);
    if fraction.is_empty() {
        format!("{sign}{integer}")
    } else {
        format!("{sign}{integer}.{fraction}")
    }
}

/// Rounds to at most `places` fractional digits, keeping at least one.
pub fn trimmed(value: &BigDecimal, places: u32) -> String {
    let rounded = fixed(value, places);
    if !rounded.contains('.') {
        return format!("{rounded}.0");
    }

    let mut trimmed = rounded.trim_end_matches('0').to_string();
    if trimmed.ends_with('.') {
        trimmed.push('0');
    }
    trimmed
}
