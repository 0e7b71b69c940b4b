use bigdecimal::BigDecimal;

/// One fully-computed refresh cycle.
///
/// Snapshots are immutable: every cycle builds a new one and swaps it in, so the amounts a
/// reader sees always belong to the same cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceState {
    /// Token price in stable units, quantized to [`crate::price::DISPLAY_PRECISION`]
    pub price: BigDecimal,
    /// Reference asset price in stable units
    pub reference_price: BigDecimal,
    /// Raw reference asset reserve of the token pool
    pub reference_amount: BigDecimal,
    /// Token reserve of the token pool, normalized to 18 fractional digits
    pub token_amount: BigDecimal,
    /// Total supply of the token pool's LP units
    pub total_supply: BigDecimal,
}

impl PriceState {
    /// `true` until the first cycle has seen a non-empty token reserve.
    pub fn is_empty(&self) -> bool {
        use num_traits::Zero as _;
        self.token_amount.is_zero()
    }
}
