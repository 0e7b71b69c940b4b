//! Two-hop price derivation.
//!
//! The token is priced against the reference asset on its own pool, and the reference asset is
//! priced against the stable asset on a second, more liquid pool. All arithmetic is done on
//! [`BigDecimal`]s so reserve ratios with 18-decimal magnitudes don't drift.
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, RoundingMode};
use color_eyre::eyre::{self, eyre};
use num_bigint::{BigInt, BigUint};
use num_traits::Zero as _;
use tracing::{debug, instrument};

use crate::{contract::Contracts, state::PriceState};

/// Fractional digits prices are quantized to.
pub const DISPLAY_PRECISION: i64 = 4;

/// Fractional digits of the reference asset, and of normalized token amounts.
pub const REFERENCE_DECIMALS: i64 = 18;

/// Source of price snapshots.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Computes a complete snapshot from fresh on-chain reads.
    async fn snapshot(&self) -> eyre::Result<PriceState>;
}

pub fn to_decimal(value: U256) -> BigDecimal {
    BigDecimal::from(BigInt::from(to_biguint(value)))
}

/// Rescales a raw token balance to [`REFERENCE_DECIMALS`] fractional digits, i.e.
/// `raw * 10^(18 - decimals)`.
pub fn normalize(raw: U256, decimals: u8) -> BigDecimal {
    BigDecimal::new(
        BigInt::from(to_biguint(raw)),
        i64::from(decimals) - REFERENCE_DECIMALS,
    )
}

fn to_biguint(value: U256) -> BigUint {
    BigUint::from_bytes_be(&value.to_be_bytes::<32usize>())
}

/// Price of one reference unit in stable units.
pub fn reference_ratio(
    stable_reserve: &BigDecimal,
    reference_reserve: &BigDecimal,
) -> eyre::Result<BigDecimal> {
    if reference_reserve.is_zero() {
        return Err(eyre!(
            "reference pool holds no reference asset, its price is undefined"
        ));
    }
    Ok(stable_reserve / reference_reserve)
}

/// `reference_amount / token_amount * reference_price`, quantized to [`DISPLAY_PRECISION`].
/// An empty token reserve prices the token at zero.
pub fn token_price(
    reference_amount: &BigDecimal,
    token_amount: &BigDecimal,
    reference_price: &BigDecimal,
) -> BigDecimal {
    if token_amount.is_zero() {
        return quantize(&BigDecimal::zero());
    }
    quantize(&(reference_amount / token_amount * reference_price))
}

pub fn quantize(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(DISPLAY_PRECISION, RoundingMode::HalfEven)
}

/// Token pool reserves read within one derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub price: BigDecimal,
    pub reference_price: BigDecimal,
    pub reference_amount: BigDecimal,
    pub token_amount: BigDecimal,
}

/// Derives the token price from the bound contracts.
pub struct PriceEngine {
    contracts: Contracts,
    decimals: u8,
    token_pool: Address,
    reference_pool: Address,
}

impl PriceEngine {
    pub fn new(
        contracts: Contracts,
        decimals: u8,
        token_pool: Address,
        reference_pool: Address,
    ) -> Self {
        Self {
            contracts,
            decimals,
            token_pool,
            reference_pool,
        }
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    /// Stable reserve divided by reference reserve of `pool`.
    pub async fn reference_price(&self, pool: Address) -> eyre::Result<BigDecimal> {
        let reference_reserve = to_decimal(self.contracts.reference.balance_of(pool).await?);
        let stable_reserve = to_decimal(self.contracts.stable.balance_of(pool).await?);

        reference_ratio(&stable_reserve, &reference_reserve)
    }

    /// Prices the token held in `token_pool` through the reference pool `reference_pool`.
    #[instrument(skip(self))]
    pub async fn derive_price(
        &self,
        token_pool: Address,
        reference_pool: Address,
    ) -> eyre::Result<Quote> {
        let reference_amount = to_decimal(self.contracts.reference.balance_of(token_pool).await?);
        let token_amount = normalize(
            self.contracts.token.balance_of(token_pool).await?,
            self.decimals,
        );
        let reference_price = self.reference_price(reference_pool).await?;

        let price = token_price(&reference_amount, &token_amount, &reference_price);
        debug!(%price, %reference_price, "derived token price");

        Ok(Quote {
            price,
            reference_price,
            reference_amount,
            token_amount,
        })
    }

    /// Quote through the home AMM, or through another AMM's reference pool.
    pub async fn quote(&self, reference_pool: Option<Address>) -> eyre::Result<Quote> {
        self.derive_price(self.token_pool, reference_pool.unwrap_or(self.reference_pool))
            .await
    }
}

#[async_trait]
impl PriceSource for PriceEngine {
    async fn snapshot(&self) -> eyre::Result<PriceState> {
        let Quote {
            price,
            reference_price,
            reference_amount,
            token_amount,
        } = self.quote(None).await?;
        let total_supply = to_decimal(self.contracts.lp.total_supply().await?);

        Ok(PriceState {
            price,
            reference_price,
            reference_amount,
            token_amount,
            total_supply,
        })
    }
}
