use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Error kinds the venue boundary can report. Recovery logic branches on the
/// variant, never on message text: the adapter that talks to the venue is
/// responsible for classifying its raw errors exactly once.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network/timeout class failure, safe to retry as-is.
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The venue refused the request shape (e.g. notional sizing unsupported).
    #[error("order rejected: {0}")]
    Rejected(String),
    /// Withdrawal blocked because funds still collateralize an open position.
    #[error("collateral locked: {0}")]
    CollateralLocked(String),
    /// The venue returned nothing usable for the query.
    #[error("data unavailable: {0}")]
    Unavailable(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_) | ExchangeError::RateLimited(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// How a market order is sized. Quote-notional is preferred since it directly
/// consumes "available margin x leverage"; base quantity is the fallback when
/// the venue rejects notional sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSpec {
    Quote(Decimal),
    Base(Decimal),
}

/// One open position as reported by the venue. Fetched fresh on every check;
/// the optional fields are omitted by some venues.
#[derive(Debug, Clone)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Signed: positive long, negative short.
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub last_price: Option<Decimal>,
    pub quantity_step: Decimal,
}

/// The remote venue as the core consumes it. One instance per sub-account
/// (credentials live inside the implementation); calls may be slow, fail
/// transiently, or return stale data.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Free collateral in the quote currency.
    async fn available_margin(&self) -> Result<Decimal, ExchangeError>;

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Mid of the best bid/ask, used as a secondary price source.
    async fn order_book_mid(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn market_info(&self, symbol: &str) -> Result<MarketInfo, ExchangeError>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: SizeSpec,
        reduce_only: bool,
    ) -> Result<(), ExchangeError>;

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError>;

    /// Moves `amount` of the quote currency to an on-chain address. Fails with
    /// `CollateralLocked` while the funds still back an open position.
    async fn withdraw(&self, destination: &str, amount: Decimal) -> Result<(), ExchangeError>;
}

/// Venues disagree on the pair separator, so `SOL_USDC` and `SOL-USDC` must
/// compare equal.
pub fn symbol_matches(reported: &str, wanted: &str) -> bool {
    if reported == wanted {
        return true;
    }
    let norm = |s: &str| s.replace('-', "_");
    norm(reported) == norm(wanted)
}

/// Floor `size` to a whole number of `step`s, clamped to `min_order` when the
/// result would be below the venue minimum.
pub fn quantize_size_by_step(size: Decimal, step: Decimal, min_order: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size.max(min_order);
    }
    let steps = (size / step).floor();
    let qty = (steps * step).round_dp_with_strategy(step.scale(), RoundingStrategy::ToZero);
    if qty < min_order {
        min_order
    } else {
        qty
    }
}

/// Quote amounts are truncated to 4 decimal places; longer decimals are
/// rejected by the venue.
pub fn round_quote_notional(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(4, RoundingStrategy::ToZero)
}
