use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::PairConfig;
use crate::exchange::{
    quantize_size_by_step, round_quote_notional, symbol_matches, ExchangeClient, ExchangeError,
    MarketInfo, OrderSide, PositionSnapshot, SizeSpec,
};
use crate::retry::RetryPolicy;

const SWEEP_RETRY_WAIT: Duration = Duration::from_secs(1);

fn fallback_quantity_step() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn min_base_order() -> Decimal {
    Decimal::new(1, 2)
}

/// Which side of the hedge this sub-account holds. Also labels every log line
/// the agent emits; the venue-reported position sign is never used for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegRole {
    Long,
    Short,
}

impl LegRole {
    pub fn open_side(self) -> OrderSide {
        match self {
            LegRole::Long => OrderSide::Buy,
            LegRole::Short => OrderSide::Sell,
        }
    }

    pub fn close_side(self) -> OrderSide {
        match self {
            LegRole::Long => OrderSide::Sell,
            LegRole::Short => OrderSide::Buy,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LegRole::Long => "LONG",
            LegRole::Short => "SHORT",
        }
    }
}

/// Wraps one sub-account and makes every venue call resilient: remote failures
/// are logged and absorbed into boolean outcomes, never propagated. The client
/// handle is injected at construction; the agent owns no global state.
pub struct AccountAgent {
    name: String,
    role: LegRole,
    address: String,
    cfg: Arc<PairConfig>,
    client: Arc<dyn ExchangeClient>,
    retry: RetryPolicy,
    market_cache: Mutex<HashMap<String, MarketInfo>>,
}

impl AccountAgent {
    pub fn new(
        name: String,
        address: String,
        role: LegRole,
        cfg: Arc<PairConfig>,
        client: Arc<dyn ExchangeClient>,
    ) -> Self {
        let retry = RetryPolicy::new(cfg.retry_attempts, cfg.min_delay_secs, cfg.max_delay_secs);
        Self {
            name,
            role,
            address,
            cfg,
            client,
            retry,
            market_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> LegRole {
        self.role
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Free margin, with a fetch failure degraded to zero.
    pub async fn available_margin(&self) -> Decimal {
        match self.client.available_margin().await {
            Ok(amount) => amount,
            Err(err) => {
                log::error!("{} | margin fetch error: {}", self.name, err);
                Decimal::ZERO
            }
        }
    }

    /// Price lookup that never blocks the cycle: ticker, then order-book mid,
    /// then the cached last price, then the configured fallback.
    pub async fn reference_price(&self, symbol: &str) -> Option<Decimal> {
        match self.client.ticker_price(symbol).await {
            Ok(price) if price > Decimal::ZERO => {
                self.remember_price(symbol, price);
                return Some(price);
            }
            Ok(_) => {}
            Err(err) => log::warn!("{} | ticker price error: {}", self.name, err),
        }
        match self.client.order_book_mid(symbol).await {
            Ok(price) if price > Decimal::ZERO => {
                self.remember_price(symbol, price);
                return Some(price);
            }
            Ok(_) => {}
            Err(err) => log::warn!("{} | order book mid error: {}", self.name, err),
        }
        let cached = self
            .market_cache
            .lock()
            .unwrap()
            .get(symbol)
            .and_then(|info| info.last_price);
        if let Some(price) = cached.filter(|p| *p > Decimal::ZERO) {
            log::warn!("{} | using cached last price {} for {}", self.name, price, symbol);
            return Some(price);
        }
        if let Some(price) = self.cfg.fallback_price.filter(|p| *p > Decimal::ZERO) {
            log::warn!(
                "{} | using configured fallback price {} for {}",
                self.name,
                price,
                symbol
            );
            return Some(price);
        }
        log::error!("{} | no usable price for {}", self.name, symbol);
        None
    }

    fn remember_price(&self, symbol: &str, price: Decimal) {
        let mut cache = self.market_cache.lock().unwrap();
        cache
            .entry(symbol.to_string())
            .and_modify(|info| info.last_price = Some(price))
            .or_insert(MarketInfo {
                last_price: Some(price),
                quantity_step: fallback_quantity_step(),
            });
    }

    /// Step size and a usable price for `symbol`. The cache entry is refreshed
    /// lazily when it lacks a price; on a fetch failure a fallback entry is
    /// cached so sizing can still proceed.
    pub async fn market_info(&self, symbol: &str) -> MarketInfo {
        let cached = self.market_cache.lock().unwrap().get(symbol).cloned();
        if let Some(info) = cached {
            if info.last_price.map_or(false, |p| p > Decimal::ZERO) {
                return info;
            }
            let price = self.reference_price(symbol).await;
            let refreshed = MarketInfo {
                last_price: price,
                quantity_step: info.quantity_step,
            };
            self.market_cache
                .lock()
                .unwrap()
                .insert(symbol.to_string(), refreshed.clone());
            return refreshed;
        }

        match self.client.market_info(symbol).await {
            Ok(mut info) => {
                if !info.last_price.map_or(false, |p| p > Decimal::ZERO) {
                    info.last_price = self.reference_price(symbol).await;
                }
                self.market_cache
                    .lock()
                    .unwrap()
                    .insert(symbol.to_string(), info.clone());
                info
            }
            Err(err) => {
                log::warn!(
                    "{} | market info error for {}, using fallback step: {}",
                    self.name,
                    symbol,
                    err
                );
                let info = MarketInfo {
                    last_price: self.reference_price(symbol).await,
                    quantity_step: fallback_quantity_step(),
                };
                self.market_cache
                    .lock()
                    .unwrap()
                    .insert(symbol.to_string(), info.clone());
                info
            }
        }
    }

    /// Opens a full-margin position, retrying with a jittered delay up to the
    /// configured attempt bound. Each attempt first sizes by quote notional
    /// (margin x leverage) and falls back to base quantity when the venue
    /// rejects that. Returns false only after exhausting every attempt.
    pub async fn open_position(&self, symbol: &str, cancel: &CancellationToken) -> bool {
        let side = self.role.open_side();
        for attempt in 1..=self.retry.attempts {
            let margin = self.available_margin().await * self.cfg.leverage;
            if margin <= Decimal::ZERO {
                log::error!("{} | no margin available", self.name);
                return false;
            }

            let notional = round_quote_notional(margin);
            log::info!(
                "{} | open attempt {}/{}: {} {} for {} quote",
                self.name,
                attempt,
                self.retry.attempts,
                self.role.label(),
                symbol,
                notional
            );
            match self
                .client
                .place_market_order(symbol, side, SizeSpec::Quote(notional), false)
                .await
            {
                Ok(()) => {
                    log::info!(
                        "{} | placed {} order for {} quote_notional={}",
                        self.name,
                        self.role.label(),
                        symbol,
                        notional
                    );
                    return true;
                }
                Err(err) => {
                    log::warn!(
                        "{} | quote-notional order error (attempt {}/{}): {}",
                        self.name,
                        attempt,
                        self.retry.attempts,
                        err
                    );
                    if self.open_with_base_quantity(symbol, side).await {
                        return true;
                    }
                }
            }

            if attempt < self.retry.attempts && !self.retry.pause(cancel).await {
                log::info!("{} | open cancelled", self.name);
                return false;
            }
        }
        log::error!(
            "{} | failed to open position after {} attempts",
            self.name,
            self.retry.attempts
        );
        false
    }

    /// Second sizing strategy: base quantity computed from price and step.
    async fn open_with_base_quantity(&self, symbol: &str, side: OrderSide) -> bool {
        let info = self.market_info(symbol).await;
        let price = match info.last_price.filter(|p| *p > Decimal::ZERO) {
            Some(price) => price,
            None => {
                log::error!("{} | could not get valid price for {}", self.name, symbol);
                return false;
            }
        };
        let margin = self.available_margin().await * self.cfg.leverage;
        if margin <= Decimal::ZERO {
            log::error!("{} | no margin available", self.name);
            return false;
        }
        let qty = quantize_size_by_step(
            margin / price,
            info.quantity_step,
            min_base_order(),
        );
        log::info!(
            "{} | retrying with base quantity={} price={}",
            self.name,
            qty,
            price
        );
        match self
            .client
            .place_market_order(symbol, side, SizeSpec::Base(qty), false)
            .await
        {
            Ok(()) => {
                log::info!(
                    "{} | placed {} order for {} quantity={}",
                    self.name,
                    self.role.label(),
                    symbol,
                    qty
                );
                true
            }
            Err(err) => {
                log::warn!("{} | base-quantity order error: {}", self.name, err);
                false
            }
        }
    }

    /// Position existence check. A query failure reads as "no position" so a
    /// venue outage cannot wedge the monitoring loop; the trade-off is that an
    /// open leg may briefly go unseen.
    pub async fn has_position(&self, symbol: &str) -> bool {
        let positions = match self.client.positions().await {
            Ok(positions) => positions,
            Err(err) => {
                log::warn!("{} | position query error: {}", self.name, err);
                return false;
            }
        };
        match positions
            .iter()
            .find(|pos| symbol_matches(&pos.symbol, symbol))
        {
            Some(pos) => {
                self.log_position_detail(pos);
                true
            }
            None => {
                log::info!("{} | no position found for {}", self.name, symbol);
                false
            }
        }
    }

    fn log_position_detail(&self, pos: &PositionSnapshot) {
        let fmt_opt = |v: Option<Decimal>| {
            v.map(|d| d.to_string()).unwrap_or_else(|| "n/a".to_string())
        };
        let notional = pos
            .entry_price
            .map(|entry| (pos.size.abs() * entry).round_dp(2));
        log::info!(
            "{} | {} position: {} size={} (~{}) entry={} mark={} liq={} pnl={}",
            self.name,
            self.role.label(),
            pos.symbol,
            pos.size,
            fmt_opt(notional),
            fmt_opt(pos.entry_price),
            fmt_opt(pos.mark_price),
            fmt_opt(pos.liquidation_price),
            fmt_opt(pos.unrealized_pnl),
        );
    }

    /// Absolute size of the open position on `symbol`, if visible.
    pub async fn position_size(&self, symbol: &str) -> Option<Decimal> {
        match self.client.positions().await {
            Ok(positions) => positions
                .iter()
                .find(|pos| symbol_matches(&pos.symbol, symbol))
                .map(|pos| pos.size.abs()),
            Err(err) => {
                log::warn!("{} | position size query error: {}", self.name, err);
                None
            }
        }
    }

    /// Closes the open position with a reduce-only order sized to the queried
    /// size. No-op success when no position is visible. When sizing fails, one
    /// degraded-mode attempt with the configured fixed size may be issued.
    pub async fn close_position(&self, symbol: &str) -> bool {
        if !self.has_position(symbol).await {
            log::info!("{} | no position to close", self.name);
            return true;
        }
        let side = self.role.close_side();

        if let Some(size) = self.position_size(symbol).await.filter(|s| *s > Decimal::ZERO) {
            match self
                .client
                .place_market_order(symbol, side, SizeSpec::Base(size), true)
                .await
            {
                Ok(()) => {
                    log::info!("{} | position closed, size={}", self.name, size);
                    return true;
                }
                Err(err) => {
                    log::error!("{} | close error at size {}: {}", self.name, size, err);
                }
            }
        }

        // Known weakness carried as an explicit config knob: a fixed-size
        // reduce-only attempt when the real size is unavailable.
        let Some(fixed) = self.cfg.fallback_close_size.filter(|s| *s > Decimal::ZERO) else {
            log::error!("{} | could not close position", self.name);
            return false;
        };
        log::warn!(
            "{} | close sizing unavailable, degraded attempt with fixed size {}",
            self.name,
            fixed
        );
        match self
            .client
            .place_market_order(symbol, side, SizeSpec::Base(fixed), true)
            .await
        {
            Ok(()) => {
                log::info!("{} | position closed with fixed size {}", self.name, fixed);
                true
            }
            Err(err) => {
                log::error!("{} | failed to close position: {}", self.name, err);
                false
            }
        }
    }

    /// Withdraws the free balance to `destination`. Idempotent: a balance at
    /// or below the dust threshold reports success without a withdrawal. A
    /// collateral-locked rejection halves the amount (bounded); other failures
    /// retry up to the sweep attempt bound.
    pub async fn sweep(&self, destination: &str) -> bool {
        let balance = self.available_margin().await;
        if balance <= self.cfg.dust_threshold {
            log::info!(
                "{} | balance {} at or below dust threshold, nothing to sweep",
                self.name,
                balance
            );
            return true;
        }

        let mut amount = balance.round_dp_with_strategy(6, RoundingStrategy::ToZero);
        let mut halvings = 0u32;
        let mut failures = 0u32;
        loop {
            match self.client.withdraw(destination, amount).await {
                Ok(()) => {
                    if halvings > 0 {
                        log::info!("{} | swept reduced amount {} to main", self.name, amount);
                    } else {
                        log::info!("{} | swept {} to main", self.name, amount);
                    }
                    return true;
                }
                Err(ExchangeError::CollateralLocked(msg)) => {
                    halvings += 1;
                    if halvings > self.cfg.max_sweep_halvings {
                        log::error!(
                            "{} | sweep gave up after {} halvings: {}",
                            self.name,
                            self.cfg.max_sweep_halvings,
                            msg
                        );
                        return false;
                    }
                    amount = (amount / Decimal::TWO)
                        .round_dp_with_strategy(6, RoundingStrategy::ToZero);
                    if amount <= self.cfg.dust_threshold {
                        log::error!(
                            "{} | sweep amount fell below dust threshold while locked",
                            self.name
                        );
                        return false;
                    }
                    log::info!(
                        "{} | funds locked, retrying sweep with reduced amount {}",
                        self.name,
                        amount
                    );
                }
                Err(err) => {
                    failures += 1;
                    log::warn!(
                        "{} | sweep error (attempt {}/{}): {}",
                        self.name,
                        failures,
                        self.cfg.sweep_attempts,
                        err
                    );
                    if failures >= self.cfg.sweep_attempts {
                        log::error!("{} | failed to sweep after {} attempts", self.name, failures);
                        return false;
                    }
                    sleep(SWEEP_RETRY_WAIT).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::str::FromStr;

    fn dec_s(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn test_cfg() -> Arc<PairConfig> {
        Arc::new(PairConfig {
            symbol: "SOL_USDC_PERP".to_string(),
            leverage: dec!(50),
            initial_deposit: dec!(10),
            min_delay_secs: 0.0,
            max_delay_secs: 0.0,
            check_interval_secs: 0.0,
            retry_attempts: 3,
            dust_threshold: dec!(0.1),
            monitor_timeout_secs: 86400,
            sweep_attempts: 3,
            max_sweep_halvings: 3,
            fallback_price: None,
            fallback_close_size: None,
            cycle_error_cooldown_secs: 0,
            both_failed_wait_secs: 0,
        })
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct PlacedOrder {
        symbol: String,
        side: OrderSide,
        size: SizeSpec,
        reduce_only: bool,
    }

    #[derive(Default)]
    struct StubClient {
        margin: Mutex<Decimal>,
        price: Mutex<Decimal>,
        positions: Mutex<Vec<PositionSnapshot>>,
        fail_positions: Mutex<bool>,
        order_results: Mutex<VecDeque<Result<(), ExchangeError>>>,
        withdraw_results: Mutex<VecDeque<Result<(), ExchangeError>>>,
        orders: Mutex<Vec<PlacedOrder>>,
        withdrawals: Mutex<Vec<(String, Decimal)>>,
    }

    impl StubClient {
        fn with_margin(margin: Decimal) -> Arc<Self> {
            let client = Self::default();
            *client.margin.lock().unwrap() = margin;
            *client.price.lock().unwrap() = dec!(100);
            Arc::new(client)
        }

        fn queue_order_result(&self, result: Result<(), ExchangeError>) {
            self.order_results.lock().unwrap().push_back(result);
        }

        fn queue_withdraw_result(&self, result: Result<(), ExchangeError>) {
            self.withdraw_results.lock().unwrap().push_back(result);
        }

        fn set_position(&self, symbol: &str, size: Decimal) {
            self.positions.lock().unwrap().push(PositionSnapshot {
                symbol: symbol.to_string(),
                size,
                entry_price: Some(dec!(100)),
                mark_price: Some(dec!(101)),
                liquidation_price: Some(dec!(98)),
                unrealized_pnl: Some(dec!(-0.5)),
            });
        }
    }

    #[async_trait]
    impl ExchangeClient for StubClient {
        async fn available_margin(&self) -> Result<Decimal, ExchangeError> {
            Ok(*self.margin.lock().unwrap())
        }

        async fn ticker_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            let price = *self.price.lock().unwrap();
            if price > Decimal::ZERO {
                Ok(price)
            } else {
                Err(ExchangeError::Unavailable("no ticker".to_string()))
            }
        }

        async fn order_book_mid(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Err(ExchangeError::Unavailable("no book".to_string()))
        }

        async fn market_info(&self, _symbol: &str) -> Result<MarketInfo, ExchangeError> {
            Ok(MarketInfo {
                last_price: Some(*self.price.lock().unwrap()),
                quantity_step: dec!(0.01),
            })
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            size: SizeSpec,
            reduce_only: bool,
        ) -> Result<(), ExchangeError> {
            self.orders.lock().unwrap().push(PlacedOrder {
                symbol: symbol.to_string(),
                side,
                size,
                reduce_only,
            });
            self.order_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
            if *self.fail_positions.lock().unwrap() {
                return Err(ExchangeError::Transient("positions down".to_string()));
            }
            Ok(self.positions.lock().unwrap().clone())
        }

        async fn withdraw(
            &self,
            destination: &str,
            amount: Decimal,
        ) -> Result<(), ExchangeError> {
            let scripted = self.withdraw_results.lock().unwrap().pop_front();
            match scripted {
                Some(Err(err)) => Err(err),
                _ => {
                    self.withdrawals
                        .lock()
                        .unwrap()
                        .push((destination.to_string(), amount));
                    let mut margin = self.margin.lock().unwrap();
                    *margin -= amount;
                    Ok(())
                }
            }
        }
    }

    fn agent(role: LegRole, client: Arc<StubClient>) -> AccountAgent {
        AccountAgent::new(
            "acct-1".to_string(),
            "addr-1".to_string(),
            role,
            test_cfg(),
            client,
        )
    }

    #[tokio::test]
    async fn open_position_places_full_margin_quote_order() {
        let client = StubClient::with_margin(dec!(10));
        let agent = agent(LegRole::Long, client.clone());
        let cancel = CancellationToken::new();

        assert!(agent.open_position("SOL_USDC_PERP", &cancel).await);
        let orders = client.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[0].size, SizeSpec::Quote(dec!(500)));
        assert!(!orders[0].reduce_only);
    }

    #[tokio::test]
    async fn open_position_falls_back_to_base_quantity() {
        let client = StubClient::with_margin(dec!(10));
        client.queue_order_result(Err(ExchangeError::Rejected(
            "quote sizing unsupported".to_string(),
        )));
        let agent = agent(LegRole::Short, client.clone());
        let cancel = CancellationToken::new();

        assert!(agent.open_position("SOL_USDC_PERP", &cancel).await);
        let orders = client.orders.lock().unwrap();
        assert_eq!(orders.len(), 2);
        // 10 * 50 / 100 = 5.0 base units, step 0.01
        assert_eq!(orders[1].size, SizeSpec::Base(dec!(5.00)));
        assert_eq!(orders[1].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn open_position_bounded_by_retry_attempts() {
        let client = StubClient::with_margin(dec!(10));
        for _ in 0..6 {
            client.queue_order_result(Err(ExchangeError::Transient("down".to_string())));
        }
        let agent = agent(LegRole::Long, client.clone());
        let cancel = CancellationToken::new();

        assert!(!agent.open_position("SOL_USDC_PERP", &cancel).await);
        // 3 attempts, each with a quote try and a base fallback
        assert_eq!(client.orders.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn open_position_gives_up_without_margin() {
        let client = StubClient::with_margin(Decimal::ZERO);
        let agent = agent(LegRole::Long, client.clone());
        let cancel = CancellationToken::new();

        assert!(!agent.open_position("SOL_USDC_PERP", &cancel).await);
        assert!(client.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn has_position_matches_separator_variants() {
        let client = StubClient::with_margin(dec!(10));
        client.set_position("SOL-USDC-PERP", dec!(3.58));
        let agent = agent(LegRole::Long, client);

        assert!(agent.has_position("SOL_USDC_PERP").await);
    }

    #[tokio::test]
    async fn has_position_treats_query_failure_as_absent() {
        let client = StubClient::with_margin(dec!(10));
        client.set_position("SOL_USDC_PERP", dec!(3.58));
        *client.fail_positions.lock().unwrap() = true;
        let agent = agent(LegRole::Long, client);

        assert!(!agent.has_position("SOL_USDC_PERP").await);
    }

    #[tokio::test]
    async fn close_position_is_noop_without_position() {
        let client = StubClient::with_margin(dec!(10));
        let agent = agent(LegRole::Long, client.clone());

        assert!(agent.close_position("SOL_USDC_PERP").await);
        assert!(client.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_position_issues_reduce_only_at_queried_size() {
        let client = StubClient::with_margin(dec!(10));
        client.set_position("SOL_USDC_PERP", dec!(-3.58));
        let agent = agent(LegRole::Short, client.clone());

        assert!(agent.close_position("SOL_USDC_PERP").await);
        let orders = client.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].size, SizeSpec::Base(dec!(3.58)));
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(orders[0].reduce_only);
    }

    #[tokio::test]
    async fn close_position_degrades_to_fixed_size() {
        let client = StubClient::with_margin(dec!(10));
        client.set_position("SOL_USDC_PERP", dec!(3.58));
        // sized close fails, fixed-size close succeeds
        client.queue_order_result(Err(ExchangeError::Transient("rejected".to_string())));
        let mut cfg = (*test_cfg()).clone();
        cfg.fallback_close_size = Some(dec_s("3.58"));
        let agent = AccountAgent::new(
            "acct-1".to_string(),
            "addr-1".to_string(),
            LegRole::Long,
            Arc::new(cfg),
            client.clone(),
        );

        assert!(agent.close_position("SOL_USDC_PERP").await);
        let orders = client.orders.lock().unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].size, SizeSpec::Base(dec!(3.58)));
        assert!(orders[1].reduce_only);
    }

    #[tokio::test]
    async fn sweep_skips_below_dust_threshold() {
        let client = StubClient::with_margin(dec!(0.05));
        let agent = agent(LegRole::Long, client.clone());

        assert!(agent.sweep("main-addr").await);
        assert!(client.withdrawals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_is_idempotent_after_success() {
        let client = StubClient::with_margin(dec!(9.5));
        let agent = agent(LegRole::Long, client.clone());

        assert!(agent.sweep("main-addr").await);
        assert!(agent.sweep("main-addr").await);
        let withdrawals = client.withdrawals.lock().unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0], ("main-addr".to_string(), dec!(9.5)));
    }

    #[tokio::test]
    async fn sweep_halves_amount_when_collateral_locked() {
        let client = StubClient::with_margin(dec!(8));
        client.queue_withdraw_result(Err(ExchangeError::CollateralLocked(
            "insufficient collateral".to_string(),
        )));
        let agent = agent(LegRole::Short, client.clone());

        assert!(agent.sweep("main-addr").await);
        let withdrawals = client.withdrawals.lock().unwrap();
        assert_eq!(withdrawals.len(), 1);
        assert_eq!(withdrawals[0].1, dec!(4));
    }

    #[tokio::test]
    async fn sweep_gives_up_after_bounded_halvings() {
        let client = StubClient::with_margin(dec!(8));
        for _ in 0..8 {
            client.queue_withdraw_result(Err(ExchangeError::CollateralLocked(
                "locked".to_string(),
            )));
        }
        let agent = agent(LegRole::Short, client.clone());

        assert!(!agent.sweep("main-addr").await);
        assert!(client.withdrawals.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reference_price_uses_configured_fallback_last() {
        let client = StubClient::with_margin(dec!(10));
        *client.price.lock().unwrap() = Decimal::ZERO;
        let mut cfg = (*test_cfg()).clone();
        cfg.fallback_price = Some(dec!(138));
        let agent = AccountAgent::new(
            "acct-1".to_string(),
            "addr-1".to_string(),
            LegRole::Long,
            Arc::new(cfg),
            client,
        );

        assert_eq!(agent.reference_price("SOL_USDC_PERP").await, Some(dec!(138)));
    }
}
