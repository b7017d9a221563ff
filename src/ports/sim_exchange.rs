use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::exchange::{
    ExchangeClient, ExchangeError, MarketInfo, OrderSide, PositionSnapshot, SizeSpec,
};

/// In-memory stand-in for the remote venue, used in dry-run mode and in
/// worker tests. One `SimVenue` holds every account's state so withdrawals
/// between registered addresses actually move balance; each account gets its
/// own `ExchangeClient` view via [`SimVenue::client`].
///
/// Liquidation is modelled as a scripted knob: after N position polls the
/// account's position disappears and its collateral is gone.
pub struct SimVenue {
    price: Decimal,
    accounts: Mutex<HashMap<String, SimAccount>>,
}

#[derive(Debug, Clone)]
pub struct SimOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub size: SizeSpec,
    pub reduce_only: bool,
}

#[derive(Default)]
struct SimAccount {
    balance: Decimal,
    collateral: Decimal,
    position: Option<PositionSnapshot>,
    position_polls: u32,
    liquidate_after: Option<u32>,
    reject_orders: bool,
    locked_withdrawals: u32,
    orders: Vec<SimOrder>,
    withdrawals: Vec<(String, Decimal)>,
}

impl SimVenue {
    pub fn new(price: Decimal) -> Arc<Self> {
        Arc::new(Self {
            price,
            accounts: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>, address: &str, balance: Decimal) {
        let mut accounts = self.accounts.lock().unwrap();
        accounts.insert(
            address.to_string(),
            SimAccount {
                balance,
                ..SimAccount::default()
            },
        );
    }

    pub fn client(self: &Arc<Self>, address: &str) -> Arc<SimExchangeClient> {
        Arc::new(SimExchangeClient {
            venue: self.clone(),
            address: address.to_string(),
        })
    }

    /// Removes the account's position (and its collateral) once it has been
    /// polled `polls` times.
    pub fn liquidate_after_polls(self: &Arc<Self>, address: &str, polls: u32) {
        self.with_account(address, |acct| acct.liquidate_after = Some(polls));
    }

    /// Randomized variant for dry runs: one leg of a pair will hit its
    /// threshold before the other, so cycles complete organically.
    pub fn liquidate_after_random_polls(self: &Arc<Self>, address: &str, min: u32, max: u32) {
        let polls = rand::thread_rng().gen_range(min..=max.max(min));
        self.liquidate_after_polls(address, polls);
    }

    pub fn reject_orders(self: &Arc<Self>, address: &str) {
        self.with_account(address, |acct| acct.reject_orders = true);
    }

    /// The next `count` withdrawals from this account fail collateral-locked.
    pub fn fail_withdrawals_locked(self: &Arc<Self>, address: &str, count: u32) {
        self.with_account(address, |acct| acct.locked_withdrawals = count);
    }

    pub fn balance(self: &Arc<Self>, address: &str) -> Decimal {
        self.with_account(address, |acct| acct.balance)
    }

    pub fn orders(self: &Arc<Self>, address: &str) -> Vec<SimOrder> {
        self.with_account(address, |acct| acct.orders.clone())
    }

    pub fn withdrawals(self: &Arc<Self>, address: &str) -> Vec<(String, Decimal)> {
        self.with_account(address, |acct| acct.withdrawals.clone())
    }

    pub fn position_polls(self: &Arc<Self>, address: &str) -> u32 {
        self.with_account(address, |acct| acct.position_polls)
    }

    fn with_account<T>(&self, address: &str, f: impl FnOnce(&mut SimAccount) -> T) -> T {
        let mut accounts = self.accounts.lock().unwrap();
        let acct = accounts
            .entry(address.to_string())
            .or_insert_with(SimAccount::default);
        f(acct)
    }
}

/// One account's view of the venue.
pub struct SimExchangeClient {
    venue: Arc<SimVenue>,
    address: String,
}

#[async_trait]
impl ExchangeClient for SimExchangeClient {
    async fn available_margin(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.venue.with_account(&self.address, |acct| acct.balance))
    }

    async fn ticker_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.venue.price)
    }

    async fn order_book_mid(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.venue.price)
    }

    async fn market_info(&self, _symbol: &str) -> Result<MarketInfo, ExchangeError> {
        Ok(MarketInfo {
            last_price: Some(self.venue.price),
            quantity_step: Decimal::new(1, 2),
        })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        size: SizeSpec,
        reduce_only: bool,
    ) -> Result<(), ExchangeError> {
        let price = self.venue.price;
        self.venue.with_account(&self.address, |acct| {
            if acct.reject_orders {
                return Err(ExchangeError::Rejected("orders disabled".to_string()));
            }
            if reduce_only {
                if acct.position.is_none() {
                    return Err(ExchangeError::Rejected("no position to reduce".to_string()));
                }
                acct.position = None;
                acct.balance += acct.collateral;
                acct.collateral = Decimal::ZERO;
            } else {
                if acct.balance <= Decimal::ZERO {
                    return Err(ExchangeError::Rejected("insufficient margin".to_string()));
                }
                let base = match size {
                    SizeSpec::Quote(quote) => quote / price,
                    SizeSpec::Base(base) => base,
                };
                let signed = match side {
                    OrderSide::Buy => base,
                    OrderSide::Sell => -base,
                };
                acct.position = Some(PositionSnapshot {
                    symbol: symbol.to_string(),
                    size: signed,
                    entry_price: Some(price),
                    mark_price: Some(price),
                    liquidation_price: Some(price),
                    unrealized_pnl: Some(Decimal::ZERO),
                });
                acct.collateral = acct.balance;
                acct.balance = Decimal::ZERO;
            }
            acct.orders.push(SimOrder {
                symbol: symbol.to_string(),
                side,
                size,
                reduce_only,
            });
            Ok(())
        })
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        Ok(self.venue.with_account(&self.address, |acct| {
            acct.position_polls += 1;
            if let Some(threshold) = acct.liquidate_after {
                if acct.position_polls >= threshold && acct.position.is_some() {
                    acct.position = None;
                    acct.collateral = Decimal::ZERO;
                }
            }
            acct.position.clone().into_iter().collect()
        }))
    }

    async fn withdraw(&self, destination: &str, amount: Decimal) -> Result<(), ExchangeError> {
        let mut accounts = self.venue.accounts.lock().unwrap();
        let acct = accounts
            .entry(self.address.clone())
            .or_insert_with(SimAccount::default);
        if acct.locked_withdrawals > 0 {
            acct.locked_withdrawals -= 1;
            return Err(ExchangeError::CollateralLocked(
                "funds collateralize an open position".to_string(),
            ));
        }
        if amount > acct.balance {
            return Err(ExchangeError::Rejected(format!(
                "withdrawal {} exceeds balance {}",
                amount, acct.balance
            )));
        }
        acct.balance -= amount;
        acct.withdrawals.push((destination.to_string(), amount));
        if let Some(dest) = accounts.get_mut(destination) {
            dest.balance += amount;
        }
        Ok(())
    }
}
