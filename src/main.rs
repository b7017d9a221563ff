use anyhow::{bail, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use hedgebot::config::{AccountConfig, BotConfig};
use hedgebot::exchange::ExchangeClient;
use hedgebot::orchestrator::Orchestrator;
use hedgebot::ports::sim_exchange::SimVenue;
use log::LevelFilter;
use rust_decimal::Decimal;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Dry-run liquidation pacing: one leg of each pair disappears somewhere in
// this poll window.
const SIM_LIQUIDATION_MIN_POLLS: u32 = 3;
const SIM_LIQUIDATION_MAX_POLLS: u32 = 12;

fn sim_main_balance() -> Decimal {
    Decimal::new(100_000, 0)
}

fn sim_price() -> Decimal {
    Decimal::new(138, 0)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();

    let cfg = BotConfig::load()?;
    log::info!(
        "starting hedgebot v{} with {} pair(s) on {} (dry_run={})",
        env!("CARGO_PKG_VERSION"),
        cfg.pairs.len(),
        cfg.pair.symbol,
        cfg.dry_run
    );

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received, draining workers...");
            ctrl_c_cancel.cancel();
        }
    });

    if cfg.dry_run {
        let venue = SimVenue::new(sim_price());
        venue.register(&cfg.main_account.address, sim_main_balance());
        let main_address = cfg.main_account.address.clone();
        let factory = move |account: &AccountConfig| -> Result<Arc<dyn ExchangeClient>> {
            if account.address != main_address {
                venue.register(&account.address, Decimal::ZERO);
                venue.liquidate_after_random_polls(
                    &account.address,
                    SIM_LIQUIDATION_MIN_POLLS,
                    SIM_LIQUIDATION_MAX_POLLS,
                );
            }
            Ok(venue.client(&account.address))
        };
        Orchestrator::new(cfg, cancel).run(&factory).await
    } else {
        // Live adapters plug in here; none is compiled into this build.
        bail!("no live exchange adapter configured; set dry_run: true");
    }
}
