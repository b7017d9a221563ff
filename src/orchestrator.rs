use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::agent::{AccountAgent, LegRole};
use crate::config::{AccountConfig, BotConfig};
use crate::exchange::ExchangeClient;
use crate::retry::wait;
use crate::worker::PairWorker;

/// Builds one venue client per account. Implementations decide what backs the
/// client (simulated venue, live adapter); the core only sees the trait.
pub trait ClientFactory: Send + Sync {
    fn client(&self, account: &AccountConfig) -> Result<Arc<dyn ExchangeClient>>;
}

impl<F> ClientFactory for F
where
    F: Fn(&AccountConfig) -> Result<Arc<dyn ExchangeClient>> + Send + Sync,
{
    fn client(&self, account: &AccountConfig) -> Result<Arc<dyn ExchangeClient>> {
        self(account)
    }
}

/// Spawns one independent worker task per configured pair, each after a
/// randomized startup stagger so pairs never burst against the venue in
/// lockstep, then waits for all of them. Workers are never restarted from
/// here: each one absorbs its own cycle failures.
pub struct Orchestrator {
    cfg: BotConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(cfg: BotConfig, cancel: CancellationToken) -> Self {
        Self { cfg, cancel }
    }

    pub async fn run(self, factory: &dyn ClientFactory) -> Result<()> {
        let main_client = factory
            .client(&self.cfg.main_account)
            .context("failed to build main account client")?;

        let mut handles = Vec::new();
        for pair in &self.cfg.pairs {
            let short_client = factory
                .client(&pair.short)
                .with_context(|| format!("failed to build client for {}", pair.short.name))?;
            let long_client = factory
                .client(&pair.long)
                .with_context(|| format!("failed to build client for {}", pair.long.name))?;

            let short = AccountAgent::new(
                pair.short.name.clone(),
                pair.short.address.clone(),
                LegRole::Short,
                self.cfg.pair.clone(),
                short_client,
            );
            let long = AccountAgent::new(
                pair.long.name.clone(),
                pair.long.address.clone(),
                LegRole::Long,
                self.cfg.pair.clone(),
                long_client,
            );
            let worker = PairWorker::new(
                self.cfg.pair.clone(),
                short,
                long,
                main_client.clone(),
                self.cfg.main_account.address.clone(),
                self.cancel.child_token(),
            );

            let stagger = Duration::from_secs_f64(
                rand::thread_rng().gen_range(0.0..=self.cfg.pair_start_delay_max_secs.max(0.0)),
            );
            log::info!(
                "started worker for {} with {:.1}s initial stagger",
                worker.label(),
                stagger.as_secs_f64()
            );
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                if wait(stagger, &cancel).await {
                    worker.run().await;
                }
            }));
        }

        log::info!("running {} pair worker(s)", handles.len());
        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("worker task join error: {:?}", err);
            }
        }
        Ok(())
    }
}
