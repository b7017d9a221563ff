use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::agent::{AccountAgent, LegRole};
use crate::config::PairConfig;
use crate::exchange::ExchangeClient;
use crate::retry::{wait, RetryPolicy};

/// Lifecycle phases of one hedge pair. Cyclic: Cooldown leads back to Idle and
/// the next Depositing; there is no terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    Idle,
    Depositing,
    PreOpenDelay,
    Opening,
    Monitoring,
    Closing,
    PreSweepDelay,
    Sweeping,
    Cooldown,
}

impl fmt::Display for PairPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairPhase::Idle => "Idle",
            PairPhase::Depositing => "Depositing",
            PairPhase::PreOpenDelay => "PreOpenDelay",
            PairPhase::Opening => "Opening",
            PairPhase::Monitoring => "Monitoring",
            PairPhase::Closing => "Closing",
            PairPhase::PreSweepDelay => "PreSweepDelay",
            PairPhase::Sweeping => "Sweeping",
            PairPhase::Cooldown => "Cooldown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorOutcome {
    /// An opened leg is no longer reported: the venue closed it.
    LegGone(LegRole),
    /// Both legs vanished in the same poll. Treated like a detection but
    /// logged as an anomaly.
    BothGone,
    /// The bound on monitoring time expired with both legs still present.
    TimedOut,
    Cancelled,
}

/// Drives the full lifecycle for one pair of opposing sub-accounts, forever.
/// Owns all mutable pair state; nothing is shared across workers. Remote
/// failures never terminate the worker, only cancellation does.
pub struct PairWorker {
    label: String,
    cfg: Arc<PairConfig>,
    short: AccountAgent,
    long: AccountAgent,
    main_client: Arc<dyn ExchangeClient>,
    main_address: String,
    cancel: CancellationToken,
    delay: RetryPolicy,
    phase: PairPhase,
}

impl PairWorker {
    pub fn new(
        cfg: Arc<PairConfig>,
        short: AccountAgent,
        long: AccountAgent,
        main_client: Arc<dyn ExchangeClient>,
        main_address: String,
        cancel: CancellationToken,
    ) -> Self {
        debug_assert_eq!(short.role(), LegRole::Short);
        debug_assert_eq!(long.role(), LegRole::Long);
        let label = format!("{}/{}", short.name(), long.name());
        let delay = RetryPolicy::new(1, cfg.min_delay_secs, cfg.max_delay_secs);
        Self {
            label,
            cfg,
            short,
            long,
            main_client,
            main_address,
            cancel,
            delay,
            phase: PairPhase::Idle,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn phase(&self) -> PairPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: PairPhase) {
        self.phase = phase;
        log::info!("[CYCLE] {} | entering {}", self.label, phase);
    }

    /// Runs lifecycle cycles until cancelled. A failed cycle triggers
    /// best-effort cleanup and a longer cooldown, then the loop continues.
    pub async fn run(mut self) {
        log::info!("[CYCLE] {} | worker started", self.label);
        while !self.cancel.is_cancelled() {
            if let Err(err) = self.run_cycle().await {
                log::error!("[CYCLE] {} | cycle failed: {:?}", self.label, err);
                self.cleanup_after_failure().await;
                let cooldown = Duration::from_secs(self.cfg.cycle_error_cooldown_secs);
                if !wait(cooldown, &self.cancel).await {
                    break;
                }
            }
        }
        log::info!("[CYCLE] {} | worker stopped", self.label);
    }

    /// One full pass of the state machine. Returns early (Ok) on cancellation
    /// or on the fast-fail path when neither leg opened; both restart the
    /// cycle from Depositing.
    pub async fn run_cycle(&mut self) -> Result<()> {
        self.set_phase(PairPhase::Depositing);
        log::info!(
            "[CYCLE] {} | starting new cycle with {} deposits",
            self.label,
            self.cfg.initial_deposit
        );
        self.deposit_to(&self.short).await;
        if !self.delay.pause(&self.cancel).await {
            return Ok(());
        }
        self.deposit_to(&self.long).await;

        self.set_phase(PairPhase::PreOpenDelay);
        if !self.delay.pause(&self.cancel).await {
            return Ok(());
        }

        self.set_phase(PairPhase::Opening);
        let symbol = self.cfg.symbol.clone();
        let (short_opened, long_opened) = tokio::join!(
            self.short.open_position(&symbol, &self.cancel),
            self.long.open_position(&symbol, &self.cancel),
        );
        if !short_opened && !long_opened {
            log::error!(
                "[CYCLE] {} | failed to open either leg, sweeping and restarting",
                self.label
            );
            tokio::join!(
                self.short.sweep(&self.main_address),
                self.long.sweep(&self.main_address),
            );
            wait(
                Duration::from_secs(self.cfg.both_failed_wait_secs),
                &self.cancel,
            )
            .await;
            return Ok(());
        }

        // Let the venue settle before the first existence check; positions are
        // not always visible immediately after a fill.
        if !self.delay.pause(&self.cancel).await {
            return Ok(());
        }

        self.set_phase(PairPhase::Monitoring);
        let outcome = self.monitor(&symbol, short_opened, long_opened).await;
        match outcome {
            MonitorOutcome::LegGone(role) => {
                log::info!(
                    "[MONITOR] {} | {} leg liquidated or closed",
                    self.label,
                    role.label()
                );
            }
            MonitorOutcome::BothGone => {
                log::warn!("[MONITOR] {} | both legs disappeared", self.label);
            }
            MonitorOutcome::TimedOut => {
                log::warn!(
                    "[MONITOR] {} | monitoring window expired with both legs open",
                    self.label
                );
            }
            MonitorOutcome::Cancelled => return Ok(()),
        }

        self.set_phase(PairPhase::Closing);
        tokio::join!(
            close_if_opened(&self.short, &symbol, short_opened),
            close_if_opened(&self.long, &symbol, long_opened),
        );

        self.set_phase(PairPhase::PreSweepDelay);
        if !self.delay.pause(&self.cancel).await {
            return Ok(());
        }

        self.set_phase(PairPhase::Sweeping);
        log::info!("[SWEEP] {} | sweeping funds back to main account", self.label);
        tokio::join!(
            self.short.sweep(&self.main_address),
            self.long.sweep(&self.main_address),
        );

        self.set_phase(PairPhase::Cooldown);
        self.delay.pause(&self.cancel).await;
        self.set_phase(PairPhase::Idle);
        Ok(())
    }

    /// Funds a sub-account from the main account. A failure is logged only:
    /// the subsequent open attempt will fail for lack of margin and the cycle
    /// self-corrects through the both-failed branch.
    async fn deposit_to(&self, agent: &AccountAgent) {
        match self
            .main_client
            .withdraw(agent.address(), self.cfg.initial_deposit)
            .await
        {
            Ok(()) => log::info!(
                "{} | deposited {} from main",
                agent.name(),
                self.cfg.initial_deposit
            ),
            Err(err) => log::error!("{} | deposit error: {}", agent.name(), err),
        }
    }

    /// Polls both legs until one disappears, both disappear, the timeout
    /// expires, or the worker is cancelled. Only legs that were actually
    /// opened count as disappeared.
    async fn monitor(
        &self,
        symbol: &str,
        short_opened: bool,
        long_opened: bool,
    ) -> MonitorOutcome {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.cfg.monitor_timeout_secs);
        let interval = Duration::from_secs_f64(self.cfg.check_interval_secs.max(0.0));
        log::info!(
            "[MONITOR] {} | polling every {:?} (timeout {:?})",
            self.label,
            interval,
            timeout
        );
        loop {
            if self.cancel.is_cancelled() {
                return MonitorOutcome::Cancelled;
            }
            let (short_has, long_has) = tokio::join!(
                self.short.has_position(symbol),
                self.long.has_position(symbol),
            );
            log::debug!(
                "[MONITOR] {} | short={} long={}",
                self.label,
                short_has,
                long_has
            );
            if short_opened && !short_has {
                return MonitorOutcome::LegGone(LegRole::Short);
            }
            if long_opened && !long_has {
                return MonitorOutcome::LegGone(LegRole::Long);
            }
            if !short_has && !long_has {
                return MonitorOutcome::BothGone;
            }
            if started.elapsed() >= timeout {
                return MonitorOutcome::TimedOut;
            }
            if !wait(interval, &self.cancel).await {
                return MonitorOutcome::Cancelled;
            }
        }
    }

    /// Best-effort recovery after a cycle-fatal error: close whatever is still
    /// open, then sweep both accounts. Each step is independently fallible and
    /// only logged.
    async fn cleanup_after_failure(&mut self) {
        let symbol = self.cfg.symbol.clone();
        log::info!("[CYCLE] {} | running failure cleanup", self.label);
        tokio::join!(
            close_if_opened(&self.short, &symbol, true),
            close_if_opened(&self.long, &symbol, true),
        );
        tokio::join!(
            self.short.sweep(&self.main_address),
            self.long.sweep(&self.main_address),
        );
    }
}

async fn close_if_opened(agent: &AccountAgent, symbol: &str, opened: bool) {
    if !opened {
        return;
    }
    if agent.has_position(symbol).await {
        log::info!(
            "{} | closing surviving {} position",
            agent.name(),
            agent.role().label()
        );
        if !agent.close_position(symbol).await {
            log::error!("{} | failed to close surviving position", agent.name());
        }
    }
}
