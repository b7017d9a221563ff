use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_SYMBOL: &str = "SOL_USDC_PERP";
const DEFAULT_LEVERAGE: u32 = 50;
const DEFAULT_MIN_DELAY_SECS: f64 = 1.0;
const DEFAULT_MAX_DELAY_SECS: f64 = 15.0;
const DEFAULT_CHECK_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_RETRY_ATTEMPTS: u32 = 8;
const DEFAULT_PAIR_START_DELAY_MAX_SECS: f64 = 60.0;
const DEFAULT_MONITOR_TIMEOUT_SECS: u64 = 3600 * 24;
const DEFAULT_SWEEP_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_SWEEP_HALVINGS: u32 = 3;
const DEFAULT_CYCLE_ERROR_COOLDOWN_SECS: u64 = 10;
const DEFAULT_BOTH_FAILED_WAIT_SECS: u64 = 3;

fn default_dust_threshold() -> Decimal {
    Decimal::new(1, 1) // 0.1 quote units
}

fn default_initial_deposit() -> Decimal {
    Decimal::new(10, 0)
}

/// One sub-account (or the main account): identity, deposit destination and
/// API credentials. Immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub address: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Pair-wide tunables, shared read-only by both agents of a pair.
#[derive(Debug, Clone)]
pub struct PairConfig {
    pub symbol: String,
    pub leverage: Decimal,
    pub initial_deposit: Decimal,
    pub min_delay_secs: f64,
    pub max_delay_secs: f64,
    pub check_interval_secs: f64,
    pub retry_attempts: u32,
    pub dust_threshold: Decimal,
    pub monitor_timeout_secs: u64,
    pub sweep_attempts: u32,
    pub max_sweep_halvings: u32,
    /// Last rung of the price fallback chain. None disables the rung.
    pub fallback_price: Option<Decimal>,
    /// Degraded-mode close size used only when the open size cannot be
    /// queried. None disables the fallback attempt.
    pub fallback_close_size: Option<Decimal>,
    pub cycle_error_cooldown_secs: u64,
    pub both_failed_wait_secs: u64,
}

/// The two sub-accounts making up one hedge pair.
#[derive(Debug, Clone)]
pub struct PairAccounts {
    pub short: AccountConfig,
    pub long: AccountConfig,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub dry_run: bool,
    pub main_account: AccountConfig,
    pub pair: Arc<PairConfig>,
    pub pairs: Vec<PairAccounts>,
    pub pair_start_delay_max_secs: f64,
}

#[derive(Debug, Deserialize)]
struct ActionDelayYaml {
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MainAccountYaml {
    name: Option<String>,
    address: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct PairYaml {
    short_account: Option<AccountConfig>,
    long_account: Option<AccountConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BotYaml {
    dry_run: Option<bool>,
    symbol: Option<String>,
    leverage: Option<u32>,
    initial_deposit: Option<Decimal>,
    action_delay: Option<ActionDelayYaml>,
    check_interval: Option<f64>,
    retry_attempts: Option<u32>,
    pair_start_delay_max: Option<f64>,
    dust_threshold: Option<Decimal>,
    monitor_timeout_secs: Option<u64>,
    sweep_attempts: Option<u32>,
    max_sweep_halvings: Option<u32>,
    fallback_price: Option<Decimal>,
    fallback_close_size: Option<Decimal>,
    cycle_error_cooldown_secs: Option<u64>,
    main_account: MainAccountYaml,
    pairs: Vec<PairYaml>,
}

impl BotConfig {
    /// Reads the YAML path from HEDGEBOT_CONFIG (fallback CONFIG_PATH),
    /// defaulting to ./config.yaml.
    pub fn load() -> Result<Self> {
        let path = env::var("HEDGEBOT_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| {
                env::var("CONFIG_PATH")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            })
            .unwrap_or_else(|| "config.yaml".to_string());
        Self::from_yaml_path(path)
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: BotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;
        Self::from_yaml(yaml)
    }

    fn from_yaml(yaml: BotYaml) -> Result<Self> {
        if yaml.main_account.address.trim().is_empty() {
            bail!("main account address not configured");
        }

        let min_delay_secs = yaml
            .action_delay
            .as_ref()
            .and_then(|d| d.min)
            .unwrap_or(DEFAULT_MIN_DELAY_SECS);
        let max_delay_secs = yaml
            .action_delay
            .as_ref()
            .and_then(|d| d.max)
            .unwrap_or(min_delay_secs.max(DEFAULT_MAX_DELAY_SECS));
        if max_delay_secs < min_delay_secs {
            bail!(
                "action_delay.max ({}) must be >= action_delay.min ({})",
                max_delay_secs,
                min_delay_secs
            );
        }

        let leverage = Decimal::from(yaml.leverage.unwrap_or(DEFAULT_LEVERAGE));
        if leverage <= Decimal::ZERO {
            bail!("leverage must be positive");
        }
        let initial_deposit = yaml.initial_deposit.unwrap_or_else(default_initial_deposit);
        if initial_deposit <= Decimal::ZERO {
            bail!("initial_deposit must be positive");
        }

        let pair = PairConfig {
            symbol: yaml.symbol.unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
            leverage,
            initial_deposit,
            min_delay_secs,
            max_delay_secs,
            check_interval_secs: yaml.check_interval.unwrap_or(DEFAULT_CHECK_INTERVAL_SECS),
            retry_attempts: yaml.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            dust_threshold: yaml.dust_threshold.unwrap_or_else(default_dust_threshold),
            monitor_timeout_secs: yaml
                .monitor_timeout_secs
                .unwrap_or(DEFAULT_MONITOR_TIMEOUT_SECS),
            sweep_attempts: yaml.sweep_attempts.unwrap_or(DEFAULT_SWEEP_ATTEMPTS),
            max_sweep_halvings: yaml
                .max_sweep_halvings
                .unwrap_or(DEFAULT_MAX_SWEEP_HALVINGS),
            fallback_price: yaml.fallback_price,
            fallback_close_size: yaml.fallback_close_size,
            cycle_error_cooldown_secs: yaml
                .cycle_error_cooldown_secs
                .unwrap_or(DEFAULT_CYCLE_ERROR_COOLDOWN_SECS),
            both_failed_wait_secs: DEFAULT_BOTH_FAILED_WAIT_SECS,
        };

        let mut pairs = Vec::new();
        for entry in yaml.pairs {
            match (entry.short_account, entry.long_account) {
                (Some(short), Some(long)) => pairs.push(PairAccounts { short, long }),
                _ => log::warn!("skipping pair with missing account configuration"),
            }
        }
        if pairs.is_empty() {
            bail!("no complete trading pairs configured");
        }

        let main_account = AccountConfig {
            name: yaml.main_account.name.unwrap_or_else(|| "main".to_string()),
            address: yaml.main_account.address,
            api_key: yaml.main_account.api_key,
            api_secret: yaml.main_account.api_secret,
        };

        Ok(BotConfig {
            dry_run: yaml.dry_run.unwrap_or(true),
            main_account,
            pair: Arc::new(pair),
            pairs,
            pair_start_delay_max_secs: yaml
                .pair_start_delay_max
                .unwrap_or(DEFAULT_PAIR_START_DELAY_MAX_SECS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
main_account:
  address: "main-addr"
  api_key: "k"
  api_secret: "s"
pairs:
  - short_account: { name: "s1", address: "a1", api_key: "k1", api_secret: "x1" }
    long_account:  { name: "l1", address: "a2", api_key: "k2", api_secret: "x2" }
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let file = write_config(MINIMAL);
        let cfg = BotConfig::from_yaml_path(file.path()).unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.pair.symbol, "SOL_USDC_PERP");
        assert_eq!(cfg.pair.retry_attempts, 8);
        assert_eq!(cfg.pair.monitor_timeout_secs, 86400);
        assert_eq!(cfg.pair.dust_threshold, Decimal::new(1, 1));
        assert_eq!(cfg.pairs.len(), 1);
        assert_eq!(cfg.main_account.name, "main");
        assert!(cfg.pair.fallback_close_size.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let file = write_config(
            r#"
dry_run: false
symbol: ETH_USDC_PERP
leverage: 20
initial_deposit: 25
action_delay: { min: 0.5, max: 2.5 }
check_interval: 3
retry_attempts: 4
fallback_close_size: 3.58
main_account: { address: "m", api_key: "k", api_secret: "s" }
pairs:
  - short_account: { name: "s", address: "a", api_key: "k", api_secret: "x" }
    long_account:  { name: "l", address: "b", api_key: "k", api_secret: "x" }
"#,
        );
        let cfg = BotConfig::from_yaml_path(file.path()).unwrap();
        assert!(!cfg.dry_run);
        assert_eq!(cfg.pair.symbol, "ETH_USDC_PERP");
        assert_eq!(cfg.pair.leverage, Decimal::from(20));
        assert_eq!(cfg.pair.min_delay_secs, 0.5);
        assert_eq!(cfg.pair.max_delay_secs, 2.5);
        assert_eq!(cfg.pair.retry_attempts, 4);
        assert_eq!(cfg.pair.fallback_close_size, Some(Decimal::new(358, 2)));
    }

    #[test]
    fn missing_pairs_is_an_error() {
        let file = write_config(
            r#"
main_account: { address: "m", api_key: "k", api_secret: "s" }
pairs: []
"#,
        );
        assert!(BotConfig::from_yaml_path(file.path()).is_err());
    }

    #[test]
    fn incomplete_pair_is_skipped() {
        let file = write_config(
            r#"
main_account: { address: "m", api_key: "k", api_secret: "s" }
pairs:
  - short_account: { name: "s", address: "a", api_key: "k", api_secret: "x" }
  - short_account: { name: "s2", address: "c", api_key: "k", api_secret: "x" }
    long_account:  { name: "l2", address: "d", api_key: "k", api_secret: "x" }
"#,
        );
        let cfg = BotConfig::from_yaml_path(file.path()).unwrap();
        assert_eq!(cfg.pairs.len(), 1);
        assert_eq!(cfg.pairs[0].short.name, "s2");
    }

    #[test]
    fn inverted_delay_window_is_rejected() {
        let file = write_config(
            r#"
action_delay: { min: 5.0, max: 1.0 }
main_account: { address: "m", api_key: "k", api_secret: "s" }
pairs:
  - short_account: { name: "s", address: "a", api_key: "k", api_secret: "x" }
    long_account:  { name: "l", address: "b", api_key: "k", api_secret: "x" }
"#,
        );
        assert!(BotConfig::from_yaml_path(file.path()).is_err());
    }
}
