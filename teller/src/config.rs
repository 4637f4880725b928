//! # Configuration
//!
//! Settings load from a TOML file with `TELLER_`-prefixed environment
//! overrides (`TELLER_MDL__NODE_URL=...`), then validate as a whole:
//! every enabled coin needs an endpoint and a parseable positive rate
//! before the process is allowed to come up.

use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::exchange::rate::parse_rate;
use crate::exchange::CoinRate;
use crate::exchange::ExchangeConfig;
use crate::scanner::ScanConfig;
use crate::sender::SenderConfig;
use crate::storage::model::BuyMethod;
use crate::storage::model::CoinType;

/// Top-level settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Bind policy.
    #[serde(default)]
    pub teller: TellerSettings,
    /// HTTP server knobs.
    #[serde(default)]
    pub http: HttpSettings,
    /// Database location.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Hot wallet node.
    pub mdl: MdlSettings,
    /// Bitcoin scanner.
    #[serde(default)]
    pub btc: CoinSettings,
    /// Ethereum scanner.
    #[serde(default)]
    pub eth: CoinSettings,
    /// Skycoin scanner.
    #[serde(default)]
    pub sky: CoinSettings,
    /// Waves scanner.
    #[serde(default)]
    pub waves: CoinSettings,
    /// Waves-hosted MDL asset scanner.
    #[serde(default)]
    pub waves_mdl: CoinSettings,
}

/// Bind policy.
#[derive(Debug, Clone, Deserialize)]
pub struct TellerSettings {
    /// Maximum deposit addresses one MDL address may hold across all
    /// coins; zero means unbounded.
    #[serde(default)]
    pub max_bound_addrs: u32,
    /// Whether new binds are accepted at all.
    #[serde(default = "default_true")]
    pub bind_enabled: bool,
}

impl Default for TellerSettings {
    fn default() -> Self {
        Self {
            max_bound_addrs: 0,
            bind_enabled: true,
        }
    }
}

/// HTTP server knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Per-request timeout, seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Budget for draining connections at shutdown, seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub graceful_shutdown_timeout_secs: u64,
    /// Requests allowed per client IP per window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    /// Rate limit window, seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    /// Trust `X-Forwarded-For` for the client IP. Only enable behind a
    /// proxy that strips the header from the outside.
    #[serde(default)]
    pub behind_proxy: bool,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
            graceful_shutdown_timeout_secs: default_shutdown_timeout(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window(),
            behind_proxy: false,
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Directory of the database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Hot wallet node and payout pacing.
#[derive(Debug, Clone, Deserialize)]
pub struct MdlSettings {
    /// MDL node REST endpoint.
    pub node_url: String,
    /// Wallet id the payouts spend from.
    pub wallet_id: String,
    /// HTTP timeout for wallet calls, seconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// Pause between confirmation polls of a sent payout, seconds.
    #[serde(default = "default_confirmation_wait")]
    pub tx_confirmation_check_wait_secs: u64,
    /// Pause between processor passes over unfinished deposits, seconds.
    #[serde(default = "default_process_interval")]
    pub deposit_process_interval_secs: u64,
    /// First retry interval after a transient send failure, seconds.
    #[serde(default = "default_backoff_initial")]
    pub send_backoff_initial_secs: u64,
    /// Retry interval ceiling, seconds.
    #[serde(default = "default_backoff_ceiling")]
    pub send_backoff_ceiling_secs: u64,
    /// Total retry budget for one send before it is parked, seconds.
    #[serde(default = "default_backoff_budget")]
    pub send_backoff_budget_secs: u64,
}

/// One scanner's settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CoinSettings {
    /// Whether this coin accepts deposits.
    #[serde(default)]
    pub enabled: bool,
    /// Node endpoint.
    #[serde(default)]
    pub rpc_url: String,
    /// RPC username (btcd).
    #[serde(default)]
    pub rpc_user: Option<String>,
    /// RPC password (btcd).
    #[serde(default)]
    pub rpc_password: Option<String>,
    /// Bitcoin network name, used by the BTC address codec.
    #[serde(default = "default_network")]
    pub network: String,
    /// Confirmation depth a block needs before it is scanned.
    #[serde(default = "default_confirmations")]
    pub confirmations_required: u64,
    /// Height scanning starts from on a fresh database.
    #[serde(default)]
    pub initial_scan_height: u64,
    /// Poll pause when the chain has nothing new, seconds.
    #[serde(default = "default_scan_period")]
    pub scan_period_secs: u64,
    /// Newline-delimited deposit address list, merged at startup.
    #[serde(default)]
    pub addresses_file: Option<PathBuf>,
    /// Exchange rate, decimal or `a/b`.
    #[serde(default)]
    pub rate: String,
    /// Payout precision, 0..=6 decimal places of MDL.
    #[serde(default)]
    pub max_decimals: u32,
    /// How binds of this coin are filled.
    #[serde(default = "default_buy_method")]
    pub buy_method: BuyMethod,
    /// Waves asset id, required for the WAVES-MDL scanner.
    #[serde(default)]
    pub asset_id: Option<String>,
}

impl Default for CoinSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: String::new(),
            rpc_user: None,
            rpc_password: None,
            network: default_network(),
            confirmations_required: default_confirmations(),
            initial_scan_height: 0,
            scan_period_secs: default_scan_period(),
            addresses_file: None,
            rate: String::new(),
            max_decimals: 0,
            buy_method: default_buy_method(),
            asset_id: None,
        }
    }
}

impl CoinSettings {
    /// Scan parameters for this coin.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            initial_scan_height: self.initial_scan_height,
            confirmations_required: self.confirmations_required,
            scan_period: Duration::from_secs(self.scan_period_secs),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:7071".parse().expect("hardcoded listen address")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("teller.db")
}

fn default_rpc_timeout() -> u64 {
    10
}

fn default_confirmation_wait() -> u64 {
    5
}

fn default_process_interval() -> u64 {
    10
}

fn default_backoff_initial() -> u64 {
    1
}

fn default_backoff_ceiling() -> u64 {
    10
}

fn default_backoff_budget() -> u64 {
    60
}

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_confirmations() -> u64 {
    1
}

fn default_scan_period() -> u64 {
    10
}

fn default_buy_method() -> BuyMethod {
    BuyMethod::Direct
}

impl Settings {
    /// Load settings from `path` (if given) and the environment, then
    /// validate.
    pub fn new(path: Option<&Path>) -> Result<Self, Error> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TELLER")
                .separator("__")
                .prefix_separator("_"),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The settings of one coin.
    pub fn coin(&self, coin_type: CoinType) -> &CoinSettings {
        match coin_type {
            CoinType::Btc => &self.btc,
            CoinType::Eth => &self.eth,
            CoinType::Sky => &self.sky,
            CoinType::Waves => &self.waves,
            CoinType::WavesMdl => &self.waves_mdl,
        }
    }

    /// The coins with an enabled scanner, in tag order.
    pub fn enabled_coins(&self) -> Vec<CoinType> {
        use strum::IntoEnumIterator as _;
        CoinType::iter()
            .filter(|coin_type| self.coin(*coin_type).enabled)
            .collect()
    }

    /// Exchange engine parameters derived from these settings.
    pub fn exchange_config(&self) -> ExchangeConfig {
        let rates = self
            .enabled_coins()
            .into_iter()
            .map(|coin_type| {
                let coin = self.coin(coin_type);
                (
                    coin_type,
                    CoinRate {
                        rate: coin.rate.clone(),
                        max_decimals: coin.max_decimals,
                    },
                )
            })
            .collect();

        ExchangeConfig {
            rates,
            processor_interval: Duration::from_secs(self.mdl.deposit_process_interval_secs),
            tx_confirmation_check_wait: Duration::from_secs(
                self.mdl.tx_confirmation_check_wait_secs,
            ),
        }
    }

    /// Retry policy for the sender derived from these settings.
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            initial_interval: Duration::from_secs(self.mdl.send_backoff_initial_secs),
            max_interval: Duration::from_secs(self.mdl.send_backoff_ceiling_secs),
            max_elapsed: Duration::from_secs(self.mdl.send_backoff_budget_secs),
            confirm_retry_interval: Duration::from_secs(self.mdl.tx_confirmation_check_wait_secs),
        }
    }

    fn validate(&self) -> Result<(), Error> {
        use strum::IntoEnumIterator as _;

        if self.mdl.node_url.is_empty() {
            return Err(Error::InvalidConfig("mdl.node_url must be set".into()));
        }
        if self.mdl.wallet_id.is_empty() {
            return Err(Error::InvalidConfig("mdl.wallet_id must be set".into()));
        }

        for coin_type in CoinType::iter() {
            let coin = self.coin(coin_type);
            if !coin.enabled {
                continue;
            }
            let section = coin_type.bucket_suffix();

            if coin.rpc_url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "{section}.rpc_url must be set when the scanner is enabled"
                )));
            }
            parse_rate(&coin.rate)?;
            if coin.max_decimals > mdl::amount::MAX_DECIMALS {
                return Err(Error::InvalidMaxDecimals(coin.max_decimals));
            }
            if coin_type == CoinType::WavesMdl && coin.asset_id.is_none() {
                return Err(Error::InvalidConfig(
                    "waves_mdl.asset_id must be set when the scanner is enabled".into(),
                ));
            }
        }

        Ok(())
    }
}
