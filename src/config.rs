use std::{fmt, path::PathBuf, str::FromStr};

use config::{builder::DefaultState, Config, ConfigBuilder, ConfigError, Environment};
use serde::Deserialize;

use crate::input::DistributionMode;

/// Upper bound the relay contract accepts per `distribute` call
pub const RELAY_MAX_RECIPIENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    pub fn passphrase(&self) -> &'static str {
        match self {
            Network::Testnet => "Test SDF Network ; September 2015",
            Network::Mainnet => "Public Global Stellar Network ; September 2015",
        }
    }

    fn default_horizon_url(&self) -> &'static str {
        match self {
            Network::Testnet => "https://horizon-testnet.stellar.org",
            Network::Mainnet => "https://horizon.stellar.org",
        }
    }

    /// Mainnet has no public RPC endpoint, so only testnet gets a default
    fn default_rpc_url(&self) -> Option<&'static str> {
        match self {
            Network::Testnet => Some("https://soroban-testnet.stellar.org"),
            Network::Mainnet => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Testnet => write!(f, "testnet"),
            Network::Mainnet => write!(f, "mainnet"),
        }
    }
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "public" => Ok(Network::Mainnet),
            other => Err(ConfigError::Message(format!(
                "STELLAR_NETWORK must be testnet or mainnet, got '{}'",
                other
            ))),
        }
    }
}

/// Shape of the environment as the `config` crate sees it (keys lowercased)
#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(default = "default_network")]
    stellar_network: String,
    soroban_rpc_url: Option<String>,
    horizon_url: Option<String>,
    distributor_secret: Option<String>,
    relay_contract: Option<String>,
    #[serde(default = "default_relay_method")]
    relay_method: String,
    #[serde(default = "default_mode")]
    distribution_mode: String,
    #[serde(default = "default_batch_size")]
    max_batch_size: usize,
    #[serde(default = "default_base_fee")]
    base_fee: u32,
    #[serde(default = "default_tx_timeout")]
    tx_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    poll_interval_secs: u64,
    #[serde(default = "default_output_dir")]
    output_dir: String,
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_relay_method() -> String {
    "distribute".to_string()
}

fn default_mode() -> String {
    "transfer".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_base_fee() -> u32 {
    100
}

fn default_tx_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    2
}

fn default_output_dir() -> String {
    "logs".to_string()
}

/// Run configuration, resolved once at process start and immutable afterwards
#[derive(Clone)]
pub struct Settings {
    pub network: Network,
    pub rpc_url: String,
    pub horizon_url: String,
    pub distributor_secret: String,
    pub relay_contract: String,
    pub relay_method: String,
    pub mode: DistributionMode,
    pub max_batch_size: usize,
    pub base_fee: u32,
    pub tx_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub output_dir: PathBuf,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("network", &self.network)
            .field("rpc_url", &self.rpc_url)
            .field("horizon_url", &self.horizon_url)
            .field("distributor_secret", &"<redacted>")
            .field("relay_contract", &self.relay_contract)
            .field("relay_method", &self.relay_method)
            .field("mode", &self.mode)
            .field("max_batch_size", &self.max_batch_size)
            .field("base_fee", &self.base_fee)
            .field("tx_timeout_secs", &self.tx_timeout_secs)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("output_dir", &self.output_dir)
            .finish()
    }
}

impl Settings {
    /// Load settings from the process environment (after `.env` has been applied)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder().add_source(Environment::default().try_parsing(true)),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let raw: RawSettings = builder.build()?.try_deserialize()?;
        Self::resolve(raw)
    }

    fn resolve(raw: RawSettings) -> Result<Self, ConfigError> {
        let network = Network::from_str(&raw.stellar_network)?;

        let distributor_secret = raw
            .distributor_secret
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::NotFound("DISTRIBUTOR_SECRET".to_string()))?;

        let relay_contract = raw
            .relay_contract
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::NotFound("RELAY_CONTRACT".to_string()))?;

        let rpc_url = match raw.soroban_rpc_url.filter(|s| !s.trim().is_empty()) {
            Some(url) => url,
            None => network
                .default_rpc_url()
                .map(str::to_string)
                .ok_or_else(|| ConfigError::NotFound("SOROBAN_RPC_URL".to_string()))?,
        };

        let horizon_url = raw
            .horizon_url
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| network.default_horizon_url().to_string());

        let mode = DistributionMode::from_str(&raw.distribution_mode)
            .map_err(ConfigError::Message)?;

        if raw.max_batch_size == 0 || raw.max_batch_size > RELAY_MAX_RECIPIENTS {
            return Err(ConfigError::Message(format!(
                "MAX_BATCH_SIZE must be between 1 and {}, got {}",
                RELAY_MAX_RECIPIENTS, raw.max_batch_size
            )));
        }

        if raw.tx_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "TX_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            network,
            rpc_url: trim_url(&rpc_url),
            horizon_url: trim_url(&horizon_url),
            distributor_secret: distributor_secret.trim().to_string(),
            relay_contract: relay_contract.trim().to_string(),
            relay_method: raw.relay_method,
            mode,
            max_batch_size: raw.max_batch_size,
            base_fee: raw.base_fee,
            tx_timeout_secs: raw.tx_timeout_secs,
            poll_interval_secs: raw.poll_interval_secs.max(1),
            output_dir: PathBuf::from(raw.output_dir),
        })
    }
}

fn trim_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
