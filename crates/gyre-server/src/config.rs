//! Server configuration, parsed from a TOML file with environment
//! variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};

use gyre_coordinator::CoordinatorConfig;

/// The only script type the current admission policy accepts.
pub const SCRIPT_TYPE_P2WPKH: &str = "witness_v0_keyhash";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,

    #[serde(default)]
    pub bitcoind: BitcoindSection,

    #[serde(default)]
    pub round: RoundSection,

    #[serde(default)]
    pub policy: PolicySection,
}

/// General coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSection {
    /// Coordinator name; selects the data subdirectory and the Tor key
    /// filename.
    #[serde(default = "default_name")]
    pub name: String,

    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest".
    #[serde(default = "default_network")]
    pub network: String,

    /// TCP listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Data directory (SQLite DB, seed file, Tor keys).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            network: default_network(),
            listen: default_listen(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Bitcoin Core RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoindSection {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default)]
    pub rpc_user: String,

    #[serde(default)]
    pub rpc_password: String,

    /// sat/vB used when the node has no estimate (always on regtest).
    #[serde(default = "default_fallback_fee_rate")]
    pub fallback_fee_rate: u64,
}

impl Default for BitcoindSection {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            fallback_fee_rate: default_fallback_fee_rate(),
        }
    }
}

/// Round parameters and phase timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSection {
    /// Uniform mixed-output value in satoshis.
    #[serde(default = "default_round_amount")]
    pub amount: u64,

    /// Per-input coordinator fee in satoshis.
    #[serde(default = "default_coordinator_fee")]
    pub coordinator_fee: u64,

    /// Seconds between consecutive rounds.
    #[serde(default = "default_round_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_min_remix_peers")]
    pub min_remix_peers: u64,

    #[serde(default = "default_min_new_peers")]
    pub min_new_peers: u64,

    #[serde(default = "default_max_peers")]
    pub max_peers: u64,

    #[serde(default = "default_input_registration_secs")]
    pub input_registration_secs: u64,

    #[serde(default = "default_output_registration_secs")]
    pub output_registration_secs: u64,

    #[serde(default = "default_signing_secs")]
    pub signing_secs: u64,

    #[serde(default = "default_bad_inputs_ban_secs")]
    pub bad_inputs_ban_secs: u64,

    #[serde(default = "default_invalid_signature_ban_secs")]
    pub invalid_signature_ban_secs: u64,
}

impl Default for RoundSection {
    fn default() -> Self {
        Self {
            amount: default_round_amount(),
            coordinator_fee: default_coordinator_fee(),
            interval_secs: default_round_interval(),
            min_remix_peers: default_min_remix_peers(),
            min_new_peers: default_min_new_peers(),
            max_peers: default_max_peers(),
            input_registration_secs: default_input_registration_secs(),
            output_registration_secs: default_output_registration_secs(),
            signing_secs: default_signing_secs(),
            bad_inputs_ban_secs: default_bad_inputs_ban_secs(),
            invalid_signature_ban_secs: default_invalid_signature_ban_secs(),
        }
    }
}

/// Script types enforced at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_script_type")]
    pub input_script_type: String,

    #[serde(default = "default_script_type")]
    pub change_script_type: String,

    #[serde(default = "default_script_type")]
    pub output_script_type: String,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            input_script_type: default_script_type(),
            change_script_type: default_script_type(),
            output_script_type: default_script_type(),
        }
    }
}

fn default_name() -> String {
    "gyre".into()
}

fn default_network() -> String {
    "regtest".into()
}

fn default_listen() -> String {
    "127.0.0.1:5150".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/gyre")
}

fn default_log_level() -> String {
    "info".into()
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:18443".into()
}

fn default_fallback_fee_rate() -> u64 {
    10
}

fn default_round_amount() -> u64 {
    100_000
}

fn default_coordinator_fee() -> u64 {
    500
}

fn default_round_interval() -> u64 {
    600
}

fn default_min_remix_peers() -> u64 {
    1
}

fn default_min_new_peers() -> u64 {
    1
}

fn default_max_peers() -> u64 {
    10
}

fn default_input_registration_secs() -> u64 {
    600
}

fn default_output_registration_secs() -> u64 {
    180
}

fn default_signing_secs() -> u64 {
    180
}

fn default_bad_inputs_ban_secs() -> u64 {
    86_400
}

fn default_invalid_signature_ban_secs() -> u64 {
    604_800
}

fn default_script_type() -> String {
    SCRIPT_TYPE_P2WPKH.into()
}

impl ServerConfig {
    /// Parse a TOML config file; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(toml::from_str("")?);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GYRE_NAME") {
            self.coordinator.name = v;
        }
        if let Ok(v) = std::env::var("GYRE_NETWORK") {
            self.coordinator.network = v;
        }
        if let Ok(v) = std::env::var("GYRE_LISTEN") {
            self.coordinator.listen = v;
        }
        if let Ok(v) = std::env::var("GYRE_DATA_DIR") {
            self.coordinator.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GYRE_LOG_LEVEL") {
            self.coordinator.log_level = v;
        }
        if let Ok(v) = std::env::var("GYRE_BITCOIND_RPC_URL") {
            self.bitcoind.rpc_url = v;
        }
        if let Ok(v) = std::env::var("GYRE_BITCOIND_RPC_USER") {
            self.bitcoind.rpc_user = v;
        }
        if let Ok(v) = std::env::var("GYRE_BITCOIND_RPC_PASSWORD") {
            self.bitcoind.rpc_password = v;
        }
    }

    pub fn network(&self) -> Result<Network> {
        match self.coordinator.network.as_str() {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => bail!("Unknown network '{}'", other),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.coordinator
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.coordinator.listen))
    }

    /// Directory holding this coordinator's database and seed.
    pub fn coordinator_dir(&self) -> PathBuf {
        self.coordinator.data_dir.join(&self.coordinator.name)
    }

    pub fn db_path(&self) -> PathBuf {
        self.coordinator_dir().join("coordinator.db")
    }

    pub fn seed_path(&self) -> PathBuf {
        self.coordinator_dir().join("coordinator.seed")
    }

    /// Where the operator's Tor setup expects the hidden-service key.
    /// Publication itself is outside this process.
    pub fn tor_key_path(&self) -> PathBuf {
        self.coordinator.data_dir.join("torKeys").join(format!(
            "{}_{}_tor_priv_key",
            self.coordinator.name, self.coordinator.network
        ))
    }

    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        Ok(CoordinatorConfig {
            network: self.network()?,
            mix_amount: Amount::from_sat(self.round.amount),
            coordinator_fee: Amount::from_sat(self.round.coordinator_fee),
            min_remix_peers: self.round.min_remix_peers,
            min_new_peers: self.round.min_new_peers,
            max_peers: self.round.max_peers,
            round_interval: Duration::from_secs(self.round.interval_secs),
            input_registration_time: Duration::from_secs(self.round.input_registration_secs),
            output_registration_time: Duration::from_secs(self.round.output_registration_secs),
            signing_time: Duration::from_secs(self.round.signing_secs),
            bad_inputs_ban_duration: Duration::from_secs(self.round.bad_inputs_ban_secs),
            invalid_signature_ban_duration: Duration::from_secs(
                self.round.invalid_signature_ban_secs,
            ),
            fallback_fee_rate: self.bitcoind.fallback_fee_rate,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.network()?;
        self.listen_addr()?;

        for (field, value) in [
            ("input_script_type", &self.policy.input_script_type),
            ("change_script_type", &self.policy.change_script_type),
            ("output_script_type", &self.policy.output_script_type),
        ] {
            if value != SCRIPT_TYPE_P2WPKH {
                bail!(
                    "{} '{}' is unsupported; only {} is accepted",
                    field,
                    value,
                    SCRIPT_TYPE_P2WPKH
                );
            }
        }

        if self.round.max_peers < self.round.min_remix_peers + self.round.min_new_peers {
            bail!(
                "max_peers ({}) is below min_remix_peers + min_new_peers ({})",
                self.round.max_peers,
                self.round.min_remix_peers + self.round.min_new_peers
            );
        }
        if self.round.amount < 1_000 {
            bail!("round amount {} sat is dust-level", self.round.amount);
        }
        if self.bitcoind.fallback_fee_rate == 0 {
            bail!("fallback_fee_rate must be at least 1 sat/vB");
        }
        Ok(())
    }
}
