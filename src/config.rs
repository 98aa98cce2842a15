//! Configuração do nó carregada a partir de `cognode.toml`.
//!
//! Todo campo tem default, então o arquivo só precisa dos endereços
//! específicos da implantação. As variáveis `COGNODE_VAULT_PASSPHRASE` e
//! `COGNODE_RPC_URL` têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy_primitives::Address;
use anyhow::Result;
use serde::Deserialize;

use crate::error::NodeError;

pub const DEFAULT_PATH: &str = "cognode.toml";
pub const ENV_PASSPHRASE: &str = "COGNODE_VAULT_PASSPHRASE";
pub const ENV_RPC_URL: &str = "COGNODE_RPC_URL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeConfig {
    /// Rejeita transições do ledger ausentes das tabelas locais em vez de
    /// registrá-las no log e descartá-las.
    #[serde(default)]
    pub strict_transitions: bool,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub vault: VaultConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub content: ContentConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Como as mudanças de estado dos jobs são publicadas no ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobProtocol {
    /// One contract per job emitting `StateChanged`.
    #[default]
    JobContract,
    /// A shared controller emitting `JobStateChanged` keyed by job id.
    JobController,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Obtido do nó quando ausente.
    #[serde(default)]
    pub chain_id: Option<u64>,

    #[serde(default)]
    pub worker_contract: Address,

    #[serde(default)]
    pub market_contract: Address,

    #[serde(default)]
    pub job_protocol: JobProtocol,

    #[serde(default)]
    pub job_controller: Option<Address>,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            chain_id: None,
            worker_contract: Address::ZERO,
            market_contract: Address::ZERO,
            job_protocol: JobProtocol::default(),
            job_controller: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_path")]
    pub path: PathBuf,

    /// Conta que o vault deve conter; também é o remetente de toda
    /// transação.
    #[serde(default)]
    pub account: Address,

    #[serde(default)]
    pub passphrase: String,
}

fn default_vault_path() -> PathBuf {
    PathBuf::from("cognode.vault")
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: default_vault_path(),
            account: Address::ZERO,
            passphrase: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Intervalo de polling enquanto nenhum bloco novo foi observado.
    #[serde(default = "default_fallback_interval_ms")]
    pub fallback_interval_ms: u64,

    /// Subtracted from the measured block time so polls land just after a block.
    #[serde(default = "default_slack_ms")]
    pub slack_ms: u64,

    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// A filter not polled successfully for this long is recreated.
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,

    /// How far behind the last seen block a recreated filter starts.
    #[serde(default = "default_rewind_blocks")]
    pub rewind_blocks: u64,
}

fn default_fallback_interval_ms() -> u64 {
    5_000
}

fn default_slack_ms() -> u64 {
    500
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_idle_threshold_secs() -> u64 {
    60
}

fn default_rewind_blocks() -> u64 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fallback_interval_ms: default_fallback_interval_ms(),
            slack_ms: default_slack_ms(),
            min_interval_ms: default_min_interval_ms(),
            idle_threshold_secs: default_idle_threshold_secs(),
            rewind_blocks: default_rewind_blocks(),
        }
    }
}

impl SyncConfig {
    pub fn fallback_interval(&self) -> Duration {
        Duration::from_millis(self.fallback_interval_ms)
    }

    pub fn slack(&self) -> Duration {
        Duration::from_millis(self.slack_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Multiplier applied to the node's gas price, in percent.
    #[serde(default = "default_gas_price_percent")]
    pub gas_price_percent: u64,

    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,

    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,

    /// Atraso base para backoff exponencial entre tentativas de envio.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_gas_price_percent() -> u64 {
    150
}

fn default_receipt_timeout_secs() -> u64 {
    300
}

fn default_receipt_poll_ms() -> u64 {
    2_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            gas_price_percent: default_gas_price_percent(),
            receipt_timeout_secs: default_receipt_timeout_secs(),
            receipt_poll_ms: default_receipt_poll_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }

    /// delay = base_delay_ms * 2^(attempt - 1), capped at `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_ipfs_url")]
    pub ipfs_url: String,

    /// Downloads e a saída do pipeline ficam aqui.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_ipfs_url() -> String {
    "http://127.0.0.1:5001".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("cognode-data")
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            ipfs_url: default_ipfs_url(),
            work_dir: default_work_dir(),
        }
    }
}

/// External programs that do the actual learning work.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Program and arguments for data validation.
    #[serde(default)]
    pub validate_command: Vec<String>,

    #[serde(default)]
    pub compute_command: Vec<String>,
}

impl NodeConfig {
    /// Carrega `path`, usando os defaults se o arquivo não existir, e
    /// aplica as variáveis de ambiente por cima.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<NodeConfig>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(passphrase) = lookup(ENV_PASSPHRASE)
            && !passphrase.is_empty()
        {
            self.vault.passphrase = passphrase;
        }
        if let Some(url) = lookup(ENV_RPC_URL)
            && !url.is_empty()
        {
            self.ledger.rpc_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        let invalid = |msg: &str| Err(NodeError::Config(msg.to_string()));
        if self.ledger.worker_contract.is_zero() {
            return invalid("ledger.worker_contract is not set");
        }
        if self.ledger.market_contract.is_zero() {
            return invalid("ledger.market_contract is not set");
        }
        if self.vault.account.is_zero() {
            return invalid("vault.account is not set");
        }
        if self.ledger.job_protocol == JobProtocol::JobController
            && self.ledger.job_controller.is_none_or(|a| a.is_zero())
        {
            return invalid("ledger.job_controller is required by the job-controller protocol");
        }
        if self.broker.gas_price_percent < 100 {
            return invalid("broker.gas_price_percent must be at least 100");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [ledger]
        worker_contract = "0x1111111111111111111111111111111111111111"
        market_contract = "0x2222222222222222222222222222222222222222"

        [vault]
        account = "0x3333333333333333333333333333333333333333"
    "#;

    #[test]
    fn default_config_values() {
        let config = NodeConfig::default();
        assert!(!config.strict_transitions);
        assert_eq!(config.ledger.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(config.ledger.job_protocol, JobProtocol::JobContract);
        assert_eq!(config.broker.gas_price_percent, 150);
        assert_eq!(config.broker.receipt_timeout(), Duration::from_secs(300));
        assert_eq!(config.sync.fallback_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.idle_threshold(), Duration::from_secs(60));
        assert_eq!(config.sync.rewind_blocks, 2);
    }

    #[test]
    fn deserialize_partial_toml() {
        let config: NodeConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.ledger.worker_contract, Address::repeat_byte(0x11));
        assert_eq!(config.vault.account, Address::repeat_byte(0x33));
        assert_eq!(config.broker.receipt_poll_ms, 2_000);
        config.validate().unwrap();
    }

    #[test]
    fn controller_protocol_needs_an_address() {
        let mut config: NodeConfig = toml::from_str(MINIMAL).unwrap();
        config.ledger.job_protocol = JobProtocol::JobController;
        assert!(matches!(config.validate(), Err(NodeError::Config(_))));

        config.ledger.job_controller = Some(Address::repeat_byte(0x44));
        config.validate().unwrap();
    }

    #[test]
    fn protocol_names_are_kebab_case() {
        let config: NodeConfig = toml::from_str(
            r#"
            [ledger]
            job_protocol = "job-controller"
            job_controller = "0x4444444444444444444444444444444444444444"
        "#,
        )
        .unwrap();
        assert_eq!(config.ledger.job_protocol, JobProtocol::JobController);
    }

    #[test]
    fn missing_addresses_are_rejected() {
        assert!(NodeConfig::default().validate().is_err());
    }

    #[test]
    fn environment_takes_precedence() {
        let mut config: NodeConfig = toml::from_str(MINIMAL).unwrap();
        config.apply_env(|key| match key {
            ENV_PASSPHRASE => Some("hunter2".into()),
            ENV_RPC_URL => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.vault.passphrase, "hunter2");
        assert_eq!(config.ledger.rpc_url, "http://127.0.0.1:8545");
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let broker = BrokerConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            ..BrokerConfig::default()
        };
        assert_eq!(broker.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(broker.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(broker.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(broker.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(broker.delay_for_attempt(200), Duration::from_secs(5));
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.ledger.market_contract, Address::repeat_byte(0x22));
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.broker.gas_price_percent, 150);
    }
}
