use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::ledger::AccountType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    /// PostgreSQL connection URL for the ledger store
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file() -> String {
    "transfer-engine.log".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_file: default_log_file(),
            use_json: false,
            rotation: default_rotation(),
            postgres_url: None,
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            transfer: TransferConfig::default(),
            outbox: OutboxConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Per-account-type ceiling for a single transfer
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransferLimits {
    pub checking: Decimal,
    pub savings: Decimal,
    pub business: Decimal,
    pub vip: Decimal,
}

impl TransferLimits {
    pub fn for_account_type(&self, account_type: AccountType) -> Decimal {
        match account_type {
            AccountType::Checking => self.checking,
            AccountType::Savings => self.savings,
            AccountType::Business => self.business,
            AccountType::Vip => self.vip,
        }
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            checking: Decimal::new(100_000_00, 2),
            savings: Decimal::new(100_000_00, 2),
            business: Decimal::new(500_000_00, 2),
            vip: Decimal::new(1_000_000_00, 2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub supported_currencies: Vec<String>,
    pub max_transfer_amount: Decimal,
    /// Maximum decimal places accepted for an amount
    pub amount_scale: u32,
    pub limits: TransferLimits,
    /// Machine id embedded in generated transaction ids
    pub machine_id: u8,
    pub lock_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            supported_currencies: vec!["ILS".to_string()],
            max_transfer_amount: Decimal::new(10_000_000_00, 2),
            amount_scale: 2,
            limits: TransferLimits::default(),
            machine_id: 1,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Exponential backoff parameters shared by the publisher and consumer
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    /// Fraction of the computed delay used as +/- jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OutboxConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub backoff: BackoffConfig,
    pub topic: String,
    pub failed_topic: String,
    /// Published rows older than this are moved to the archive table
    pub archive_retention_secs: Option<u64>,
    pub archive_interval_secs: u64,
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 500,
            backoff: BackoffConfig::default(),
            topic: "completedTransactions".to_string(),
            failed_topic: "failedTransactions".to_string(),
            archive_retention_secs: None,
            archive_interval_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub reconnect: BackoffConfig,
    pub dead_letter_topic: String,
    pub high_value_threshold: Decimal,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "banking-consumer".to_string(),
            topics: vec![
                "completedTransactions".to_string(),
                "failedTransactions".to_string(),
            ],
            max_retries: 3,
            retry_backoff_ms: 1_000,
            reconnect: BackoffConfig {
                initial_ms: 500,
                max_ms: 30_000,
                multiplier: 2.0,
                jitter: 0.2,
            },
            dead_letter_topic: "deadLetterTransactions".to_string(),
            high_value_threshold: Decimal::new(10_000, 0),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        Self::from_file(&config_path)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
