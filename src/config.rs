//! 配置管理模块
//! 支持从环境变量（`IRONPAY_*`）和 TOML 配置文件加载配置
//!
//! 助记词只从环境变量 `IRONPAY_MNEMONIC` 读取，永远不写入配置文件。

use std::{fmt, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    domain::{AddressKind, Network},
    service::{
        payment_service::{
            MAX_CONFIRMATIONS_REQUIRED, MAX_CONFIRMATION_GRACE_SECS, MAX_EXPIRES_IN_SECS,
        },
        AllocationPolicy, PaymentDefaults,
    },
};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

/// 数据库配置
///
/// 未配置 url 时使用内存账本（仅开发/测试）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub run_migrations: bool,
}

/// 种子配置
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    #[serde(skip)]
    pub mnemonic: Option<Zeroizing<String>>,
    #[serde(skip)]
    pub passphrase: Option<Zeroizing<String>>,
    /// 未设置助记词时允许生成临时种子（仅测试网开发）
    pub allow_ephemeral_seed: bool,
    pub entropy_bits: usize,
}

/// 链上数据源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub esplora_url: String,
    pub query_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub poll_interval_secs: u64,
    pub poll_concurrency: usize,
}

/// 支付默认参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub network: Network,
    pub address_kind: AddressKind,
    pub allocation_policy: AllocationPolicy,
    pub confirmations_required: u32,
    pub expires_in_secs: u64,
    /// 到期时已足额但确认不足的支付，继续等待确认的秒数
    pub confirmation_grace_secs: u64,
}

/// Webhook 与回调配置
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// 推送签名密钥；为空时不校验签名
    pub secret: Option<String>,
    /// 终态回调地址
    pub callback_url: Option<String>,
    pub callback_timeout_secs: u64,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("IRONPAY_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".into()),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("IRONPAY_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("IRONPAY_LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env_non_empty("IRONPAY_DATABASE_URL"),
            max_connections: env_parse("IRONPAY_DB_MAX_CONNS").unwrap_or(16),
            min_connections: env_parse("IRONPAY_DB_MIN_CONNS").unwrap_or(2),
            acquire_timeout_secs: env_parse("IRONPAY_DB_ACQ_TIMEOUT_SECS").unwrap_or(5),
            idle_timeout_secs: env_parse("IRONPAY_DB_IDLE_TIMEOUT_SECS").unwrap_or(300),
            run_migrations: env_flag("IRONPAY_SKIP_MIGRATIONS").map(|skip| !skip).unwrap_or(true),
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            mnemonic: env_non_empty("IRONPAY_MNEMONIC").map(Zeroizing::new),
            passphrase: env_non_empty("IRONPAY_MNEMONIC_PASSPHRASE").map(Zeroizing::new),
            allow_ephemeral_seed: env_flag("IRONPAY_ALLOW_EPHEMERAL_SEED").unwrap_or(false),
            entropy_bits: env_parse("IRONPAY_ENTROPY_BITS").unwrap_or(256),
        }
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "***"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("allow_ephemeral_seed", &self.allow_ephemeral_seed)
            .field("entropy_bits", &self.entropy_bits)
            .finish()
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            esplora_url: std::env::var("IRONPAY_ESPLORA_URL")
                .unwrap_or_else(|_| "https://blockstream.info/testnet/api".into()),
            query_timeout_secs: env_parse("IRONPAY_CHAIN_QUERY_TIMEOUT_SECS").unwrap_or(10),
            max_retries: env_parse("IRONPAY_CHAIN_MAX_RETRIES").unwrap_or(3),
            retry_delay_ms: env_parse("IRONPAY_CHAIN_RETRY_DELAY_MS").unwrap_or(500),
            poll_interval_secs: env_parse("IRONPAY_POLL_INTERVAL_SECS").unwrap_or(30),
            poll_concurrency: env_parse("IRONPAY_POLL_CONCURRENCY").unwrap_or(8),
        }
    }
}

impl ChainConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            network: env_parse("IRONPAY_NETWORK").unwrap_or(Network::Testnet),
            address_kind: env_parse("IRONPAY_ADDRESS_KIND").unwrap_or(AddressKind::Witness),
            allocation_policy: env_parse("IRONPAY_ALLOCATION_POLICY").unwrap_or_default(),
            confirmations_required: env_parse("IRONPAY_CONFIRMATIONS_REQUIRED").unwrap_or(3),
            expires_in_secs: env_parse("IRONPAY_PAYMENT_EXPIRES_SECS").unwrap_or(3600),
            confirmation_grace_secs: env_parse("IRONPAY_CONFIRMATION_GRACE_SECS")
                .unwrap_or(24 * 3600),
        }
    }
}

impl PaymentConfig {
    pub fn defaults(&self) -> PaymentDefaults {
        PaymentDefaults {
            network: self.network,
            confirmations_required: self.confirmations_required,
            expires_in_secs: self.expires_in_secs,
            confirmation_grace_secs: self.confirmation_grace_secs,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: env_non_empty("IRONPAY_WEBHOOK_SECRET"),
            callback_url: env_non_empty("IRONPAY_CALLBACK_URL"),
            callback_timeout_secs: env_parse("IRONPAY_CALLBACK_TIMEOUT_SECS").unwrap_or(10),
        }
    }
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("callback_url", &self.callback_url)
            .field("callback_timeout_secs", &self.callback_timeout_secs)
            .finish()
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            vault: VaultConfig::default(),
            chain: ChainConfig::default(),
            payment: PaymentConfig::default(),
            webhook: WebhookConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高）
    ///
    /// 文件中缺失的段落沿用环境变量默认值；助记词始终来自环境变量。
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                let mut file_config = Self::from_file(path)?;
                file_config.vault.mnemonic = config.vault.mnemonic.take();
                file_config.vault.passphrase = config.vault.passphrase.take();
                config = file_config;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("IRONPAY_DATABASE_URL must start with postgres:// or postgresql://");
            }
        }

        let bits = self.vault.entropy_bits;
        if !(128..=256).contains(&bits) || bits % 32 != 0 {
            anyhow::bail!("vault.entropy_bits must be one of 128, 160, 192, 224, 256");
        }
        if self.vault.mnemonic.is_none() && !self.vault.allow_ephemeral_seed {
            anyhow::bail!("IRONPAY_MNEMONIC must be set (or enable vault.allow_ephemeral_seed)");
        }
        if self.vault.mnemonic.is_none() && self.payment.network == Network::Mainnet {
            anyhow::bail!("ephemeral seeds are not allowed on mainnet");
        }

        if !self.chain.esplora_url.starts_with("http://")
            && !self.chain.esplora_url.starts_with("https://")
        {
            anyhow::bail!("chain.esplora_url must be an http(s) URL");
        }
        if self.chain.query_timeout_secs == 0 {
            anyhow::bail!("chain.query_timeout_secs must be positive");
        }
        if self.chain.poll_interval_secs == 0 {
            anyhow::bail!("chain.poll_interval_secs must be positive");
        }
        if self.chain.poll_concurrency == 0 {
            anyhow::bail!("chain.poll_concurrency must be positive");
        }

        if !(1..=MAX_CONFIRMATIONS_REQUIRED).contains(&self.payment.confirmations_required) {
            anyhow::bail!(
                "payment.confirmations_required must be between 1 and {}",
                MAX_CONFIRMATIONS_REQUIRED
            );
        }
        if !(1..=MAX_EXPIRES_IN_SECS).contains(&self.payment.expires_in_secs) {
            anyhow::bail!(
                "payment.expires_in_secs must be between 1 and {}",
                MAX_EXPIRES_IN_SECS
            );
        }
        if self.payment.confirmation_grace_secs > MAX_CONFIRMATION_GRACE_SECS {
            anyhow::bail!(
                "payment.confirmation_grace_secs must not exceed {}",
                MAX_CONFIRMATION_GRACE_SECS
            );
        }

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("IRONPAY_LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("IRONPAY_LOG_FORMAT must be 'json' or 'text'");
        }

        Ok(())
    }
}
