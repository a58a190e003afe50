//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    domain::chain_config::{default_networks, NetworkConfig, NetworkTable},
    utils::string_utils::is_blank,
};

/// 应用配置结构体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
}

/// 连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// RPC 握手超时（秒）
    pub connect_timeout_secs: u64,
    /// 单个 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
}

/// 结果缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 持久化键命名空间
    pub namespace: String,
    pub max_size: usize,
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

/// 持久化存储配置（未配置 Redis 时使用进程内存储）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: std::env::var("IRONCONNECT_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            request_timeout_secs: std::env::var("IRONCONNECT_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: std::env::var("IRONCONNECT_CACHE_NAMESPACE")
                .unwrap_or_else(|_| "ironconnect:cache:".into()),
            max_size: std::env::var("IRONCONNECT_CACHE_MAX_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(500),
            default_ttl_secs: std::env::var("IRONCONNECT_CACHE_DEFAULT_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            sweep_interval_secs: std::env::var("IRONCONNECT_CACHE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            cache: CacheConfig::default(),
            storage: StorageConfig {
                redis_url: std::env::var("IRONCONNECT_REDIS_URL").ok(),
            },
            logging: LoggingConfig::default(),
            networks: default_networks(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置（会先读取 .env）
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Ok(Self::default())
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
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 构建运行时网络表
    pub fn network_table(&self) -> NetworkTable {
        NetworkTable::from_configs(self.networks.clone())
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.connection.connect_timeout_secs == 0 {
            anyhow::bail!("IRONCONNECT_CONNECT_TIMEOUT_SECS must be greater than 0");
        }

        if self.cache.max_size == 0 {
            anyhow::bail!("IRONCONNECT_CACHE_MAX_SIZE must be greater than 0");
        }

        if self.cache.sweep_interval_secs == 0 {
            anyhow::bail!("IRONCONNECT_CACHE_SWEEP_INTERVAL_SECS must be greater than 0");
        }

        if is_blank(&self.cache.namespace) {
            anyhow::bail!("cache namespace cannot be empty");
        }

        if let Some(url) = &self.storage.redis_url {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                anyhow::bail!("IRONCONNECT_REDIS_URL must start with redis:// or rediss://");
            }
        }

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        if self.networks.is_empty() {
            anyhow::bail!("at least one network must be configured");
        }

        // 网络 ID 重复时网络表会静默覆盖，这里提前拦截
        let mut ids: Vec<_> = self.networks.iter().map(|n| n.id).collect();
        ids.sort();
        ids.dedup();
        if ids.len() != self.networks.len() {
            anyhow::bail!("duplicate network id in networks");
        }

        for network in &self.networks {
            reqwest::Url::parse(&network.rpc_url)
                .with_context(|| format!("Invalid rpc_url for {}: {}", network.id, network.rpc_url))?;
        }

        self.network_table()
            .validate()
            .map_err(|errors| anyhow::anyhow!("Invalid network table: {}", errors.join("; ")))?;

        Ok(())
    }
}
