//! 多链网络配置模块
//!
//! 定义所有支持的网络及其静态配置（运行时只读）

use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// 支持的网络标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    /// Ethereum 主网
    Ethereum,
    /// Ethereum Sepolia 测试网
    Sepolia,
    /// BNB Smart Chain
    Bsc,
    /// Polygon PoS
    Polygon,
    /// Arbitrum One (L2)
    Arbitrum,
}

impl NetworkId {
    pub const ALL: [NetworkId; 5] = [
        NetworkId::Ethereum,
        NetworkId::Sepolia,
        NetworkId::Bsc,
        NetworkId::Polygon,
        NetworkId::Arbitrum,
    ];

    /// 规范名称（小写，用于缓存键与日志）
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkId::Ethereum => "ethereum",
            NetworkId::Sepolia => "sepolia",
            NetworkId::Bsc => "bsc",
            NetworkId::Polygon => "polygon",
            NetworkId::Arbitrum => "arbitrum",
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::utils::chain_normalizer::normalize_network(s)
    }
}

/// 原生代币描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl NativeCurrency {
    fn new(name: &str, symbol: &str) -> Self {
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals: 18,
        }
    }
}

/// 网络配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 网络标识
    pub id: NetworkId,
    /// 展示名称
    pub name: String,
    /// 链 ID (EIP-155)
    pub chain_id: u64,
    /// RPC 端点
    pub rpc_url: String,
    /// 区块浏览器根地址
    pub explorer_url: String,
    /// 原生代币
    pub native_currency: NativeCurrency,
    /// 是否为测试网
    #[serde(default)]
    pub is_testnet: bool,
}

impl NetworkConfig {
    /// 0x 前缀的十六进制链 ID（钱包 RPC 使用）
    pub fn chain_id_hex(&self) -> String {
        format!("0x{:x}", self.chain_id)
    }

    pub fn explorer_tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }

    pub fn explorer_address_url(&self, address: &str) -> String {
        format!(
            "{}/address/{}",
            self.explorer_url.trim_end_matches('/'),
            address
        )
    }

    /// `wallet_addEthereumChain` 请求参数 (EIP-3085)
    pub fn add_chain_params(&self) -> serde_json::Value {
        serde_json::json!([{
            "chainId": self.chain_id_hex(),
            "chainName": self.name,
            "nativeCurrency": {
                "name": self.native_currency.name,
                "symbol": self.native_currency.symbol,
                "decimals": self.native_currency.decimals,
            },
            "rpcUrls": [self.rpc_url],
            "blockExplorerUrls": [self.explorer_url],
        }])
    }
}

/// 内置网络表
pub fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig {
            id: NetworkId::Ethereum,
            name: "Ethereum".to_string(),
            chain_id: 1,
            rpc_url: "https://eth.llamarpc.com".to_string(),
            explorer_url: "https://etherscan.io".to_string(),
            native_currency: NativeCurrency::new("Ether", "ETH"),
            is_testnet: false,
        },
        NetworkConfig {
            id: NetworkId::Sepolia,
            name: "Ethereum Sepolia".to_string(),
            chain_id: 11155111,
            rpc_url: "https://rpc.sepolia.org".to_string(),
            explorer_url: "https://sepolia.etherscan.io".to_string(),
            native_currency: NativeCurrency::new("Sepolia Ether", "ETH"),
            is_testnet: true,
        },
        NetworkConfig {
            id: NetworkId::Bsc,
            name: "BNB Smart Chain".to_string(),
            chain_id: 56,
            rpc_url: "https://bsc-dataseed.binance.org".to_string(),
            explorer_url: "https://bscscan.com".to_string(),
            native_currency: NativeCurrency::new("BNB", "BNB"),
            is_testnet: false,
        },
        NetworkConfig {
            id: NetworkId::Polygon,
            name: "Polygon".to_string(),
            chain_id: 137,
            rpc_url: "https://polygon-rpc.com".to_string(),
            explorer_url: "https://polygonscan.com".to_string(),
            native_currency: NativeCurrency::new("POL", "POL"),
            is_testnet: false,
        },
        NetworkConfig {
            id: NetworkId::Arbitrum,
            name: "Arbitrum One".to_string(),
            chain_id: 42161,
            rpc_url: "https://arb1.arbitrum.io/rpc".to_string(),
            explorer_url: "https://arbiscan.io".to_string(),
            native_currency: NativeCurrency::new("Ether", "ETH"),
            is_testnet: false,
        },
    ]
}

/// 网络配置表
#[derive(Debug, Clone)]
pub struct NetworkTable {
    configs: HashMap<NetworkId, NetworkConfig>,
    chain_id_map: HashMap<u64, NetworkId>,
}

impl NetworkTable {
    /// 创建预配置的网络表
    pub fn new() -> Self {
        Self::from_configs(default_networks())
    }

    pub fn from_configs(configs: Vec<NetworkConfig>) -> Self {
        let mut table = Self {
            configs: HashMap::new(),
            chain_id_map: HashMap::new(),
        };
        for config in configs {
            table.register(config);
        }
        table
    }

    /// 注册（或覆盖）网络配置
    pub fn register(&mut self, config: NetworkConfig) {
        if let Some(previous) = self.configs.get(&config.id) {
            self.chain_id_map.remove(&previous.chain_id);
        }
        self.chain_id_map.insert(config.chain_id, config.id);
        self.configs.insert(config.id, config);
    }

    pub fn get(&self, id: NetworkId) -> Option<&NetworkConfig> {
        self.configs.get(&id)
    }

    /// 通过 chain_id 获取配置
    pub fn get_by_chain_id(&self, chain_id: u64) -> Option<&NetworkConfig> {
        let id = self.chain_id_map.get(&chain_id)?;
        self.configs.get(id)
    }

    /// 通过别名获取配置（"eth"、"bnb"、"137" 等）
    pub fn get_by_alias(&self, alias: &str) -> Option<&NetworkConfig> {
        let id = NetworkId::from_str(alias).ok()?;
        self.get(id)
    }

    /// 列出所有网络（按 chain_id 排序）
    pub fn list_all(&self) -> Vec<&NetworkConfig> {
        let mut all: Vec<&NetworkConfig> = self.configs.values().collect();
        all.sort_by_key(|c| c.chain_id);
        all
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// 验证配置完整性
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mut seen_chain_ids: HashMap<u64, NetworkId> = HashMap::new();

        for config in self.list_all() {
            if config.name.trim().is_empty() {
                errors.push(format!("Network {} has empty name", config.id));
            }
            if config.chain_id == 0 {
                errors.push(format!("Network {} has invalid chain_id: 0", config.id));
            }
            if let Some(other) = seen_chain_ids.insert(config.chain_id, config.id) {
                errors.push(format!(
                    "Networks {} and {} share chain_id {}",
                    other, config.id, config.chain_id
                ));
            }
            if !(config.rpc_url.starts_with("https://") || config.rpc_url.starts_with("http://"))
            {
                errors.push(format!(
                    "Network {} has invalid rpc_url: {}",
                    config.id, config.rpc_url
                ));
            }
            if config.native_currency.symbol.is_empty() {
                errors.push(format!("Network {} has empty currency symbol", config.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for NetworkTable {
    fn default() -> Self {
        Self::new()
    }
}
