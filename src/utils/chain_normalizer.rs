//! 网络标识符标准化模块
//!
//! 统一处理网络别名、链 ID 字符串以及 JSON-RPC 十六进制数量

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{domain::chain_config::NetworkId, error::CoreError};

/// 别名注册表（键统一为小写）
static NETWORK_ALIASES: Lazy<HashMap<&'static str, NetworkId>> = Lazy::new(|| {
    let entries: [(NetworkId, &[&str]); 5] = [
        (
            NetworkId::Ethereum,
            &["ethereum", "eth", "mainnet", "homestead", "1"],
        ),
        (NetworkId::Sepolia, &["sepolia", "eth-sepolia", "11155111"]),
        (
            NetworkId::Bsc,
            &["bsc", "binance", "bnb", "bnb smart chain", "56"],
        ),
        (NetworkId::Polygon, &["polygon", "matic", "pol", "137"]),
        (
            NetworkId::Arbitrum,
            &["arbitrum", "arb", "arbitrum one", "42161"],
        ),
    ];

    let mut registry = HashMap::new();
    for (id, aliases) in entries {
        for alias in aliases {
            registry.insert(*alias, id);
        }
    }
    registry
});

/// 标准化网络标识符
///
/// 接受规范名称、别名（大小写不敏感）或十进制/十六进制链 ID
pub fn normalize_network(input: &str) -> Result<NetworkId, CoreError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(CoreError::UnsupportedNetwork(
            "network identifier cannot be empty".to_string(),
        ));
    }

    let lower = trimmed.to_lowercase();
    if let Some(id) = NETWORK_ALIASES.get(lower.as_str()) {
        return Ok(*id);
    }

    // 十六进制链 ID（钱包 chainChanged 事件中的格式）
    if let Some(chain_id) = parse_hex_u64(&lower) {
        if let Some(id) = NETWORK_ALIASES.get(chain_id.to_string().as_str()) {
            return Ok(*id);
        }
    }

    Err(CoreError::UnsupportedNetwork(trimmed.to_string()))
}

/// 解析 0x 前缀的十六进制数量
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// 从 JSON 值中解析链 ID（十六进制字符串、十进制字符串或数字）
pub fn chain_id_from_value(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::String(s) => parse_hex_u64(s).or_else(|| s.parse().ok()),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
