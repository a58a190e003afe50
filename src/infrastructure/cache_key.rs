//! 缓存键生成
//!
//! 键由结构化描述按固定顺序拼接：
//! `prefix:addr=<小写地址>:chain=<链ID>:block=<区块号>:net=<网络>:<参数名>=<值>...`
//! 附加参数按名称排序，描述相同的查询总是得到相同的键。

use std::{collections::BTreeMap, fmt};

pub const SEPARATOR: char = ':';
pub const ADDRESS_TAG: &str = "addr=";
pub const CHAIN_TAG: &str = "chain=";
pub const BLOCK_TAG: &str = "block=";
pub const NETWORK_TAG: &str = "net=";

/// 缓存键描述
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKey {
    prefix: String,
    address: Option<String>,
    chain_id: Option<u64>,
    block_number: Option<u64>,
    network: Option<String>,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn address(mut self, address: &str) -> Self {
        self.address = Some(address.trim().to_lowercase());
        self
    }

    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        for (name, value) in params {
            self.params.insert(name.into(), value.to_string());
        }
        self
    }

    pub fn build(&self) -> String {
        let mut segments = vec![self.prefix.clone()];

        if let Some(address) = &self.address {
            segments.push(format!("{}{}", ADDRESS_TAG, address));
        }
        if let Some(chain_id) = self.chain_id {
            segments.push(format!("{}{}", CHAIN_TAG, chain_id));
        }
        if let Some(block) = self.block_number {
            segments.push(format!("{}{}", BLOCK_TAG, block));
        }
        if let Some(network) = &self.network {
            segments.push(format!("{}{}", NETWORK_TAG, network));
        }
        for (name, value) in &self.params {
            segments.push(format!("{}={}", name, value));
        }

        segments.join(&SEPARATOR.to_string())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.build()
    }
}

fn tagged_segment<'a>(key: &'a str, tag: &str) -> Option<&'a str> {
    key.split(SEPARATOR).find_map(|seg| seg.strip_prefix(tag))
}

/// 键中编码的地址（小写）
pub fn key_address(key: &str) -> Option<&str> {
    tagged_segment(key, ADDRESS_TAG)
}

/// 键中编码的链 ID
pub fn key_chain_id(key: &str) -> Option<u64> {
    tagged_segment(key, CHAIN_TAG)?.parse().ok()
}

/// 键是否编码了该地址（大小写不敏感）
pub fn key_matches_address(key: &str, address: &str) -> bool {
    key_address(key)
        .map(|a| a.eq_ignore_ascii_case(address.trim()))
        .unwrap_or(false)
}

pub fn key_matches_chain(key: &str, chain_id: u64) -> bool {
    key_chain_id(key) == Some(chain_id)
}
