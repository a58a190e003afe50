//! 基于结果缓存的链上查询
//!
//! 下游服务通过当前活跃适配器读取余额、合约代码与 ERC-20 元数据，
//! 命中缓存时不访问传输层。账户切换时清除旧账户的缓存条目。

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ethers::{
    abi::{Abi, Function, Token},
    types::{Address, Bytes, U256},
};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::connection_state::ConnectionState,
    error::{CoreError, CoreResult},
    infrastructure::{
        cache_key::CacheKey,
        result_cache::{ResultCache, SetOptions},
    },
    service::{
        chain_adapter::ChainAdapter,
        connection_manager::{ConnectionManager, SubscriptionId},
    },
};

/// 余额变化快，只短暂缓存
pub const BALANCE_TTL: Duration = Duration::from_secs(15);

static ERC20_ABI: Lazy<Abi> = Lazy::new(|| {
    ethers::abi::parse_abi(&[
        "function name() returns (string)",
        "function symbol() returns (string)",
        "function decimals() returns (uint8)",
    ])
    .expect("valid ERC-20 ABI")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub address: String,
    pub chain_id: u64,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

pub struct ChainLookupService {
    manager: Arc<ConnectionManager>,
    cache: ResultCache<Value>,
    default_ttl: Duration,
    subscription: SubscriptionId,
}

impl ChainLookupService {
    pub fn new(
        manager: Arc<ConnectionManager>,
        cache: ResultCache<Value>,
        default_ttl: Duration,
    ) -> Self {
        let last_account: Mutex<Option<String>> = Mutex::new(None);
        let listener_cache = cache.clone();
        let subscription = manager.subscribe(Arc::new(move |state: &ConnectionState| {
            let current = state.account().map(str::to_lowercase);
            let previous = {
                let mut last = last_account.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::replace(&mut *last, current.clone())
            };

            if let Some(previous) = previous {
                if current.as_deref() != Some(previous.as_str()) {
                    let removed = listener_cache.invalidate_for_address(&previous);
                    tracing::debug!(account = %previous, removed = removed, "Invalidated cached lookups for previous account");
                }
            }
        }));

        Self {
            manager,
            cache,
            default_ttl,
            subscription,
        }
    }

    pub fn cache(&self) -> &ResultCache<Value> {
        &self.cache
    }

    /// 当前适配器与链 ID（钱包可能位于适配器兼容的其它链上）
    fn active(&self) -> CoreResult<(Arc<dyn ChainAdapter>, u64)> {
        let adapter = self.manager.active_adapter().ok_or(CoreError::NotConnected)?;
        let chain_id = self
            .manager
            .get_state()
            .chain_id()
            .unwrap_or(adapter.network().chain_id);
        Ok((adapter, chain_id))
    }

    fn cached<R: DeserializeOwned>(&self, key: &str) -> Option<R> {
        let value = self.cache.get(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.cache.invalidate(key);
                None
            }
        }
    }

    fn store<R: Serialize>(&self, key: &str, value: &R, options: SetOptions) {
        match serde_json::to_value(value) {
            Ok(value) => self.cache.set(key, value, options),
            Err(e) => tracing::warn!(key = %key, error = %e, "Lookup result not cacheable"),
        }
    }

    /// 原生代币余额
    pub async fn native_balance(&self, address: Address) -> CoreResult<U256> {
        let (adapter, chain_id) = self.active()?;
        let key = CacheKey::new("balance")
            .address(&format!("{:?}", address))
            .chain_id(chain_id)
            .build();
        if let Some(balance) = self.cached(&key) {
            return Ok(balance);
        }

        let balance = adapter.get_balance(address).await?;
        self.store(&key, &balance, SetOptions::with_ttl(BALANCE_TTL));
        Ok(balance)
    }

    /// 合约代码（部署后不变，持久化缓存）
    pub async fn contract_code(&self, address: Address) -> CoreResult<Bytes> {
        let (adapter, chain_id) = self.active()?;
        let key = CacheKey::new("code")
            .address(&format!("{:?}", address))
            .chain_id(chain_id)
            .build();
        if let Some(code) = self.cached(&key) {
            return Ok(code);
        }

        let code = adapter.get_code(address).await?;
        self.store(&key, &code, SetOptions::with_ttl(self.default_ttl).persist());
        Ok(code)
    }

    pub async fn is_contract(&self, address: Address) -> CoreResult<bool> {
        Ok(!self.contract_code(address).await?.is_empty())
    }

    /// ERC-20 name / symbol / decimals
    pub async fn token_metadata(&self, token: Address) -> CoreResult<TokenMetadata> {
        let (adapter, chain_id) = self.active()?;
        let address = format!("{:?}", token);
        let key = CacheKey::new("token_metadata")
            .address(&address)
            .chain_id(chain_id)
            .build();
        if let Some(metadata) = self.cached(&key) {
            return Ok(metadata);
        }

        let (name, symbol, decimals) = futures::try_join!(
            call_single(adapter.as_ref(), token, "name"),
            call_single(adapter.as_ref(), token, "symbol"),
            call_single(adapter.as_ref(), token, "decimals"),
        )?;

        let metadata = TokenMetadata {
            address: address.clone(),
            chain_id,
            name: expect_string("name", name)?,
            symbol: expect_string("symbol", symbol)?,
            decimals: expect_u8("decimals", decimals)?,
        };
        tracing::debug!(token = %address, symbol = %metadata.symbol, chain_id = chain_id, "Token metadata loaded");
        self.store(&key, &metadata, SetOptions::with_ttl(self.default_ttl).persist());
        Ok(metadata)
    }

    /// 清除某地址的所有查询缓存
    pub fn invalidate_account(&self, address: Address) -> usize {
        self.cache.invalidate_for_address(&format!("{:?}", address))
    }
}

impl Drop for ChainLookupService {
    fn drop(&mut self) {
        self.manager.unsubscribe(self.subscription);
    }
}

fn erc20_function(name: &str) -> CoreResult<&'static Function> {
    ERC20_ABI
        .function(name)
        .map_err(|e| CoreError::invalid_response(name, e))
}

async fn call_single(adapter: &dyn ChainAdapter, token: Address, name: &str) -> CoreResult<Token> {
    let function = erc20_function(name)?;
    adapter
        .call_function(token, function, &[])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::invalid_response(name, "empty output"))
}

fn expect_string(method: &str, token: Token) -> CoreResult<String> {
    token
        .into_string()
        .ok_or_else(|| CoreError::invalid_response(method, "expected string"))
}

fn expect_u8(method: &str, token: Token) -> CoreResult<u8> {
    let value = token
        .into_uint()
        .ok_or_else(|| CoreError::invalid_response(method, "expected uint"))?;
    if value > U256::from(u8::MAX) {
        return Err(CoreError::invalid_response(method, format!("{} out of range", value)));
    }
    Ok(value.low_u32() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CacheConfig,
        domain::chain_config::{NetworkId, NetworkTable},
        infrastructure::{transport::TransportFactory, wallet::{WalletEvent, WalletProvider}},
        service::adapter_registry::AdapterRegistry,
        testing::{MockTransportFactory, MockWallet},
    };

    const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";

    fn setup(wallet: Option<Arc<MockWallet>>) -> (Arc<MockTransportFactory>, Arc<ConnectionManager>, ChainLookupService) {
        let networks = Arc::new(NetworkTable::new());
        let factory = Arc::new(MockTransportFactory::new());
        let manager = Arc::new(ConnectionManager::new(
            networks.clone(),
            Arc::new(AdapterRegistry::new(networks)),
            factory.clone() as Arc<dyn TransportFactory>,
            wallet.map(|w| w as Arc<dyn WalletProvider>),
            Duration::from_secs(10),
        ));
        let cache = ResultCache::new(&CacheConfig::default());
        let lookup = ChainLookupService::new(manager.clone(), cache, Duration::from_secs(300));
        (factory, manager, lookup)
    }

    #[tokio::test]
    async fn test_lookup_requires_connection() {
        let (_, _, lookup) = setup(None);
        let result = lookup.native_balance(Address::zero()).await;
        assert_eq!(result, Err(CoreError::NotConnected));
    }

    #[tokio::test]
    async fn test_balance_is_served_from_cache() {
        let (factory, manager, lookup) = setup(None);
        assert!(manager.connect_rpc(NetworkId::Bsc).await.is_connected());
        let node = factory.transport(NetworkId::Bsc).unwrap();

        let address: Address = ACCOUNT.parse().unwrap();
        let first = lookup.native_balance(address).await.unwrap();
        let second = lookup.native_balance(address).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, U256::exp10(18));
        assert_eq!(node.request_count("eth_getBalance"), 1);
        assert_eq!(lookup.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_contract_detection() {
        let (factory, manager, lookup) = setup(None);
        manager.connect_rpc(NetworkId::Ethereum).await;
        let node = factory.transport(NetworkId::Ethereum).unwrap();

        let address: Address = ACCOUNT.parse().unwrap();
        assert!(!lookup.is_contract(address).await.unwrap());

        node.set_response("eth_getCode", serde_json::json!("0x6080"));
        // 代码已缓存
        assert!(!lookup.is_contract(address).await.unwrap());
        assert_eq!(lookup.invalidate_account(address), 1);
        assert!(lookup.is_contract(address).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_metadata_decoding() {
        let (factory, manager, lookup) = setup(None);
        manager.connect_rpc(NetworkId::Polygon).await;
        let node = factory.transport(NetworkId::Polygon).unwrap();

        // Mock 节点对所有 eth_call 返回同一负载：字符串的首个字（偏移量 0x20）同时被解码为 decimals
        let encoded = ethers::abi::encode(&[Token::String("USDC".into())]);
        node.set_response("eth_call", serde_json::json!(Bytes::from(encoded)));

        let token: Address = "0x3c499c542cef5e3811e1192ce70d8cc03d5c3359".parse().unwrap();
        let metadata = lookup.token_metadata(token).await.unwrap();
        assert_eq!(metadata.name, "USDC");
        assert_eq!(metadata.symbol, "USDC");
        assert_eq!(metadata.decimals, 32);
        assert_eq!(metadata.chain_id, 137);

        lookup.token_metadata(token).await.unwrap();
        assert_eq!(node.request_count("eth_call"), 3);
    }

    #[tokio::test]
    async fn test_account_change_invalidates_previous_account() {
        let wallet = Arc::new(MockWallet::new(vec![ACCOUNT], 1));
        let (_, manager, lookup) = setup(Some(wallet.clone()));
        assert!(manager.connect_wallet().await.is_connected());

        let address: Address = ACCOUNT.parse().unwrap();
        lookup.native_balance(address).await.unwrap();
        assert_eq!(lookup.cache().len(), 1);

        wallet.emit(WalletEvent::AccountsChanged(vec![
            "0x2222222222222222222222222222222222222222".to_string(),
        ]));
        assert!(lookup.cache().is_empty());
    }
}
