//! 测试替身：Mock 传输层、Mock 注入钱包、Mock 传输工厂
//!
//! 仅在 `cfg(test)` 或 `dev-tools` 功能下编译。

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    domain::chain_config::{NetworkConfig, NetworkId},
    error::{CoreError, CoreResult, RPC_CODE_UNRECOGNIZED_CHAIN, RPC_CODE_USER_REJECTED},
    infrastructure::{
        transport::{Transport, TransportFactory, TransportKind},
        wallet::{ListenerId, WalletEvent, WalletEventKind, WalletListener, WalletProvider},
    },
    utils::chain_normalizer::chain_id_from_value,
};

pub const MOCK_TX_HASH: &str =
    "0x9fc76417374aa880d4449a1f7f31ec597f00b1f6f3dd2d66f4c9c6c445836d8b";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MockTransport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 可编程的 JSON-RPC 节点
pub struct MockTransport {
    chain_id: AtomicU64,
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, CoreError>>,
    calls: Mutex<Vec<(String, Value)>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id: AtomicU64::new(chain_id),
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    /// 每个请求在应答前等待指定时长（用于超时测试）
    pub fn with_delay(self, delay: Duration) -> Self {
        *lock(&self.delay) = Some(delay);
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.chain_id.store(chain_id, Ordering::SeqCst);
    }

    pub fn set_response(&self, method: &str, value: Value) {
        lock(&self.responses).insert(method.to_string(), value);
    }

    pub fn fail_method(&self, method: &str, error: CoreError) {
        lock(&self.failures).insert(method.to_string(), error);
    }

    pub fn clear_failure(&self, method: &str) {
        lock(&self.failures).remove(method);
    }

    pub fn request_count(&self, method: &str) -> usize {
        lock(&self.calls).iter().filter(|(m, _)| m == method).count()
    }

    pub fn total_requests(&self) -> usize {
        lock(&self.calls).len()
    }

    /// 最近一次调用某方法时的参数
    pub fn last_params(&self, method: &str) -> Option<Value> {
        lock(&self.calls)
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }

    fn default_response(&self, method: &str) -> CoreResult<Value> {
        let chain_id = self.chain_id.load(Ordering::SeqCst);
        let value = match method {
            "eth_chainId" => json!(format!("0x{:x}", chain_id)),
            "net_version" => json!(chain_id.to_string()),
            "eth_blockNumber" => json!("0x10"),
            "eth_getBalance" => json!("0xde0b6b3a7640000"),
            "eth_getCode" | "eth_call" => json!("0x"),
            "eth_gasPrice" => json!("0x3b9aca00"),
            "eth_maxPriorityFeePerGas" => json!("0x59682f00"),
            "eth_estimateGas" => json!("0x5208"),
            "eth_getBlockByNumber" => json!({
                "number": "0x10",
                "baseFeePerGas": "0x3b9aca00",
            }),
            "eth_getLogs" => json!([]),
            "eth_sendTransaction" | "eth_sendRawTransaction" => json!(MOCK_TX_HASH),
            "eth_getTransactionByHash" | "eth_getTransactionReceipt" => Value::Null,
            _ => {
                return Err(CoreError::rpc(
                    Some(-32601),
                    format!("the method {} does not exist/is not available", method),
                ))
            }
        };
        Ok(value)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn endpoint(&self) -> String {
        format!("mock://chain/{}", self.chain_id.load(Ordering::SeqCst))
    }

    async fn request(&self, method: &str, params: Value) -> CoreResult<Value> {
        lock(&self.calls).push((method.to_string(), params));

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = lock(&self.failures).get(method).cloned() {
            return Err(err);
        }
        if let Some(value) = lock(&self.responses).get(method).cloned() {
            return Ok(value);
        }
        self.default_response(method)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MockWallet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 模拟浏览器注入钱包
///
/// - `eth_requestAccounts` / `eth_accounts` 返回配置的账户
/// - `wallet_switchEthereumChain` 对未注册链返回 4902，成功时触发 chainChanged
/// - `wallet_addEthereumChain` 把链加入已知集合（可配置为失败）
/// - 其余方法转发给内置的 `MockTransport`
pub struct MockWallet {
    accounts: Mutex<Vec<String>>,
    chain_id: AtomicU64,
    known_chains: Mutex<HashSet<u64>>,
    listeners: Mutex<Vec<(WalletEventKind, ListenerId, WalletListener)>>,
    calls: Mutex<Vec<String>>,
    reject_requests: AtomicBool,
    fail_add_chain: AtomicBool,
    node: MockTransport,
}

impl MockWallet {
    pub fn new(accounts: Vec<&str>, chain_id: u64) -> Self {
        Self {
            accounts: Mutex::new(accounts.into_iter().map(String::from).collect()),
            chain_id: AtomicU64::new(chain_id),
            known_chains: Mutex::new(HashSet::from([chain_id])),
            listeners: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            reject_requests: AtomicBool::new(false),
            fail_add_chain: AtomicBool::new(false),
            node: MockTransport::new(chain_id),
        }
    }

    /// 内置节点，用于设置非钱包方法的应答
    pub fn node(&self) -> &MockTransport {
        &self.node
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id.load(Ordering::SeqCst)
    }

    pub fn set_accounts(&self, accounts: Vec<&str>) {
        *lock(&self.accounts) = accounts.into_iter().map(String::from).collect();
    }

    /// 模拟用户拒绝账户授权（4001）
    pub fn reject_requests(&self, reject: bool) {
        self.reject_requests.store(reject, Ordering::SeqCst);
    }

    pub fn fail_add_chain(&self, fail: bool) {
        self.fail_add_chain.store(fail, Ordering::SeqCst);
    }

    pub fn add_known_chain(&self, chain_id: u64) {
        lock(&self.known_chains).insert(chain_id);
    }

    pub fn is_known_chain(&self, chain_id: u64) -> bool {
        lock(&self.known_chains).contains(&chain_id)
    }

    pub fn request_count(&self, method: &str) -> usize {
        lock(&self.calls).iter().filter(|m| *m == method).count()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// 向已注册的监听器广播事件（遍历快照）
    pub fn emit(&self, event: WalletEvent) {
        let kind = event.kind();
        let snapshot: Vec<WalletListener> = lock(&self.listeners)
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, l)| l.clone())
            .collect();

        for listener in snapshot {
            listener(&event);
        }
    }

    fn requested_chain_id(params: &Value) -> Option<u64> {
        params
            .get(0)
            .and_then(|p| p.get("chainId"))
            .and_then(chain_id_from_value)
    }

    fn switch_chain(&self, params: &Value) -> CoreResult<Value> {
        let target = Self::requested_chain_id(params).ok_or_else(|| {
            CoreError::rpc(Some(-32602), "missing chainId in wallet_switchEthereumChain")
        })?;

        if !self.is_known_chain(target) {
            return Err(CoreError::rpc(
                Some(RPC_CODE_UNRECOGNIZED_CHAIN),
                format!("Unrecognized chain ID \"0x{:x}\"", target),
            ));
        }

        let previous = self.chain_id.swap(target, Ordering::SeqCst);
        self.node.set_chain_id(target);
        if previous != target {
            self.emit(WalletEvent::ChainChanged(target));
        }
        Ok(Value::Null)
    }

    fn add_chain(&self, params: &Value) -> CoreResult<Value> {
        if self.fail_add_chain.load(Ordering::SeqCst) {
            return Err(CoreError::rpc(Some(-32603), "failed to add chain"));
        }
        let chain_id = Self::requested_chain_id(params).ok_or_else(|| {
            CoreError::rpc(Some(-32602), "missing chainId in wallet_addEthereumChain")
        })?;
        self.add_known_chain(chain_id);
        Ok(Value::Null)
    }
}

#[async_trait]
impl WalletProvider for MockWallet {
    async fn request(&self, method: &str, params: Value) -> CoreResult<Value> {
        lock(&self.calls).push(method.to_string());

        match method {
            "eth_requestAccounts" => {
                if self.reject_requests.load(Ordering::SeqCst) {
                    return Err(CoreError::rpc(
                        Some(RPC_CODE_USER_REJECTED),
                        "User rejected the request.",
                    ));
                }
                Ok(json!(*lock(&self.accounts)))
            }
            "eth_accounts" => Ok(json!(*lock(&self.accounts))),
            "eth_chainId" => Ok(json!(format!("0x{:x}", self.chain_id()))),
            "wallet_switchEthereumChain" => self.switch_chain(&params),
            "wallet_addEthereumChain" => self.add_chain(&params),
            _ => self.node.request(method, params).await,
        }
    }

    fn add_listener(&self, kind: WalletEventKind, listener: WalletListener) -> ListenerId {
        let id = ListenerId::new();
        lock(&self.listeners).push((kind, id, listener));
        id
    }

    fn remove_listener(&self, kind: WalletEventKind, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(k, i, _)| !(*k == kind && *i == id));
        listeners.len() != before
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MockTransportFactory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 按网络分发 MockTransport；未预置的网络按其配置的链 ID 自动创建
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<NetworkId, Arc<MockTransport>>>,
    unavailable: Mutex<HashSet<NetworkId>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: NetworkId, transport: Arc<MockTransport>) {
        lock(&self.transports).insert(id, transport);
    }

    pub fn transport(&self, id: NetworkId) -> Option<Arc<MockTransport>> {
        lock(&self.transports).get(&id).cloned()
    }

    /// 模拟无法构造传输（例如 URL 非法）
    pub fn mark_unavailable(&self, id: NetworkId) {
        lock(&self.unavailable).insert(id);
    }
}

impl TransportFactory for MockTransportFactory {
    fn rpc_transport(&self, network: &NetworkConfig) -> CoreResult<Arc<dyn Transport>> {
        if lock(&self.unavailable).contains(&network.id) {
            return Err(CoreError::rpc(
                None,
                format!("invalid rpc url {}", network.rpc_url),
            ));
        }

        let transport = lock(&self.transports)
            .entry(network.id)
            .or_insert_with(|| Arc::new(MockTransport::new(network.chain_id)))
            .clone();
        Ok(transport)
    }
}
