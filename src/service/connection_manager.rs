//! 连接管理器
//!
//! 负责钱包 / RPC 两种连接方式的生命周期，持有当前适配器并向订阅者发布状态。
//!
//! 并发约定：
//! - 会话状态只在 `session` 锁内修改，锁从不跨越 `.await`，也不在通知订阅者时持有
//! - 每次连接尝试、断开都会递增请求代数；连接结果只有在代数未变化时才会被应用，
//!   超时之后迟到的结果或被新请求取代的结果会被丢弃
//! - 通知遍历订阅者快照，订阅者可以在回调中订阅 / 取消订阅

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    domain::{
        chain_config::{NetworkConfig, NetworkId, NetworkTable},
        connection_state::{ConnectionMode, ConnectionState},
    },
    error::{CoreError, CoreResult, RPC_CODE_UNRECOGNIZED_CHAIN},
    infrastructure::{
        transport::{Transport, TransportFactory, WalletTransport},
        wallet::{WalletEvent, WalletProvider, WalletSubscription},
    },
    service::{adapter_registry::AdapterRegistry, chain_adapter::ChainAdapter},
    utils::chain_normalizer::chain_id_from_value,
};

pub type StateListener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// 当前会话：状态快照 + 活跃适配器 + 钱包监听守卫
#[derive(Default)]
struct Session {
    state: ConnectionState,
    adapter: Option<Arc<dyn ChainAdapter>>,
    subscription: Option<WalletSubscription>,
}

struct ManagerInner {
    networks: Arc<NetworkTable>,
    registry: Arc<AdapterRegistry>,
    transports: Arc<dyn TransportFactory>,
    wallet: Option<Arc<dyn WalletProvider>>,
    connect_timeout: Duration,
    generation: AtomicU64,
    session: Mutex<Session>,
    listeners: Mutex<Vec<(SubscriptionId, StateListener)>>,
}

pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        networks: Arc<NetworkTable>,
        registry: Arc<AdapterRegistry>,
        transports: Arc<dyn TransportFactory>,
        wallet: Option<Arc<dyn WalletProvider>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                networks,
                registry,
                transports,
                wallet,
                connect_timeout,
                generation: AtomicU64::new(0),
                session: Mutex::new(Session::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 连接注入钱包
    ///
    /// 失败不会向外抛出，而是写入返回（并已发布）的 Error 状态
    pub async fn connect_wallet(&self) -> ConnectionState {
        let Some(wallet) = self.inner.wallet.clone() else {
            return self.inner.fail_now(CoreError::NoWallet);
        };

        let generation = self.inner.begin(None);
        let outcome = self.wallet_handshake(&wallet).await;

        match outcome {
            Ok(_) if !self.inner.is_current(generation) => {
                tracing::debug!(generation = generation, "Wallet connection superseded");
            }
            Ok((account, chain_id)) => {
                let transport: Arc<dyn Transport> = Arc::new(WalletTransport::new(wallet.clone()));
                let adapter = self.inner.resolve_adapter(chain_id, transport.clone());
                let weak = Arc::downgrade(&self.inner);
                let subscription = WalletSubscription::attach(
                    wallet,
                    Arc::new(move |event: &WalletEvent| ManagerInner::dispatch(&weak, event)),
                );

                let state = ConnectionState::Connected {
                    mode: ConnectionMode::Wallet {
                        account: account.clone(),
                    },
                    chain_id,
                    network: self.inner.networks.get_by_chain_id(chain_id).cloned(),
                    transport,
                };
                let committed = self.inner.commit(
                    generation,
                    Session {
                        state,
                        adapter,
                        subscription: Some(subscription),
                    },
                );
                if committed {
                    tracing::info!(account = %account, chain_id = chain_id, "Wallet connected");
                }
            }
            Err(cause) => {
                tracing::warn!(error = %cause, "Wallet connection failed");
                self.inner.fail(generation, cause);
            }
        }

        self.get_state()
    }

    async fn wallet_handshake(&self, wallet: &Arc<dyn WalletProvider>) -> CoreResult<(String, u64)> {
        let raw = wallet.request("eth_requestAccounts", json!([])).await?;
        // 钱包没有授权任何账户
        let account = parse_accounts(&raw)
            .into_iter()
            .next()
            .ok_or(CoreError::UserRejected)?;

        let raw = wallet.request("eth_chainId", json!([])).await?;
        let chain_id = chain_id_from_value(&raw).ok_or_else(|| {
            CoreError::invalid_response("eth_chainId", format!("unexpected value {}", raw))
        })?;

        Ok((account, chain_id))
    }

    /// 建立只读 RPC 连接，握手与固定超时竞争
    pub async fn connect_rpc(&self, network_id: NetworkId) -> ConnectionState {
        let Some(network) = self.inner.networks.get(network_id).cloned() else {
            return self
                .inner
                .fail_now(CoreError::UnsupportedNetwork(network_id.to_string()));
        };

        let generation = self.inner.begin(Some(network.clone()));
        let timeout = self.inner.connect_timeout;

        match tokio::time::timeout(timeout, self.rpc_handshake(&network)).await {
            Ok(Ok(_)) if !self.inner.is_current(generation) => {
                tracing::debug!(network = %network.id, generation = generation, "RPC connection superseded");
            }
            Ok(Ok(transport)) => {
                let adapter = self.inner.resolve_adapter(network.chain_id, transport.clone());
                let state = ConnectionState::Connected {
                    mode: ConnectionMode::Rpc,
                    chain_id: network.chain_id,
                    network: Some(network.clone()),
                    transport,
                };
                let committed = self.inner.commit(
                    generation,
                    Session {
                        state,
                        adapter,
                        subscription: None,
                    },
                );
                if committed {
                    tracing::info!(network = %network.id, chain_id = network.chain_id, "RPC connected");
                }
            }
            Ok(Err(cause)) => {
                tracing::warn!(network = %network.id, error = %cause, "RPC connection failed");
                self.inner.fail(generation, cause);
            }
            Err(_) => {
                tracing::warn!(network = %network.id, timeout_secs = timeout.as_secs(), "RPC connection timed out");
                self.inner.fail(
                    generation,
                    CoreError::ConnectionTimeout {
                        network: network.name.clone(),
                        timeout_secs: timeout.as_secs(),
                    },
                );
            }
        }

        self.get_state()
    }

    async fn rpc_handshake(&self, network: &NetworkConfig) -> CoreResult<Arc<dyn Transport>> {
        let transport = self.inner.transports.rpc_transport(network)?;
        let raw = transport.request("eth_chainId", json!([])).await?;
        let reported = chain_id_from_value(&raw).ok_or_else(|| {
            CoreError::invalid_response("eth_chainId", format!("unexpected value {}", raw))
        })?;

        if reported != network.chain_id {
            return Err(CoreError::invalid_response(
                "eth_chainId",
                format!(
                    "endpoint reports chain {} but {} is configured with {}",
                    reported, network.id, network.chain_id
                ),
            ));
        }
        Ok(transport)
    }

    /// 切换网络
    ///
    /// - 未连接 / 错误状态 / RPC 连接：建立到目标网络的新 RPC 连接
    /// - 钱包连接：请求钱包切链；钱包不认识该链时先注册再重试一次。
    ///   失败返回 false 且状态不变
    pub async fn switch_network(&self, network_id: NetworkId) -> bool {
        let Some(network) = self.inner.networks.get(network_id).cloned() else {
            tracing::warn!(network = %network_id, "Cannot switch to unconfigured network");
            return false;
        };

        if self.get_state().is_wallet() {
            return self.switch_wallet_chain(&network).await;
        }
        self.connect_rpc(network_id).await.is_connected()
    }

    async fn switch_wallet_chain(&self, network: &NetworkConfig) -> bool {
        let Some(wallet) = self.inner.wallet.clone() else {
            return false;
        };
        let params = json!([{ "chainId": network.chain_id_hex() }]);

        match wallet
            .request("wallet_switchEthereumChain", params.clone())
            .await
        {
            Ok(_) => {}
            Err(e) if e.rpc_code() == Some(RPC_CODE_UNRECOGNIZED_CHAIN) => {
                tracing::info!(network = %network.id, "Wallet does not know the chain, registering it");
                if let Err(e) = wallet
                    .request("wallet_addEthereumChain", network.add_chain_params())
                    .await
                {
                    tracing::warn!(network = %network.id, error = %e, "Failed to add chain to wallet");
                    return false;
                }
                if let Err(e) = wallet.request("wallet_switchEthereumChain", params).await {
                    tracing::warn!(network = %network.id, error = %e, "Wallet chain switch failed after adding chain");
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(network = %network.id, error = %e, "Wallet chain switch failed");
                return false;
            }
        }

        // 钱包通常也会发出 chainChanged；重复应用是幂等的
        self.inner.apply_chain_change(network.chain_id);
        true
    }

    /// 断开连接：移除钱包监听器、释放适配器、重置状态并通知订阅者
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// 当前状态快照
    pub fn get_state(&self) -> ConnectionState {
        self.inner.session().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session().state.is_connected()
    }

    pub fn active_adapter(&self) -> Option<Arc<dyn ChainAdapter>> {
        self.inner.session().adapter.clone()
    }

    pub fn has_wallet(&self) -> bool {
        self.inner.wallet.is_some()
    }

    pub fn networks(&self) -> &NetworkTable {
        &self.inner.networks
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.inner.registry
    }

    /// 订阅状态变化；订阅时立即以当前状态回调一次
    pub fn subscribe(&self, listener: StateListener) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener.clone()));

        let state = self.get_state();
        invoke_isolated(&listener, &state);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ManagerInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 开始新的连接尝试：拆除旧会话，进入 Connecting，返回本次请求代数
    fn begin(&self, network: Option<NetworkConfig>) -> u64 {
        let (generation, old) = {
            let mut session = self.session();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let old = std::mem::replace(
                &mut *session,
                Session {
                    state: ConnectionState::Connecting { network },
                    ..Default::default()
                },
            );
            (generation, old)
        };

        self.teardown(old);
        self.notify();
        generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// 代数未变化时应用新会话；被取代的结果直接丢弃
    fn commit(&self, generation: u64, next: Session) -> bool {
        let stale = {
            let mut session = self.session();
            if self.is_current(generation) {
                *session = next;
                None
            } else {
                Some((next, session.adapter.clone()))
            }
        };

        if let Some((stale, current)) = stale {
            tracing::debug!(
                generation = generation,
                current = self.generation.load(Ordering::SeqCst),
                "Discarding stale connection result"
            );
            drop(stale.subscription);
            // 当前会话复用的同一实例不能释放
            if let Some(adapter) = stale.adapter {
                let in_use = current
                    .as_ref()
                    .map(|current| Arc::ptr_eq(current, &adapter))
                    .unwrap_or(false);
                if !in_use {
                    self.release_adapter(&adapter);
                }
            }
            return false;
        }

        self.notify();
        true
    }

    fn fail(&self, generation: u64, cause: CoreError) {
        self.commit(
            generation,
            Session {
                state: ConnectionState::Error { cause },
                ..Default::default()
            },
        );
    }

    /// 无需等待 I/O 的失败（没有钱包、未知网络）：直接进入 Error
    fn fail_now(&self, cause: CoreError) -> ConnectionState {
        let (old, state) = {
            let mut session = self.session();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let state = ConnectionState::Error { cause };
            let old = std::mem::replace(
                &mut *session,
                Session {
                    state: state.clone(),
                    ..Default::default()
                },
            );
            (old, state)
        };

        self.teardown(old);
        self.notify();
        state
    }

    fn disconnect(&self) {
        let old = {
            let mut session = self.session();
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut *session)
        };
        let was_connected = old.state.is_connected();

        self.teardown(old);
        if was_connected {
            tracing::info!("Disconnected");
        }
        self.notify();
    }

    /// 释放旧会话持有的资源（在锁外执行）
    fn teardown(&self, old: Session) {
        drop(old.subscription);
        if let Some(adapter) = old.adapter {
            self.release_adapter(&adapter);
        }
    }

    /// 只移除注册表中仍是同一实例的适配器
    fn release_adapter(&self, adapter: &Arc<dyn ChainAdapter>) {
        let id = adapter.network_id();
        let registered = self
            .registry
            .get_adapter(id)
            .map(|current| Arc::ptr_eq(&current, adapter))
            .unwrap_or(false);
        if registered {
            self.registry.remove_adapter(id);
        } else {
            adapter.release();
        }
    }

    /// 通过注册表解析适配器；已有适配器绑定在别的传输上时先替换
    fn resolve_adapter(
        &self,
        chain_id: u64,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<dyn ChainAdapter>> {
        let adapter = self
            .registry
            .find_adapter_for_chain_id(chain_id, transport.clone())?;
        if same_transport(&adapter.transport(), &transport) {
            return Some(adapter);
        }

        self.registry.remove_adapter(adapter.network_id());
        self.registry.find_adapter_for_chain_id(chain_id, transport)
    }

    fn dispatch(weak: &Weak<ManagerInner>, event: &WalletEvent) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            WalletEvent::AccountsChanged(accounts) => inner.apply_accounts(accounts),
            WalletEvent::ChainChanged(chain_id) => inner.apply_chain_change(*chain_id),
            WalletEvent::Disconnect { code, message } => {
                tracing::info!(code = code, message = %message, "Wallet reported disconnect");
                inner.disconnect();
            }
        }
    }

    fn apply_accounts(&self, accounts: &[String]) {
        let Some(account) = accounts.first() else {
            tracing::info!("Wallet returned no accounts, disconnecting");
            self.disconnect();
            return;
        };

        let changed = {
            let mut session = self.session();
            match &mut session.state {
                ConnectionState::Connected {
                    mode: ConnectionMode::Wallet { account: current },
                    ..
                } if current != account => {
                    *current = account.clone();
                    true
                }
                _ => false,
            }
        };

        if changed {
            tracing::info!(account = %account, "Wallet account changed");
            self.notify();
        }
    }

    /// 钱包链变化：当前适配器仍兼容则保留，否则解析新适配器并替换，之后再发布
    fn apply_chain_change(&self, chain_id: u64) {
        let (transport, current) = {
            let session = self.session();
            match &session.state {
                ConnectionState::Connected {
                    mode: ConnectionMode::Wallet { .. },
                    chain_id: current_chain,
                    transport,
                    ..
                } => {
                    if *current_chain == chain_id {
                        return;
                    }
                    (transport.clone(), session.adapter.clone())
                }
                _ => return,
            }
        };

        let kept = current
            .as_ref()
            .filter(|adapter| adapter.is_compatible(chain_id))
            .cloned();
        let (adapter, replaced) = match kept {
            Some(adapter) => (Some(adapter), None),
            None => {
                if let Some(old) = &current {
                    self.release_adapter(old);
                }
                (self.resolve_adapter(chain_id, transport.clone()), current)
            }
        };

        let applied = {
            let mut session = self.session();
            let network = self.networks.get_by_chain_id(chain_id).cloned();
            match &mut session.state {
                ConnectionState::Connected {
                    mode: ConnectionMode::Wallet { .. },
                    chain_id: current_chain,
                    network: current_network,
                    transport: current_transport,
                } if same_transport(current_transport, &transport) => {
                    *current_chain = chain_id;
                    *current_network = network;
                    session.adapter = adapter.clone();
                    true
                }
                _ => false,
            }
        };

        if applied {
            tracing::info!(
                chain_id = chain_id,
                adapter = ?adapter.as_ref().map(|a| a.network_id()),
                replaced = replaced.is_some(),
                "Wallet chain changed"
            );
            self.notify();
        }
    }

    /// 以当前完整状态通知所有订阅者（遍历快照，单个订阅者 panic 不影响其它订阅者）
    fn notify(&self) {
        let state = self.session().state.clone();
        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            invoke_isolated(&listener, &state);
        }
    }
}

fn invoke_isolated(listener: &StateListener, state: &ConnectionState) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(state))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(panic = %message, "Connection state listener panicked");
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// `eth_requestAccounts` 等返回值的账户列表
fn parse_accounts(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testing::{MockTransportFactory, MockWallet};

    const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";

    fn manager(wallet: Option<Arc<MockWallet>>) -> ConnectionManager {
        let networks = Arc::new(NetworkTable::new());
        let registry = Arc::new(AdapterRegistry::new(networks.clone()));
        ConnectionManager::new(
            networks,
            registry,
            Arc::new(MockTransportFactory::new()),
            wallet.map(|w| w as Arc<dyn WalletProvider>),
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn test_connect_wallet_without_wallet() {
        let manager = manager(None);
        let state = manager.connect_wallet().await;
        assert_eq!(state.error(), Some(&CoreError::NoWallet));
        assert!(state.account().is_none());
    }

    #[tokio::test]
    async fn test_user_rejection_is_captured() {
        let wallet = Arc::new(MockWallet::new(vec![ACCOUNT], 1));
        wallet.reject_requests(true);
        let manager = manager(Some(wallet.clone()));

        let state = manager.connect_wallet().await;
        assert_eq!(state.error(), Some(&CoreError::UserRejected));
        assert_eq!(wallet.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_account_change_updates_state() {
        let wallet = Arc::new(MockWallet::new(vec![ACCOUNT], 1));
        let manager = manager(Some(wallet.clone()));
        manager.connect_wallet().await;

        let other = "0x2222222222222222222222222222222222222222";
        wallet.emit(WalletEvent::AccountsChanged(vec![other.to_string()]));
        assert_eq!(manager.get_state().account(), Some(other));
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let manager = manager(None);
        let calls = Arc::new(AtomicUsize::new(0));

        manager.subscribe(Arc::new(|_state: &ConnectionState| panic!("listener failure")));
        let counter = calls.clone();
        manager.subscribe(Arc::new(move |_state: &ConnectionState| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.disconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_commit_releases_its_adapter() {
        let manager = manager(None);
        let inner = &manager.inner;
        let network = inner.networks.get(NetworkId::Bsc).cloned().unwrap();

        let generation = inner.begin(Some(network.clone()));
        let transport = inner.transports.rpc_transport(&network).unwrap();
        let adapter = inner.resolve_adapter(network.chain_id, transport.clone()).unwrap();
        // 解析适配器之后、提交之前发生断开
        manager.disconnect();

        let committed = inner.commit(
            generation,
            Session {
                state: ConnectionState::Connected {
                    mode: ConnectionMode::Rpc,
                    chain_id: network.chain_id,
                    network: Some(network),
                    transport,
                },
                adapter: Some(adapter.clone()),
                subscription: None,
            },
        );

        assert!(!committed);
        assert!(!manager.is_connected());
        assert!(inner.registry.is_empty());
        assert!(adapter.is_released());
    }

    #[tokio::test]
    async fn test_stale_commit_keeps_adapter_shared_with_current_session() {
        let manager = manager(None);
        let inner = &manager.inner;
        let network = inner.networks.get(NetworkId::Polygon).cloned().unwrap();

        let generation = inner.begin(Some(network.clone()));
        let transport = inner.transports.rpc_transport(&network).unwrap();
        let adapter = inner.resolve_adapter(network.chain_id, transport.clone()).unwrap();

        // 更新的连接已提交并持有同一个适配器
        let newer = inner.begin(Some(network.clone()));
        let current_state = ConnectionState::Connected {
            mode: ConnectionMode::Rpc,
            chain_id: network.chain_id,
            network: Some(network.clone()),
            transport: transport.clone(),
        };
        assert!(inner.commit(
            newer,
            Session {
                state: current_state.clone(),
                adapter: Some(adapter.clone()),
                subscription: None,
            },
        ));

        let committed = inner.commit(
            generation,
            Session {
                state: current_state,
                adapter: Some(adapter.clone()),
                subscription: None,
            },
        );

        assert!(!committed);
        assert!(manager.is_connected());
        assert!(!adapter.is_released());
        let active = manager.active_adapter().unwrap();
        assert!(Arc::ptr_eq(&active, &adapter));
        assert_eq!(inner.registry.len(), 1);
    }

    #[test]
    fn test_parse_accounts() {
        assert_eq!(
            parse_accounts(&json!([ACCOUNT, 1, null])),
            vec![ACCOUNT.to_string()]
        );
        assert!(parse_accounts(&json!("0x1")).is_empty());
    }
}
