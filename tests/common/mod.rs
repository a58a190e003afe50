//! 测试辅助模块
//! 提供 Mock 连接环境和缓存配置

#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ironconnect::{
    config::CacheConfig,
    domain::{ConnectionState, ConnectionStatus, NetworkTable},
    infrastructure::{transport::TransportFactory, wallet::WalletProvider},
    service::{AdapterRegistry, ConnectionManager},
    testing::{MockTransportFactory, MockWallet},
};

pub const ACCOUNT: &str = "0x1111111111111111111111111111111111111111";
pub const OTHER_ACCOUNT: &str = "0x2222222222222222222222222222222222222222";

/// 一次测试使用的完整连接环境
pub struct Harness {
    pub networks: Arc<NetworkTable>,
    pub factory: Arc<MockTransportFactory>,
    pub registry: Arc<AdapterRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub wallet: Option<Arc<MockWallet>>,
}

pub fn harness(wallet: Option<Arc<MockWallet>>) -> Harness {
    harness_with(NetworkTable::new(), wallet, Duration::from_secs(10))
}

pub fn harness_with(
    networks: NetworkTable,
    wallet: Option<Arc<MockWallet>>,
    connect_timeout: Duration,
) -> Harness {
    let networks = Arc::new(networks);
    let factory = Arc::new(MockTransportFactory::new());
    let registry = Arc::new(AdapterRegistry::new(networks.clone()));
    let manager = Arc::new(ConnectionManager::new(
        networks.clone(),
        registry.clone(),
        factory.clone() as Arc<dyn TransportFactory>,
        wallet.clone().map(|w| w as Arc<dyn WalletProvider>),
        connect_timeout,
    ));

    Harness {
        networks,
        factory,
        registry,
        manager,
        wallet,
    }
}

pub fn wallet_on(chain_id: u64) -> Arc<MockWallet> {
    Arc::new(MockWallet::new(vec![ACCOUNT], chain_id))
}

/// 记录订阅者收到的每个状态
pub fn record_statuses(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.subscribe(Arc::new(move |state: &ConnectionState| {
        sink.lock().unwrap().push(state.status());
    }));
    seen
}

/// 断开后所有字段都应为空
pub fn assert_fully_disconnected(state: &ConnectionState) {
    assert_eq!(state.status(), ConnectionStatus::Disconnected);
    assert!(state.account().is_none());
    assert!(state.chain_id().is_none());
    assert!(state.network().is_none());
    assert!(state.transport().is_none());
    assert!(state.error().is_none());
}

pub fn cache_config(max_size: usize) -> CacheConfig {
    CacheConfig {
        namespace: "ironconnect:test:".to_string(),
        max_size,
        default_ttl_secs: 300,
        sweep_interval_secs: 60,
    }
}
