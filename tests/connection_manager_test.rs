//! ConnectionManager 集成测试
//!
//! 覆盖：
//! - 钱包 / RPC 连接与断开
//! - 钱包事件（账户变化、链变化、断开）
//! - 网络切换（含钱包未注册链的添加流程）
//! - 超时与过期连接结果丢弃
//! - 订阅者通知与隔离

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use common::*;
use ironconnect::{
    domain::{
        chain_config::default_networks, ConnectionMode, ConnectionState, ConnectionStatus,
        NetworkId, NetworkTable,
    },
    error::CoreError,
    infrastructure::wallet::WalletEvent,
    service::ChainFamily,
    testing::MockTransport,
};

// ============ 连接与断开 ============

#[tokio::test]
async fn connect_rpc_to_bsc_yields_connected_without_account() {
    let h = harness(None);
    let state = h.manager.connect_rpc(NetworkId::Bsc).await;

    assert_eq!(state.status(), ConnectionStatus::Connected);
    assert_eq!(state.chain_id(), Some(56));
    assert!(state.account().is_none());
    assert_eq!(state.mode(), Some(&ConnectionMode::Rpc));
    assert_eq!(state.network().map(|n| n.id), Some(NetworkId::Bsc));

    let adapter = h.manager.active_adapter().unwrap();
    assert_eq!(adapter.family(), ChainFamily::Bsc);
}

#[tokio::test]
async fn connect_wallet_publishes_account_and_adapter() {
    let wallet = wallet_on(137);
    let h = harness(Some(wallet.clone()));
    let seen = record_statuses(&h.manager);

    let state = h.manager.connect_wallet().await;
    assert_eq!(state.account(), Some(ACCOUNT));
    assert_eq!(state.chain_id(), Some(137));
    assert!(state.is_wallet());
    assert_eq!(wallet.listener_count(), 3);
    assert_eq!(
        h.manager.active_adapter().map(|a| a.family()),
        Some(ChainFamily::Polygon)
    );

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected
        ]
    );
}

#[tokio::test]
async fn wallet_on_unconfigured_chain_connects_without_network() {
    let wallet = wallet_on(31337);
    let h = harness(Some(wallet));

    let state = h.manager.connect_wallet().await;
    assert!(state.is_connected());
    assert_eq!(state.chain_id(), Some(31337));
    assert!(state.network().is_none());
    assert!(h.manager.active_adapter().is_none());
}

#[tokio::test]
async fn connect_wallet_without_wallet_is_error_state() {
    let h = harness(None);
    let state = h.manager.connect_wallet().await;
    assert_eq!(state.status(), ConnectionStatus::Error);
    assert_eq!(state.error(), Some(&CoreError::NoWallet));
    assert!(!h.manager.has_wallet());
}

#[tokio::test]
async fn empty_authorization_is_user_rejection() {
    let wallet = Arc::new(ironconnect::testing::MockWallet::new(vec![], 1));
    let h = harness(Some(wallet));
    let state = h.manager.connect_wallet().await;
    assert_eq!(state.error(), Some(&CoreError::UserRejected));
}

#[tokio::test]
async fn disconnect_resets_every_field_after_any_sequence() {
    let wallet = wallet_on(1);
    let h = harness(Some(wallet.clone()));

    // 从未连接
    h.manager.disconnect();
    assert_fully_disconnected(&h.manager.get_state());

    // 钱包连接
    h.manager.connect_wallet().await;
    h.manager.disconnect();
    assert_fully_disconnected(&h.manager.get_state());
    assert_eq!(wallet.listener_count(), 0);

    // RPC 连接
    h.manager.connect_rpc(NetworkId::Polygon).await;
    h.manager.disconnect();
    assert_fully_disconnected(&h.manager.get_state());

    // 钱包连接 → 切链 → RPC 连接 → 断开
    h.manager.connect_wallet().await;
    wallet.add_known_chain(56);
    assert!(h.manager.switch_network(NetworkId::Bsc).await);
    h.manager.connect_rpc(NetworkId::Ethereum).await;
    assert_eq!(wallet.listener_count(), 0);
    h.manager.disconnect();
    h.manager.disconnect();
    assert_fully_disconnected(&h.manager.get_state());
    assert_eq!(wallet.listener_count(), 0);
    assert!(h.manager.active_adapter().is_none());
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn disconnect_releases_active_adapter() {
    let h = harness(None);
    h.manager.connect_rpc(NetworkId::Arbitrum).await;
    let adapter = h.manager.active_adapter().unwrap();
    assert_eq!(adapter.family(), ChainFamily::GenericEvm);

    h.manager.disconnect();
    assert!(adapter.is_released());
    assert!(h.registry.get_adapter(NetworkId::Arbitrum).is_none());
}

// ============ RPC 失败路径 ============

#[tokio::test]
async fn connect_rpc_times_out() {
    let h = harness_with(NetworkTable::new(), None, Duration::from_millis(50));
    h.factory.insert(
        NetworkId::Ethereum,
        Arc::new(MockTransport::new(1).with_delay(Duration::from_millis(300))),
    );

    let state = h.manager.connect_rpc(NetworkId::Ethereum).await;
    assert!(matches!(
        state.error(),
        Some(CoreError::ConnectionTimeout { network, .. }) if network == "Ethereum"
    ));

    // 迟到的握手结果不得改变状态
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.manager.get_state().status(), ConnectionStatus::Error);
    assert!(h.manager.active_adapter().is_none());
}

#[tokio::test]
async fn superseded_connect_is_discarded() {
    let h = harness(None);
    h.factory.insert(
        NetworkId::Ethereum,
        Arc::new(MockTransport::new(1).with_delay(Duration::from_millis(100))),
    );

    let (slow, fast) = tokio::join!(
        h.manager.connect_rpc(NetworkId::Ethereum),
        h.manager.connect_rpc(NetworkId::Bsc),
    );

    assert_eq!(fast.chain_id(), Some(56));
    // 较早发起的慢连接完成时已被取代
    assert_eq!(slow.chain_id(), Some(56));
    let state = h.manager.get_state();
    assert_eq!(state.chain_id(), Some(56));
    assert_eq!(
        h.manager.active_adapter().map(|a| a.network_id()),
        Some(NetworkId::Bsc)
    );
}

#[tokio::test]
async fn connect_rpc_rejects_chain_id_mismatch() {
    let h = harness(None);
    h.factory
        .insert(NetworkId::Bsc, Arc::new(MockTransport::new(1)));

    let state = h.manager.connect_rpc(NetworkId::Bsc).await;
    assert!(matches!(state.error(), Some(CoreError::InvalidResponse { .. })));
}

#[tokio::test]
async fn connect_rpc_unknown_network_is_unsupported() {
    let configs = default_networks()
        .into_iter()
        .filter(|n| n.id != NetworkId::Arbitrum)
        .collect();
    let h = harness_with(NetworkTable::from_configs(configs), None, Duration::from_secs(10));

    let state = h.manager.connect_rpc(NetworkId::Arbitrum).await;
    assert!(matches!(state.error(), Some(CoreError::UnsupportedNetwork(_))));
}

#[tokio::test]
async fn transport_construction_failure_is_rpc_error() {
    let h = harness(None);
    h.factory.mark_unavailable(NetworkId::Sepolia);

    let state = h.manager.connect_rpc(NetworkId::Sepolia).await;
    assert!(matches!(state.error(), Some(CoreError::Rpc { .. })));
}

// ============ 网络切换 ============

#[tokio::test]
async fn switch_network_from_disconnected_connects_rpc() {
    let h = harness(None);
    assert!(h.manager.switch_network(NetworkId::Polygon).await);
    assert_eq!(h.manager.get_state().chain_id(), Some(137));
    assert_eq!(h.manager.get_state().mode(), Some(&ConnectionMode::Rpc));
}

#[tokio::test]
async fn switch_network_over_rpc_replaces_connection() {
    let h = harness(None);
    h.manager.connect_rpc(NetworkId::Ethereum).await;
    let old = h.manager.active_adapter().unwrap();

    assert!(h.manager.switch_network(NetworkId::Bsc).await);
    assert_eq!(h.manager.get_state().chain_id(), Some(56));
    assert!(old.is_released());
    assert_eq!(h.registry.active_networks(), vec![NetworkId::Bsc]);
}

#[tokio::test]
async fn switch_to_unregistered_chain_add_failure_leaves_state_unchanged() {
    let wallet = wallet_on(1);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;
    let before = h.manager.get_state();
    let adapter_before = h.manager.active_adapter().unwrap();

    wallet.fail_add_chain(true);
    assert!(!h.manager.switch_network(NetworkId::Polygon).await);

    let after = h.manager.get_state();
    assert_eq!(after.status(), before.status());
    assert_eq!(after.chain_id(), Some(1));
    assert_eq!(after.account(), before.account());
    assert!(Arc::ptr_eq(&h.manager.active_adapter().unwrap(), &adapter_before));
    assert_eq!(wallet.request_count("wallet_addEthereumChain"), 1);

    // 添加成功后切换成功
    wallet.fail_add_chain(false);
    assert!(h.manager.switch_network(NetworkId::Polygon).await);
    let state = h.manager.get_state();
    assert_eq!(state.chain_id(), Some(137));
    assert_eq!(state.account(), Some(ACCOUNT));
    assert!(wallet.is_known_chain(137));
    assert_eq!(
        h.manager.active_adapter().map(|a| a.family()),
        Some(ChainFamily::Polygon)
    );
    assert!(adapter_before.is_released());
}

#[tokio::test]
async fn switch_on_known_chain_skips_registration() {
    let wallet = wallet_on(1);
    wallet.add_known_chain(11155111);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;

    assert!(h.manager.switch_network(NetworkId::Sepolia).await);
    assert_eq!(h.manager.get_state().chain_id(), Some(11155111));
    assert_eq!(wallet.request_count("wallet_addEthereumChain"), 0);
    assert_eq!(wallet.request_count("wallet_switchEthereumChain"), 1);
}

// ============ 钱包事件 ============

#[tokio::test]
async fn empty_accounts_event_disconnects() {
    let wallet = wallet_on(1);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;

    wallet.emit(WalletEvent::AccountsChanged(vec![]));
    assert_fully_disconnected(&h.manager.get_state());
    assert_eq!(wallet.listener_count(), 0);
}

#[tokio::test]
async fn wallet_disconnect_event_disconnects() {
    let wallet = wallet_on(56);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;

    wallet.emit(WalletEvent::Disconnect {
        code: 1013,
        message: "Disconnected from chain".into(),
    });
    assert_fully_disconnected(&h.manager.get_state());
    assert_eq!(wallet.listener_count(), 0);
}

#[tokio::test]
async fn account_change_keeps_connection() {
    let wallet = wallet_on(1);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;
    let seen = record_statuses(&h.manager);

    wallet.emit(WalletEvent::AccountsChanged(vec![OTHER_ACCOUNT.into()]));
    let state = h.manager.get_state();
    assert_eq!(state.account(), Some(OTHER_ACCOUNT));
    assert_eq!(state.chain_id(), Some(1));

    // 相同账户不重复通知
    wallet.emit(WalletEvent::AccountsChanged(vec![OTHER_ACCOUNT.into()]));
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn chain_change_keeps_compatible_adapter() {
    let wallet = wallet_on(56);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;
    let bsc = h.manager.active_adapter().unwrap();

    // BSC 适配器兼容测试网 97
    wallet.emit(WalletEvent::ChainChanged(97));
    let state = h.manager.get_state();
    assert_eq!(state.chain_id(), Some(97));
    assert!(state.network().is_none());
    assert!(Arc::ptr_eq(&h.manager.active_adapter().unwrap(), &bsc));
    assert!(!bsc.is_released());
}

#[tokio::test]
async fn chain_change_swaps_incompatible_adapter_before_publishing() {
    let wallet = wallet_on(56);
    let h = harness(Some(wallet.clone()));
    h.manager.connect_wallet().await;
    let bsc = h.manager.active_adapter().unwrap();

    let manager = h.manager.clone();
    let observed: Arc<Mutex<Vec<(Option<u64>, Option<u64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    h.manager.subscribe(Arc::new(move |state: &ConnectionState| {
        let adapter_chain = manager.active_adapter().map(|a| a.network().chain_id);
        sink.lock().unwrap().push((state.chain_id(), adapter_chain));
    }));

    wallet.emit(WalletEvent::ChainChanged(137));

    assert!(bsc.is_released());
    let observed = observed.lock().unwrap();
    // 发布时适配器已经替换完毕
    assert_eq!(observed.last(), Some(&(Some(137), Some(137))));
    assert_eq!(h.registry.active_networks(), vec![NetworkId::Polygon]);
}

// ============ 订阅者 ============

#[tokio::test]
async fn subscriber_receives_current_state_immediately() {
    let h = harness(None);
    h.manager.connect_rpc(NetworkId::Bsc).await;

    let seen = record_statuses(&h.manager);
    assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Connected]);
}

#[tokio::test]
async fn listener_may_unsubscribe_itself_during_notification() {
    let h = harness(None);
    let calls = Arc::new(AtomicUsize::new(0));
    let own_id = Arc::new(Mutex::new(None));

    let manager = h.manager.clone();
    let counter = calls.clone();
    let id_slot = own_id.clone();
    let id = h.manager.subscribe(Arc::new(move |state: &ConnectionState| {
        counter.fetch_add(1, Ordering::SeqCst);
        if state.is_connected() {
            if let Some(id) = *id_slot.lock().unwrap() {
                manager.unsubscribe(id);
            }
        }
    }));
    *own_id.lock().unwrap() = Some(id);
    let others = record_statuses(&h.manager);

    h.manager.connect_rpc(NetworkId::Bsc).await;
    h.manager.disconnect();

    // 初始 + Connecting + Connected，之后不再收到
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.manager.subscriber_count(), 1);
    assert_eq!(others.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn panicking_listener_does_not_block_others() {
    let h = harness(None);
    h.manager
        .subscribe(Arc::new(|state: &ConnectionState| {
            if state.is_connected() {
                panic!("renderer crashed");
            }
        }));
    let seen = record_statuses(&h.manager);

    h.manager.connect_rpc(NetworkId::Polygon).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected
        ]
    );
}

#[tokio::test]
async fn unsubscribe_unknown_id_returns_false() {
    let h = harness(None);
    let id = h.manager.subscribe(Arc::new(|_: &ConnectionState| {}));
    assert!(h.manager.unsubscribe(id));
    assert!(!h.manager.unsubscribe(id));
    assert_eq!(h.manager.subscriber_count(), 0);
}
