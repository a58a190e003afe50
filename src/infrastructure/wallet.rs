//! 注入钱包能力（EIP-1193 风格）
//!
//! 钱包事件以类型化回调注册；`WalletSubscription` 持有注册句柄，
//! 在 Drop 时移除全部监听器，保证每条断开路径都会释放。

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreResult;

/// 钱包事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletEventKind {
    AccountsChanged,
    ChainChanged,
    Disconnect,
}

impl WalletEventKind {
    pub const ALL: [WalletEventKind; 3] = [
        WalletEventKind::AccountsChanged,
        WalletEventKind::ChainChanged,
        WalletEventKind::Disconnect,
    ];

    /// EIP-1193 事件名
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletEventKind::AccountsChanged => "accountsChanged",
            WalletEventKind::ChainChanged => "chainChanged",
            WalletEventKind::Disconnect => "disconnect",
        }
    }
}

/// 钱包事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(u64),
    Disconnect { code: i64, message: String },
}

impl WalletEvent {
    pub fn kind(&self) -> WalletEventKind {
        match self {
            WalletEvent::AccountsChanged(_) => WalletEventKind::AccountsChanged,
            WalletEvent::ChainChanged(_) => WalletEventKind::ChainChanged,
            WalletEvent::Disconnect { .. } => WalletEventKind::Disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

pub type WalletListener = Arc<dyn Fn(&WalletEvent) + Send + Sync>;

/// 浏览器注入钱包
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// JSON-RPC 风格请求（eth_requestAccounts、wallet_switchEthereumChain …）
    async fn request(&self, method: &str, params: Value) -> CoreResult<Value>;

    fn add_listener(&self, kind: WalletEventKind, listener: WalletListener) -> ListenerId;

    fn remove_listener(&self, kind: WalletEventKind, id: ListenerId) -> bool;
}

/// 监听器注册守卫（acquire-on-connect, release-on-drop）
pub struct WalletSubscription {
    wallet: Arc<dyn WalletProvider>,
    registrations: Vec<(WalletEventKind, ListenerId)>,
}

impl WalletSubscription {
    /// 为所有事件类型注册同一个处理器
    pub fn attach(wallet: Arc<dyn WalletProvider>, handler: WalletListener) -> Self {
        let registrations = WalletEventKind::ALL
            .iter()
            .map(|kind| (*kind, wallet.add_listener(*kind, handler.clone())))
            .collect();

        Self {
            wallet,
            registrations,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.len()
    }
}

impl Drop for WalletSubscription {
    fn drop(&mut self) {
        for (kind, id) in self.registrations.drain(..) {
            if !self.wallet.remove_listener(kind, id) {
                tracing::debug!(event = kind.as_str(), "wallet listener already removed");
            }
        }
    }
}

impl fmt::Debug for WalletSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletSubscription")
            .field("registrations", &self.registrations)
            .finish()
    }
}
