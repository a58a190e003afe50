//! 连接状态
//!
//! 每个状态分支只携带该分支合法的字段，非法组合（例如 Error 状态带账户）无法表示。

use std::{fmt, sync::Arc};

use serde::Serialize;

use crate::{
    domain::chain_config::NetworkConfig, error::CoreError, infrastructure::transport::Transport,
};

/// 连接状态（对外展示用的扁平枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// 连接方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 注入钱包（带签名账户）
    Wallet { account: String },
    /// 只读 RPC（无签名者）
    Rpc,
}

/// 连接状态快照
#[derive(Clone, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting {
        network: Option<NetworkConfig>,
    },
    Connected {
        mode: ConnectionMode,
        chain_id: u64,
        /// 钱包位于未配置的链上时为 None
        network: Option<NetworkConfig>,
        transport: Arc<dyn Transport>,
    },
    Error {
        cause: CoreError,
    },
}

impl ConnectionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            ConnectionState::Disconnected => ConnectionStatus::Disconnected,
            ConnectionState::Connecting { .. } => ConnectionStatus::Connecting,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Error { .. } => ConnectionStatus::Error,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn mode(&self) -> Option<&ConnectionMode> {
        match self {
            ConnectionState::Connected { mode, .. } => Some(mode),
            _ => None,
        }
    }

    /// 仅钱包连接时存在账户
    pub fn account(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected {
                mode: ConnectionMode::Wallet { account },
                ..
            } => Some(account.as_str()),
            _ => None,
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            ConnectionState::Connected { chain_id, .. } => Some(*chain_id),
            _ => None,
        }
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        match self {
            ConnectionState::Connecting { network } => network.as_ref(),
            ConnectionState::Connected { network, .. } => network.as_ref(),
            _ => None,
        }
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        match self {
            ConnectionState::Connected { transport, .. } => Some(transport),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CoreError> {
        match self {
            ConnectionState::Error { cause } => Some(cause),
            _ => None,
        }
    }

    pub fn is_wallet(&self) -> bool {
        matches!(self.mode(), Some(ConnectionMode::Wallet { .. }))
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("status", &self.status())
            .field("account", &self.account())
            .field("chain_id", &self.chain_id())
            .field("network", &self.network().map(|n| n.id))
            .field("transport", &self.transport().map(|t| t.kind()))
            .field("error", &self.error())
            .finish()
    }
}
