//! 统一错误类型
//!
//! 连接生命周期错误会被写入 `ConnectionState`，适配器级错误直接返回给调用方，
//! 缓存存储错误永远不致命。

use thiserror::Error;

/// JSON-RPC: 用户拒绝请求 (EIP-1193)
pub const RPC_CODE_USER_REJECTED: i64 = 4001;
/// JSON-RPC: 钱包不认识该链 (wallet_switchEthereumChain)
pub const RPC_CODE_UNRECOGNIZED_CHAIN: i64 = 4902;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("no injected wallet available")]
    NoWallet,

    #[error("user rejected the request")]
    UserRejected,

    #[error("connection to {network} timed out after {timeout_secs}s")]
    ConnectionTimeout { network: String, timeout_secs: u64 },

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("adapter initialization failed for {network}: {reason}")]
    AdapterInitialization { network: String, reason: String },

    #[error("rpc error{}: {message}", .code.map(|c| format!(" ({})", c)).unwrap_or_default())]
    Rpc { code: Option<i64>, message: String },

    #[error("cache storage error: {0}")]
    CacheStorage(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid response for {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    #[error("transaction {tx_hash} not confirmed within {timeout_secs}s")]
    TransactionTimeout { tx_hash: String, timeout_secs: u64 },
}

impl CoreError {
    /// 从 JSON-RPC 错误码构造（4001 视为用户拒绝）
    pub fn rpc(code: Option<i64>, message: impl Into<String>) -> Self {
        if code == Some(RPC_CODE_USER_REJECTED) {
            return Self::UserRejected;
        }
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_response(method: &str, reason: impl ToString) -> Self {
        Self::InvalidResponse {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    /// JSON-RPC 错误码（若有）
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::UserRejected => Some(RPC_CODE_USER_REJECTED),
            Self::Rpc { code, .. } => *code,
            _ => None,
        }
    }

    /// 稳定的错误码字符串，便于上层做映射
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoWallet => "no_wallet",
            Self::UserRejected => "user_rejected",
            Self::ConnectionTimeout { .. } => "connection_timeout",
            Self::UnsupportedNetwork(_) => "unsupported_network",
            Self::AdapterInitialization { .. } => "adapter_initialization",
            Self::Rpc { .. } => "rpc_error",
            Self::CacheStorage(_) => "cache_storage",
            Self::NotConnected => "not_connected",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::TransactionTimeout { .. } => "transaction_timeout",
        }
    }

    /// 展示给用户的简短消息
    pub fn user_message(&self) -> String {
        crate::error_map::humanize_error(&self.to_string())
    }
}

/// 持久化存储错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::CacheStorage(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
