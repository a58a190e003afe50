//! 传输层：适配器通过它发出 JSON-RPC 调用
//!
//! - `HttpTransport`：直连网络配置中的 RPC 端点（只读，无签名者）
//! - `WalletTransport`：经由注入钱包转发请求（可签名）

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ethers::providers::{Http, Provider, RpcError};
use serde::Serialize;
use serde_json::Value;

use crate::{
    domain::chain_config::NetworkConfig,
    error::{CoreError, CoreResult},
    infrastructure::wallet::WalletProvider,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Wallet,
}

/// JSON-RPC 传输句柄
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// 端点描述（仅用于日志）
    fn endpoint(&self) -> String;

    async fn request(&self, method: &str, params: Value) -> CoreResult<Value>;
}

/// 直连 HTTP JSON-RPC 端点
pub struct HttpTransport {
    url: String,
    provider: Provider<Http>,
}

impl HttpTransport {
    pub fn new(url: &str, request_timeout: Duration) -> CoreResult<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| CoreError::rpc(None, format!("invalid rpc url {}: {}", url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Ok(Self {
            url: url.to_string(),
            provider: Provider::new(Http::new_with_client(parsed, client)),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn request(&self, method: &str, params: Value) -> CoreResult<Value> {
        tracing::trace!(method = %method, endpoint = %self.url, "rpc request");

        self.provider
            .request::<Value, Value>(method, params)
            .await
            .map_err(|e| {
                let code = e.as_error_response().map(|r| r.code);
                let message = e
                    .as_error_response()
                    .map(|r| r.message.clone())
                    .unwrap_or_else(|| e.to_string());
                tracing::debug!(method = %method, endpoint = %self.url, error = %message, "rpc request failed");
                CoreError::rpc(code, message)
            })
    }
}

/// 通过注入钱包转发的传输
pub struct WalletTransport {
    wallet: Arc<dyn WalletProvider>,
}

impl WalletTransport {
    pub fn new(wallet: Arc<dyn WalletProvider>) -> Self {
        Self { wallet }
    }
}

#[async_trait]
impl Transport for WalletTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Wallet
    }

    fn endpoint(&self) -> String {
        "injected-wallet".to_string()
    }

    async fn request(&self, method: &str, params: Value) -> CoreResult<Value> {
        self.wallet.request(method, params).await
    }
}

/// 为网络创建只读 RPC 传输
pub trait TransportFactory: Send + Sync {
    fn rpc_transport(&self, network: &NetworkConfig) -> CoreResult<Arc<dyn Transport>>;
}

/// 默认工厂：HTTP JSON-RPC
pub struct HttpTransportFactory {
    request_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TransportFactory for HttpTransportFactory {
    fn rpc_transport(&self, network: &NetworkConfig) -> CoreResult<Arc<dyn Transport>> {
        let transport = HttpTransport::new(&network.rpc_url, self.request_timeout)?;
        Ok(Arc::new(transport))
    }
}
