use std::sync::Arc;

use serde_json::Value;

use crate::{
    config::Config,
    domain::chain_config::NetworkTable,
    infrastructure::{
        result_cache::ResultCache,
        storage::{DurableStore, MemoryStore, RedisStore},
        transport::{HttpTransportFactory, TransportFactory},
        wallet::WalletProvider,
    },
    service::{
        adapter_registry::AdapterRegistry, chain_lookup::ChainLookupService,
        connection_manager::ConnectionManager,
    },
};

/// 应用状态
///
/// 进程启动时构造一次并注入各调用方，测试可以随时构造新的实例
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub networks: Arc<NetworkTable>,
    pub registry: Arc<AdapterRegistry>,
    pub manager: Arc<ConnectionManager>,
    pub cache: ResultCache<Value>,
    pub lookup: Arc<ChainLookupService>,
}

impl AppState {
    /// 使用 HTTP 传输创建应用状态
    pub async fn new(
        config: Arc<Config>,
        wallet: Option<Arc<dyn WalletProvider>>,
    ) -> anyhow::Result<Self> {
        let transports = Arc::new(HttpTransportFactory::new(config.connection.request_timeout()));
        Self::with_transports(config, transports, wallet).await
    }

    pub async fn with_transports(
        config: Arc<Config>,
        transports: Arc<dyn TransportFactory>,
        wallet: Option<Arc<dyn WalletProvider>>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let networks = Arc::new(config.network_table());
        let registry = Arc::new(AdapterRegistry::new(networks.clone()));
        let manager = Arc::new(ConnectionManager::new(
            networks.clone(),
            registry.clone(),
            transports,
            wallet,
            config.connection.connect_timeout(),
        ));

        let store = durable_store(&config).await;
        let cache = ResultCache::with_store(&config.cache, store).await;
        cache.start_sweeper(config.cache.sweep_interval());

        let lookup = Arc::new(ChainLookupService::new(
            manager.clone(),
            cache.clone(),
            config.cache.default_ttl(),
        ));

        tracing::info!(
            networks = networks.len(),
            wallet = manager.has_wallet(),
            cached_entries = cache.len(),
            "Application state initialized"
        );

        Ok(Self {
            config,
            networks,
            registry,
            manager,
            cache,
            lookup,
        })
    }

    /// 断开连接、释放所有适配器，并等待排队的缓存写入完成
    pub async fn shutdown(&self) {
        self.manager.disconnect();
        self.registry.clear_adapters();
        self.cache.stop_sweeper();
        self.cache.flush().await;
    }
}

/// 配置了 Redis 且可达时使用 Redis，否则退回内存存储
async fn durable_store(config: &Config) -> Arc<dyn DurableStore> {
    let Some(url) = config.storage.redis_url.as_deref() else {
        return Arc::new(MemoryStore::new());
    };

    match RedisStore::connect(url).await {
        Ok(store) => {
            tracing::info!("Using Redis for cache persistence");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, falling back to in-memory cache store");
            Arc::new(MemoryStore::new())
        }
    }
}
