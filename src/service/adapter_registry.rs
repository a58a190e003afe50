//! 适配器注册表
//!
//! 每个网络最多一个存活适配器；按网络或链 ID 惰性创建并复用。
//! 插入新适配器时，声明兼容相同链 ID 的旧适配器会被释放，
//! 保证任一链 ID 最多只有一个存活适配器与之兼容。

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    domain::chain_config::{NetworkConfig, NetworkId, NetworkTable},
    infrastructure::transport::Transport,
    service::{chain_adapter::ChainAdapter, network_adapters::AdapterFactory},
};

pub struct AdapterRegistry {
    networks: Arc<NetworkTable>,
    adapters: Mutex<HashMap<NetworkId, Arc<dyn ChainAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(networks: Arc<NetworkTable>) -> Self {
        Self {
            networks,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn networks(&self) -> &NetworkTable {
        &self.networks
    }

    fn adapters(&self) -> MutexGuard<'_, HashMap<NetworkId, Arc<dyn ChainAdapter>>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 返回该网络已有的适配器，否则创建、存储并在后台初始化
    pub fn create_adapter(
        &self,
        network: &NetworkConfig,
        transport: Arc<dyn Transport>,
    ) -> Arc<dyn ChainAdapter> {
        let (adapter, displaced) = {
            let mut adapters = self.adapters();
            if let Some(existing) = adapters.get(&network.id) {
                return existing.clone();
            }

            let adapter = AdapterFactory::create(network.clone(), transport);
            let conflicting: Vec<NetworkId> = adapters
                .iter()
                .filter(|(_, existing)| conflicts(existing.as_ref(), adapter.as_ref()))
                .map(|(id, _)| *id)
                .collect();
            let displaced: Vec<Arc<dyn ChainAdapter>> = conflicting
                .iter()
                .filter_map(|id| adapters.remove(id))
                .collect();

            adapters.insert(network.id, adapter.clone());
            (adapter, displaced)
        };

        for old in displaced {
            tracing::warn!(
                network = %old.network_id(),
                replaced_by = %network.id,
                "Releasing adapter with overlapping chain compatibility"
            );
            old.release();
        }

        tracing::info!(
            network = %network.id,
            chain_id = network.chain_id,
            family = ?adapter.family(),
            transport = ?adapter.transport().kind(),
            "Chain adapter created"
        );
        spawn_initialize(adapter.clone());
        adapter
    }

    /// 先查找兼容该链 ID 的已有适配器，否则按静态网络表解析网络再创建；
    /// 没有配置匹配的网络时返回 None
    pub fn find_adapter_for_chain_id(
        &self,
        chain_id: u64,
        transport: Arc<dyn Transport>,
    ) -> Option<Arc<dyn ChainAdapter>> {
        let existing = self
            .adapters()
            .values()
            .find(|adapter| adapter.is_compatible(chain_id))
            .cloned();
        if existing.is_some() {
            return existing;
        }

        let network = self.networks.get_by_chain_id(chain_id)?.clone();
        Some(self.create_adapter(&network, transport))
    }

    pub fn get_adapter(&self, id: NetworkId) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters().get(&id).cloned()
    }

    /// 释放并移除适配器；不存在时返回 false
    pub fn remove_adapter(&self, id: NetworkId) -> bool {
        let removed = self.adapters().remove(&id);
        match removed {
            Some(adapter) => {
                adapter.release();
                tracing::info!(network = %id, "Chain adapter removed");
                true
            }
            None => false,
        }
    }

    pub fn clear_adapters(&self) {
        let drained: Vec<Arc<dyn ChainAdapter>> =
            self.adapters().drain().map(|(_, adapter)| adapter).collect();
        for adapter in &drained {
            adapter.release();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Chain adapters cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.adapters().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前持有适配器的网络（按链 ID 排序）
    pub fn active_networks(&self) -> Vec<NetworkId> {
        let mut active: Vec<(u64, NetworkId)> = self
            .adapters()
            .values()
            .map(|a| (a.network().chain_id, a.network_id()))
            .collect();
        active.sort();
        active.into_iter().map(|(_, id)| id).collect()
    }
}

fn conflicts(a: &dyn ChainAdapter, b: &dyn ChainAdapter) -> bool {
    a.compatible_chain_ids().iter().any(|id| b.is_compatible(*id))
        || b.compatible_chain_ids().iter().any(|id| a.is_compatible(*id))
}

/// 初始化在后台进行；失败只记录，适配器仍可使用
fn spawn_initialize(adapter: Arc<dyn ChainAdapter>) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            tracing::warn!(network = %adapter.network_id(), "No tokio runtime available, adapter initialization skipped");
            return;
        }
    };

    handle.spawn(async move {
        if let Err(e) = adapter.initialize().await {
            tracing::warn!(network = %adapter.network_id(), error = %e, "Adapter initialization failed");
        }
    });
}
