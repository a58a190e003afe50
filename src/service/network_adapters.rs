//! 各网络的适配器实现
//!
//! 变体之间只在兼容链 ID、出块时间、费用模型和确认时间分档上不同。

use std::{sync::Arc, time::Duration};

use ethers::types::U256;

use crate::{
    domain::chain_config::{NetworkConfig, NetworkId},
    infrastructure::transport::Transport,
    service::chain_adapter::{gwei, BaseAdapter, ChainAdapter, ChainFamily, FeeModel},
};

/// BSC 主网 / 测试网
const BSC_CHAIN_IDS: [u64; 2] = [56, 97];
/// Polygon 主网 / Amoy 测试网
const POLYGON_CHAIN_IDS: [u64; 2] = [137, 80002];
/// Polygon 验证者要求的最低优先费
const POLYGON_MIN_PRIORITY_FEE_GWEI: u64 = 30;

fn with_network_chain(network: &NetworkConfig, known: &[u64]) -> Vec<u64> {
    let mut ids = vec![network.chain_id];
    ids.extend(known.iter().copied().filter(|id| *id != network.chain_id));
    ids
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ethereum（主网与 Sepolia）
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EthereumAdapter {
    base: BaseAdapter,
}

impl EthereumAdapter {
    pub fn new(network: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: BaseAdapter::new(network, transport),
        }
    }
}

impl ChainAdapter for EthereumAdapter {
    fn base(&self) -> &BaseAdapter {
        &self.base
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Ethereum
    }

    fn compatible_chain_ids(&self) -> Vec<u64> {
        vec![self.base.network().chain_id]
    }

    fn block_time(&self) -> Duration {
        Duration::from_secs(12)
    }

    fn fee_model(&self) -> FeeModel {
        FeeModel::Eip1559
    }

    fn confirmation_tiers(&self) -> &'static [(f64, u32)] {
        &[(50.0, 1), (30.0, 2), (15.0, 3), (0.0, 5)]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BNB Smart Chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BscAdapter {
    base: BaseAdapter,
}

impl BscAdapter {
    pub fn new(network: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: BaseAdapter::new(network, transport),
        }
    }
}

impl ChainAdapter for BscAdapter {
    fn base(&self) -> &BaseAdapter {
        &self.base
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Bsc
    }

    fn compatible_chain_ids(&self) -> Vec<u64> {
        with_network_chain(self.base.network(), &BSC_CHAIN_IDS)
    }

    fn block_time(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// BSC 验证者按 gasPrice 打包
    fn fee_model(&self) -> FeeModel {
        FeeModel::Legacy
    }

    fn confirmation_tiers(&self) -> &'static [(f64, u32)] {
        &[(5.0, 1), (3.0, 2), (0.0, 4)]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Polygon PoS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PolygonAdapter {
    base: BaseAdapter,
}

impl PolygonAdapter {
    pub fn new(network: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: BaseAdapter::new(network, transport),
        }
    }
}

impl ChainAdapter for PolygonAdapter {
    fn base(&self) -> &BaseAdapter {
        &self.base
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::Polygon
    }

    fn compatible_chain_ids(&self) -> Vec<u64> {
        with_network_chain(self.base.network(), &POLYGON_CHAIN_IDS)
    }

    fn block_time(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn fee_model(&self) -> FeeModel {
        FeeModel::Eip1559
    }

    fn min_priority_fee(&self) -> U256 {
        gwei(POLYGON_MIN_PRIORITY_FEE_GWEI)
    }

    fn confirmation_tiers(&self) -> &'static [(f64, u32)] {
        &[(100.0, 1), (50.0, 2), (30.0, 3), (0.0, 6)]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 通用 EVM（没有专用实现的网络）
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GenericEvmAdapter {
    base: BaseAdapter,
}

impl GenericEvmAdapter {
    pub fn new(network: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            base: BaseAdapter::new(network, transport),
        }
    }
}

impl ChainAdapter for GenericEvmAdapter {
    fn base(&self) -> &BaseAdapter {
        &self.base
    }

    fn family(&self) -> ChainFamily {
        ChainFamily::GenericEvm
    }

    fn compatible_chain_ids(&self) -> Vec<u64> {
        vec![self.base.network().chain_id]
    }

    fn block_time(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn fee_model(&self) -> FeeModel {
        FeeModel::Eip1559
    }

    fn confirmation_tiers(&self) -> &'static [(f64, u32)] {
        &[(1.0, 1), (0.0, 3)]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 适配器工厂
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AdapterFactory;

impl AdapterFactory {
    /// 根据网络构造对应的适配器变体
    pub fn create(network: NetworkConfig, transport: Arc<dyn Transport>) -> Arc<dyn ChainAdapter> {
        match network.id {
            NetworkId::Ethereum | NetworkId::Sepolia => {
                Arc::new(EthereumAdapter::new(network, transport))
            }
            NetworkId::Bsc => Arc::new(BscAdapter::new(network, transport)),
            NetworkId::Polygon => Arc::new(PolygonAdapter::new(network, transport)),
            NetworkId::Arbitrum => {
                tracing::warn!(
                    network = %network.id,
                    chain_id = network.chain_id,
                    "No dedicated adapter for network, using generic EVM adapter"
                );
                Arc::new(GenericEvmAdapter::new(network, transport))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::chain_config::NetworkTable, testing::MockTransport};

    fn adapter_for(id: NetworkId) -> Arc<dyn ChainAdapter> {
        let table = NetworkTable::new();
        let network = table.get(id).cloned().unwrap();
        let transport = Arc::new(MockTransport::new(network.chain_id));
        AdapterFactory::create(network, transport)
    }

    #[test]
    fn test_factory_selects_variant() {
        assert_eq!(adapter_for(NetworkId::Ethereum).family(), ChainFamily::Ethereum);
        assert_eq!(adapter_for(NetworkId::Sepolia).family(), ChainFamily::Ethereum);
        assert_eq!(adapter_for(NetworkId::Bsc).family(), ChainFamily::Bsc);
        assert_eq!(adapter_for(NetworkId::Polygon).family(), ChainFamily::Polygon);
        assert_eq!(adapter_for(NetworkId::Arbitrum).family(), ChainFamily::GenericEvm);
    }

    #[test]
    fn test_compatibility_predicates() {
        let eth = adapter_for(NetworkId::Ethereum);
        assert!(eth.is_compatible(1));
        assert!(!eth.is_compatible(11155111));

        let bsc = adapter_for(NetworkId::Bsc);
        assert!(bsc.is_compatible(56));
        assert!(bsc.is_compatible(97));
        assert!(!bsc.is_compatible(1));

        let polygon = adapter_for(NetworkId::Polygon);
        assert!(polygon.is_compatible(137));
        assert!(polygon.is_compatible(80002));

        let arb = adapter_for(NetworkId::Arbitrum);
        assert_eq!(arb.compatible_chain_ids(), vec![42161]);
    }

    #[test]
    fn test_fee_models_and_block_times() {
        assert_eq!(adapter_for(NetworkId::Bsc).fee_model(), FeeModel::Legacy);
        assert_eq!(adapter_for(NetworkId::Ethereum).fee_model(), FeeModel::Eip1559);
        assert_eq!(adapter_for(NetworkId::Polygon).min_priority_fee(), gwei(30));
        assert_eq!(adapter_for(NetworkId::Ethereum).min_priority_fee(), U256::zero());
        assert_eq!(adapter_for(NetworkId::Ethereum).block_time(), Duration::from_secs(12));
    }

    #[test]
    fn test_confirmation_time_heuristic() {
        let eth = adapter_for(NetworkId::Ethereum);
        assert_eq!(eth.estimate_confirmation_time(80.0), Duration::from_secs(12));
        assert_eq!(eth.estimate_confirmation_time(20.0), Duration::from_secs(36));
        assert_eq!(eth.estimate_confirmation_time(1.0), Duration::from_secs(60));

        let bsc = adapter_for(NetworkId::Bsc);
        assert_eq!(bsc.estimate_confirmation_time(5.0), Duration::from_secs(3));
        assert_eq!(bsc.estimate_confirmation_time(1.0), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn test_polygon_fee_data_applies_floor() {
        let polygon = adapter_for(NetworkId::Polygon);
        let fees = polygon.get_fee_data().await.unwrap();
        assert_eq!(fees.max_priority_fee_per_gas, Some(gwei(30)));

        let bsc = adapter_for(NetworkId::Bsc);
        assert!(!bsc.get_fee_data().await.unwrap().is_eip1559());
    }
}
