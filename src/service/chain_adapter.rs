//! 链适配器抽象
//!
//! `ChainAdapter` 定义所有网络共享的能力集合；各网络变体只在兼容性判断、
//! 出块时间、费用模型与确认时间估算上不同，通用操作全部委托给 `BaseAdapter`。

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use ethers::{
    abi::{self, Event, Function, RawLog, Token},
    types::{
        Address, BlockNumber, Bytes, Filter, Log, Transaction, TransactionReceipt,
        TransactionRequest, H256, U256, U64,
    },
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::{
    domain::chain_config::{NetworkConfig, NetworkId},
    error::{CoreError, CoreResult},
    infrastructure::transport::{Transport, TransportKind},
    utils::chain_normalizer::chain_id_from_value,
};

/// 1 gwei
pub const GWEI: u64 = 1_000_000_000;
/// `eth_maxPriorityFeePerGas` 不可用时的优先费（1.5 gwei）
pub const FALLBACK_PRIORITY_FEE_WEI: u64 = 1_500_000_000;

/// 链家族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Ethereum,
    Bsc,
    Polygon,
    GenericEvm,
}

/// 费用模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeModel {
    /// 单一 gasPrice
    Legacy,
    /// baseFee + priorityFee
    Eip1559,
}

/// 费用数据（wei）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub base_fee_per_gas: Option<U256>,
}

impl FeeData {
    pub fn is_eip1559(&self) -> bool {
        self.max_fee_per_gas.is_some()
    }
}

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

/// wei 转 gwei（展示用）
pub fn wei_to_gwei(wei: U256) -> f64 {
    ethers::utils::format_units(wei, "gwei")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(f64::MAX)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BaseAdapter：通用 JSON-RPC 实现
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct BaseAdapter {
    network: NetworkConfig,
    transport: Arc<dyn Transport>,
    initialized: AtomicBool,
    released: AtomicBool,
}

impl BaseAdapter {
    pub fn new(network: NetworkConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            network,
            transport,
            initialized: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(network = %self.network.id, "Adapter released");
        }
    }

    async fn rpc<R: DeserializeOwned>(&self, method: &str, params: Value) -> CoreResult<R> {
        if self.is_released() {
            return Err(CoreError::NotConnected);
        }
        let raw = self.transport.request(method, params).await?;
        serde_json::from_value(raw).map_err(|e| CoreError::invalid_response(method, e))
    }

    /// 验证传输可用（读取链 ID）
    pub async fn initialize(&self) -> CoreResult<()> {
        let reported = self
            .chain_id()
            .await
            .map_err(|e| CoreError::AdapterInitialization {
                network: self.network.name.clone(),
                reason: e.to_string(),
            })?;

        if reported != self.network.chain_id {
            tracing::debug!(
                network = %self.network.id,
                configured = self.network.chain_id,
                reported = reported,
                "Transport reports a different chain id than configured"
            );
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(network = %self.network.id, endpoint = %self.transport.endpoint(), "Adapter initialized");
        Ok(())
    }

    pub async fn chain_id(&self) -> CoreResult<u64> {
        let raw: Value = self.rpc("eth_chainId", json!([])).await?;
        chain_id_from_value(&raw)
            .ok_or_else(|| CoreError::invalid_response("eth_chainId", format!("unexpected value {}", raw)))
    }

    pub async fn get_block_number(&self) -> CoreResult<u64> {
        let number: U64 = self.rpc("eth_blockNumber", json!([])).await?;
        Ok(number.as_u64())
    }

    pub async fn get_balance(&self, address: Address, block: Option<BlockNumber>) -> CoreResult<U256> {
        self.rpc(
            "eth_getBalance",
            json!([address, block.unwrap_or(BlockNumber::Latest)]),
        )
        .await
    }

    pub async fn get_code(&self, address: Address) -> CoreResult<Bytes> {
        self.rpc("eth_getCode", json!([address, BlockNumber::Latest]))
            .await
    }

    pub async fn get_transaction(&self, hash: H256) -> CoreResult<Option<Transaction>> {
        self.rpc("eth_getTransactionByHash", json!([hash])).await
    }

    pub async fn get_transaction_receipt(&self, hash: H256) -> CoreResult<Option<TransactionReceipt>> {
        self.rpc("eth_getTransactionReceipt", json!([hash])).await
    }

    /// 需要钱包签名；只读 RPC 连接没有签名者
    pub async fn send_transaction(&self, tx: &TransactionRequest) -> CoreResult<H256> {
        if self.transport.kind() != TransportKind::Wallet {
            return Err(CoreError::NoWallet);
        }
        let hash: H256 = self.rpc("eth_sendTransaction", json!([tx])).await?;
        tracing::info!(network = %self.network.id, tx_hash = %format!("{:#x}", hash), "Transaction submitted");
        Ok(hash)
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> CoreResult<H256> {
        let hash: H256 = self.rpc("eth_sendRawTransaction", json!([raw])).await?;
        tracing::info!(network = %self.network.id, tx_hash = %format!("{:#x}", hash), "Raw transaction broadcast");
        Ok(hash)
    }

    /// 轮询回执直到达到确认数或超时
    pub async fn wait_for_transaction(
        &self,
        hash: H256,
        confirmations: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> CoreResult<TransactionReceipt> {
        tokio::time::timeout(
            timeout,
            self.poll_receipt(hash, confirmations.max(1), poll_interval),
        )
        .await
        .map_err(|_| CoreError::TransactionTimeout {
            tx_hash: format!("{:#x}", hash),
            timeout_secs: timeout.as_secs(),
        })?
    }

    async fn poll_receipt(
        &self,
        hash: H256,
        confirmations: u64,
        poll_interval: Duration,
    ) -> CoreResult<TransactionReceipt> {
        loop {
            if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                if let Some(mined_at) = receipt.block_number {
                    let current = self.get_block_number().await?;
                    if current.saturating_sub(mined_at.as_u64()) + 1 >= confirmations {
                        return Ok(receipt);
                    }
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> CoreResult<U256> {
        self.rpc("eth_estimateGas", json!([tx])).await
    }

    pub async fn get_gas_price(&self) -> CoreResult<U256> {
        self.rpc("eth_gasPrice", json!([])).await
    }

    /// 费用数据：Legacy 只返回 gasPrice；EIP-1559 额外读取最新区块 baseFee 与优先费
    ///
    /// maxFee = 2 * baseFee + priorityFee，priorityFee 不低于 `min_priority_fee`
    pub async fn get_fee_data(&self, model: FeeModel, min_priority_fee: U256) -> CoreResult<FeeData> {
        let gas_price = self.get_gas_price().await?;
        let legacy = FeeData {
            gas_price: Some(gas_price),
            ..Default::default()
        };
        if model == FeeModel::Legacy {
            return Ok(legacy);
        }

        let block: Value = self
            .rpc("eth_getBlockByNumber", json!([BlockNumber::Latest, false]))
            .await?;
        let base_fee = block
            .get("baseFeePerGas")
            .and_then(|v| serde_json::from_value::<U256>(v.clone()).ok());
        let Some(base_fee) = base_fee else {
            // 未启用 London 的链
            return Ok(legacy);
        };

        let priority_fee = match self
            .rpc::<U256>("eth_maxPriorityFeePerGas", json!([]))
            .await
        {
            Ok(fee) => fee,
            Err(e) => {
                tracing::debug!(network = %self.network.id, error = %e, "eth_maxPriorityFeePerGas unavailable, using fallback");
                U256::from(FALLBACK_PRIORITY_FEE_WEI)
            }
        }
        .max(min_priority_fee);

        Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: Some(base_fee * 2 + priority_fee),
            max_priority_fee_per_gas: Some(priority_fee),
            base_fee_per_gas: Some(base_fee),
        })
    }

    pub async fn call(&self, tx: &TransactionRequest, block: Option<BlockNumber>) -> CoreResult<Bytes> {
        self.rpc(
            "eth_call",
            json!([tx, block.unwrap_or(BlockNumber::Latest)]),
        )
        .await
    }

    /// ABI 级只读合约调用
    pub async fn call_function(
        &self,
        to: Address,
        function: &Function,
        args: &[Token],
    ) -> CoreResult<Vec<Token>> {
        let data = function
            .encode_input(args)
            .map_err(|e| CoreError::invalid_response(&function.name, format!("encode: {}", e)))?;
        let tx = TransactionRequest::new().to(to).data(data);
        let output = self.call(&tx, None).await?;
        function
            .decode_output(&output)
            .map_err(|e| CoreError::invalid_response(&function.name, format!("decode: {}", e)))
    }

    pub async fn get_logs(&self, filter: &Filter) -> CoreResult<Vec<Log>> {
        self.rpc("eth_getLogs", json!([filter])).await
    }

    /// 查询合约事件并按 ABI 解码
    pub async fn query_events(
        &self,
        address: Address,
        event: &Event,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> CoreResult<Vec<abi::Log>> {
        let filter = Filter::new()
            .address(address)
            .topic0(event.signature())
            .from_block(from_block)
            .to_block(to_block);

        self.get_logs(&filter)
            .await?
            .into_iter()
            .map(|log| {
                event
                    .parse_log(RawLog {
                        topics: log.topics,
                        data: log.data.to_vec(),
                    })
                    .map_err(|e| CoreError::invalid_response("eth_getLogs", e))
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChainAdapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 按网络的链操作策略
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn base(&self) -> &BaseAdapter;

    fn family(&self) -> ChainFamily;

    /// 该适配器声明兼容的全部链 ID
    fn compatible_chain_ids(&self) -> Vec<u64>;

    /// 名义出块时间
    fn block_time(&self) -> Duration;

    fn fee_model(&self) -> FeeModel;

    /// 确认时间分档：(最低 gas 价格 gwei, 区块数)，按价格从高到低排列
    fn confirmation_tiers(&self) -> &'static [(f64, u32)];

    fn min_priority_fee(&self) -> U256 {
        U256::zero()
    }

    fn is_compatible(&self, chain_id: u64) -> bool {
        self.compatible_chain_ids().contains(&chain_id)
    }

    /// 按当前费用水平估算确认时间
    fn estimate_confirmation_time(&self, gas_price_gwei: f64) -> Duration {
        let tiers = self.confirmation_tiers();
        let blocks = tiers
            .iter()
            .find(|(min_gwei, _)| gas_price_gwei >= *min_gwei)
            .or_else(|| tiers.last())
            .map(|(_, blocks)| *blocks)
            .unwrap_or(1);
        self.block_time() * blocks
    }

    fn network(&self) -> &NetworkConfig {
        self.base().network()
    }

    fn network_id(&self) -> NetworkId {
        self.base().network().id
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.base().transport()
    }

    fn is_initialized(&self) -> bool {
        self.base().is_initialized()
    }

    fn is_released(&self) -> bool {
        self.base().is_released()
    }

    /// 释放资源；之后的调用返回 `NotConnected`
    fn release(&self) {
        self.base().release()
    }

    async fn initialize(&self) -> CoreResult<()> {
        self.base().initialize().await
    }

    async fn chain_id(&self) -> CoreResult<u64> {
        self.base().chain_id().await
    }

    async fn get_block_number(&self) -> CoreResult<u64> {
        self.base().get_block_number().await
    }

    async fn get_balance(&self, address: Address) -> CoreResult<U256> {
        self.base().get_balance(address, None).await
    }

    async fn get_code(&self, address: Address) -> CoreResult<Bytes> {
        self.base().get_code(address).await
    }

    async fn get_transaction(&self, hash: H256) -> CoreResult<Option<Transaction>> {
        self.base().get_transaction(hash).await
    }

    async fn get_transaction_receipt(&self, hash: H256) -> CoreResult<Option<TransactionReceipt>> {
        self.base().get_transaction_receipt(hash).await
    }

    async fn send_transaction(&self, tx: &TransactionRequest) -> CoreResult<H256> {
        self.base().send_transaction(tx).await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> CoreResult<H256> {
        self.base().send_raw_transaction(raw).await
    }

    /// 以出块时间为轮询间隔等待确认
    async fn wait_for_transaction(
        &self,
        hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> CoreResult<TransactionReceipt> {
        self.base()
            .wait_for_transaction(hash, confirmations, timeout, self.block_time())
            .await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> CoreResult<U256> {
        self.base().estimate_gas(tx).await
    }

    async fn get_gas_price(&self) -> CoreResult<U256> {
        self.base().get_gas_price().await
    }

    async fn get_fee_data(&self) -> CoreResult<FeeData> {
        self.base()
            .get_fee_data(self.fee_model(), self.min_priority_fee())
            .await
    }

    async fn call(&self, tx: &TransactionRequest) -> CoreResult<Bytes> {
        self.base().call(tx, None).await
    }

    async fn call_function(
        &self,
        to: Address,
        function: &Function,
        args: &[Token],
    ) -> CoreResult<Vec<Token>> {
        self.base().call_function(to, function, args).await
    }

    async fn get_logs(&self, filter: &Filter) -> CoreResult<Vec<Log>> {
        self.base().get_logs(filter).await
    }

    async fn query_events(
        &self,
        address: Address,
        event: &Event,
        from_block: BlockNumber,
        to_block: BlockNumber,
    ) -> CoreResult<Vec<abi::Log>> {
        self.base()
            .query_events(address, event, from_block, to_block)
            .await
    }
}

impl fmt::Debug for dyn ChainAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainAdapter")
            .field("network", &self.network_id())
            .field("family", &self.family())
            .field("chain_id", &self.network().chain_id)
            .field("transport", &self.transport().kind())
            .finish()
    }
}
