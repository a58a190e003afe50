//! TTL 结果缓存
//!
//! - 容量上限：插入新键且已达上限时淘汰插入时间最早的条目
//! - 过期判定：`now >= expires_at`（ttl = 0 的条目总是未命中）
//! - 可选持久化：条目以 JSON 写入 `DurableStore`，键带命名空间前缀，
//!   构造时重新加载未过期条目（超出容量时丢弃最早插入的条目）
//! - 存储 I/O 由后台写入任务按顺序执行，`get` / `set` 只持有内存锁
//! - 后台清扫任务定期删除过期条目（持有 Weak 引用，缓存释放后自动退出）

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    config::CacheConfig,
    error::{CoreError, StoreError},
    infrastructure::{
        cache_key::{key_matches_address, key_matches_chain},
        storage::DurableStore,
    },
    utils::time_utils::current_timestamp_ms,
};

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    /// 插入时间（毫秒）
    pub inserted_at: i64,
    /// 过期时间（毫秒），None 表示永不过期
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub block_number: Option<u64>,
    /// 同一毫秒内插入顺序的决胜序号
    #[serde(default)]
    pub seq: u64,
    #[serde(skip)]
    persisted: bool,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(expires_at) if now_ms >= expires_at)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }
}

/// 写入选项
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// None 表示永不过期
    pub ttl: Option<Duration>,
    /// None 时使用缓存配置的容量
    pub max_size: Option<usize>,
    pub persist: bool,
    pub block_number: Option<u64>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn persist(mut self) -> Self {
        self.persist = true;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// 交给写入任务的存储操作（键均已带命名空间前缀）
enum StoreOp {
    Persist {
        key: String,
        payload: String,
        seq: u64,
    },
    Remove(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

struct CacheInner<T> {
    namespace: String,
    max_size: usize,
    writer: Option<mpsc::UnboundedSender<StoreOp>>,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = sweeper.take() {
            handle.abort();
        }
    }
}

/// 结果缓存（克隆共享同一份存储）
pub struct ResultCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ResultCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ResultCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// 仅内存缓存
    pub fn new(config: &CacheConfig) -> Self {
        Self::build(config, None)
    }

    /// 带持久化存储的缓存
    ///
    /// 先重新加载已持久化的条目，再启动写入任务，必须在 tokio 运行时内调用
    pub async fn with_store(config: &CacheConfig, store: Arc<dyn DurableStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cache = Self::build(config, Some(tx));
        cache.reload(store.as_ref()).await;

        tokio::spawn(run_writer(
            store,
            config.namespace.clone(),
            Arc::downgrade(&cache.inner),
            rx,
        ));
        cache
    }

    fn build(config: &CacheConfig, writer: Option<mpsc::UnboundedSender<StoreOp>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                namespace: config.namespace.clone(),
                max_size: config.max_size,
                writer,
                entries: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<T>>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.namespace, key)
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// 写入条目
    pub fn set(&self, key: &str, value: T, options: SetOptions) {
        let now = current_timestamp_ms();
        let expires_at = options
            .ttl
            .map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)));
        let max_size = options.max_size.unwrap_or(self.inner.max_size);
        let persist = options.persist && self.inner.writer.is_some();

        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        let mut entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at,
            block_number: options.block_number,
            seq,
            persisted: false,
        };

        let payload = if persist {
            match serde_json::to_string(&entry) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to serialize cache entry");
                    None
                }
            }
        } else {
            None
        };
        entry.persisted = payload.is_some();

        let (evicted, replaced_persisted) = {
            let mut entries = self.entries();
            let mut evicted = None;

            if !entries.contains_key(key) && entries.len() >= max_size {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| (e.inserted_at, e.seq))
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    evicted = entries.remove(&oldest).map(|e| (oldest, e.persisted));
                }
            }

            let replaced = entries.insert(key.to_string(), entry);
            (evicted, replaced.map(|e| e.persisted).unwrap_or(false))
        };

        if let Some((evicted_key, evicted_persisted)) = evicted {
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %evicted_key, max_size = max_size, "Cache entry evicted");
            if evicted_persisted {
                self.remove_durable(&evicted_key);
            }
        }

        match payload {
            Some(payload) => self.enqueue(StoreOp::Persist {
                key: self.durable_key(key),
                payload,
                seq,
            }),
            // 旧值已持久化但新值不持久化时，删除过时副本
            None if replaced_persisted => self.remove_durable(key),
            None => {}
        }
    }

    /// 读取未过期的值；过期条目被删除并计为未命中
    pub fn get(&self, key: &str) -> Option<T> {
        let now = current_timestamp_ms();
        let (value, expired_persisted) = {
            let mut entries = self.entries();
            match entries.get(key).map(|e| e.is_expired(now)) {
                Some(true) => (None, remove_persisted(&mut entries, key)),
                Some(false) => (entries.get(key).map(|e| e.value.clone()), false),
                None => (None, false),
            }
        };

        if expired_persisted {
            self.remove_durable(key);
        }

        if value.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// 与 `get` 相同的过期判定，不计入命中统计
    pub fn has(&self, key: &str) -> bool {
        let now = current_timestamp_ms();
        let (present, expired_persisted) = {
            let mut entries = self.entries();
            match entries.get(key).map(|e| e.is_expired(now)) {
                Some(true) => (false, remove_persisted(&mut entries, key)),
                Some(false) => (true, false),
                None => (false, false),
            }
        };

        if expired_persisted {
            self.remove_durable(key);
        }
        present
    }

    /// 条目关联的区块号（不影响统计）
    pub fn block_number(&self, key: &str) -> Option<u64> {
        let now = current_timestamp_ms();
        self.entries()
            .get(key)
            .filter(|e| !e.is_expired(now))
            .and_then(|e| e.block_number)
    }

    /// 精确键存在时删除该键，否则按前缀批量删除；返回删除数量
    pub fn invalidate(&self, key_or_prefix: &str) -> usize {
        let removed = {
            let mut entries = self.entries();
            match entries.remove(key_or_prefix) {
                Some(entry) => vec![(key_or_prefix.to_string(), entry.persisted)],
                None => drain_where(&mut entries, |k, _| k.starts_with(key_or_prefix)),
            }
        };
        self.finish_removal(removed)
    }

    /// 删除键中编码了该地址的所有条目（大小写不敏感）
    pub fn invalidate_for_address(&self, address: &str) -> usize {
        let removed = drain_where(&mut self.entries(), |k, _| key_matches_address(k, address));
        let count = self.finish_removal(removed);
        if count > 0 {
            tracing::debug!(address = %address, removed = count, "Invalidated cache entries for address");
        }
        count
    }

    /// 删除键中编码了该链 ID 的所有条目
    pub fn invalidate_for_chain(&self, chain_id: u64) -> usize {
        let removed = drain_where(&mut self.entries(), |k, _| key_matches_chain(k, chain_id));
        let count = self.finish_removal(removed);
        if count > 0 {
            tracing::debug!(chain_id = chain_id, removed = count, "Invalidated cache entries for chain");
        }
        count
    }

    /// 清空内存与持久化存储
    pub fn clear(&self) {
        self.entries().clear();
        self.enqueue(StoreOp::Clear);
    }

    /// 等待此前排队的存储操作全部完成
    pub async fn flush(&self) {
        let Some(writer) = &self.inner.writer else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if writer.send(StoreOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 删除所有过期条目；返回删除数量
    pub fn sweep_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let expired = drain_where(&mut self.entries(), |_, e| e.is_expired(now));
        self.finish_removal(expired)
    }

    /// 启动后台清扫任务；重复调用会先停止旧任务，保证只有一个定时器
    ///
    /// 不在 tokio 运行时内调用时返回 false
    pub fn start_sweeper(&self, interval: Duration) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("No tokio runtime available, cache sweeper not started");
                return false;
            }
        };

        let weak: Weak<CacheInner<T>> = Arc::downgrade(&self.inner);
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // 第一次 tick 立即返回
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = ResultCache { inner }.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed = removed, "Cache sweep removed expired entries");
                }
            }
        });

        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        true
    }

    pub fn stop_sweeper(&self) {
        let previous = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 持久化
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn reload(&self, store: &dyn DurableStore) {
        let keys = match store.keys_with_prefix(&self.inner.namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, namespace = %self.inner.namespace, "Failed to enumerate persisted cache entries");
                return;
            }
        };

        let now = current_timestamp_ms();
        let mut loaded = Vec::new();
        let mut discarded = 0usize;

        for durable_key in keys {
            let Some(key) = durable_key.strip_prefix(&self.inner.namespace) else {
                continue;
            };

            let entry = match store.get(&durable_key).await {
                Ok(Some(raw)) => serde_json::from_str::<CacheEntry<T>>(&raw).ok(),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %durable_key, error = %e, "Failed to read persisted cache entry");
                    continue;
                }
            };

            match entry {
                Some(mut entry) if !entry.is_expired(now) => {
                    entry.persisted = true;
                    loaded.push((key.to_string(), entry));
                }
                // 过期或无法解析
                _ => {
                    discarded += 1;
                    remove_logged(store, &durable_key).await;
                }
            }
        }

        // 容量可能在两次运行之间调小
        loaded.sort_by_key(|(_, e)| (e.inserted_at, e.seq));
        let overflow = loaded.len().saturating_sub(self.inner.max_size);
        for (key, _) in loaded.drain(..overflow) {
            remove_logged(store, &self.durable_key(&key)).await;
        }
        self.inner
            .evictions
            .fetch_add(overflow as u64, Ordering::Relaxed);

        let next_seq = loaded.iter().map(|(_, e)| e.seq + 1).max().unwrap_or(0);
        self.inner.seq.fetch_max(next_seq, Ordering::SeqCst);

        let count = loaded.len();
        self.entries().extend(loaded);
        tracing::debug!(
            namespace = %self.inner.namespace,
            loaded = count,
            discarded = discarded,
            trimmed = overflow,
            "Reloaded persisted cache entries"
        );
    }

    fn enqueue(&self, op: StoreOp) {
        if let Some(writer) = &self.inner.writer {
            if writer.send(op).is_err() {
                tracing::warn!(namespace = %self.inner.namespace, "Cache writer stopped, dropping storage operation");
            }
        }
    }

    /// 写入失败时清除持久化标记（条目未被更新的写入覆盖时）
    fn mark_unpersisted(&self, key: &str, seq: u64) {
        if let Some(entry) = self.entries().get_mut(key) {
            if entry.seq == seq {
                entry.persisted = false;
            }
        }
    }

    fn remove_durable(&self, key: &str) {
        self.enqueue(StoreOp::Remove(self.durable_key(key)));
    }

    fn finish_removal(&self, removed: Vec<(String, bool)>) -> usize {
        for (key, persisted) in &removed {
            if *persisted {
                self.remove_durable(key);
            }
        }
        removed.len()
    }
}

/// 删除条目，返回它是否已持久化
fn remove_persisted<T>(entries: &mut HashMap<String, CacheEntry<T>>, key: &str) -> bool {
    entries.remove(key).map(|e| e.persisted).unwrap_or(false)
}

/// 从 map 中取出满足条件的键，返回 (键, 是否已持久化)
fn drain_where<T>(
    entries: &mut HashMap<String, CacheEntry<T>>,
    predicate: impl Fn(&str, &CacheEntry<T>) -> bool,
) -> Vec<(String, bool)> {
    let keys: Vec<String> = entries
        .iter()
        .filter(|(k, e)| predicate(k.as_str(), e))
        .map(|(k, _)| k.clone())
        .collect();
    keys.into_iter()
        .filter_map(|k| entries.remove(&k).map(|e| (k, e.persisted)))
        .collect()
}

/// 后台写入任务：按入队顺序执行存储操作，缓存释放（发送端关闭）后退出
async fn run_writer<T>(
    store: Arc<dyn DurableStore>,
    namespace: String,
    cache: Weak<CacheInner<T>>,
    mut ops: mpsc::UnboundedReceiver<StoreOp>,
) where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    while let Some(op) = ops.recv().await {
        match op {
            StoreOp::Persist { key, payload, seq } => {
                if let Err(e) = persist_with_retry(store.as_ref(), &namespace, &key, &payload).await {
                    let err = CoreError::from(e);
                    tracing::warn!(key = %key, error = %err, "Cache persistence failed");
                    if let (Some(inner), Some(cache_key)) = (cache.upgrade(), key.strip_prefix(&namespace)) {
                        ResultCache { inner }.mark_unpersisted(cache_key, seq);
                    }
                }
            }
            StoreOp::Remove(key) => remove_logged(store.as_ref(), &key).await,
            StoreOp::Clear => clear_namespace(store.as_ref(), &namespace).await,
            StoreOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(namespace = %namespace, "Cache writer stopped");
}

/// 配额耗尽时清空命名空间后重试一次
async fn persist_with_retry(
    store: &dyn DurableStore,
    namespace: &str,
    key: &str,
    payload: &str,
) -> Result<(), StoreError> {
    match store.set(key, payload).await {
        Err(StoreError::QuotaExceeded) => {
            tracing::warn!(key = %key, "Cache storage quota exceeded, clearing namespace and retrying");
            clear_namespace(store, namespace).await;
            store.set(key, payload).await
        }
        result => result,
    }
}

async fn remove_logged(store: &dyn DurableStore, key: &str) {
    if let Err(e) = store.remove(key).await {
        tracing::warn!(key = %key, error = %e, "Failed to remove persisted cache entry");
    }
}

/// 删除命名空间下的全部持久化条目（不影响内存）
async fn clear_namespace(store: &dyn DurableStore, namespace: &str) {
    match store.keys_with_prefix(namespace).await {
        Ok(keys) => {
            for key in keys {
                remove_logged(store, &key).await;
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, namespace = %namespace, "Failed to enumerate persisted cache entries");
        }
    }
}
