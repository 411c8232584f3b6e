//! 两级缓存（L1 进程内 + L2 分布式键值存储）
//!
//! 查找顺序：L1 命中直接返回；否则查 L2，命中则原样复制进 L1（使用 L1 的 TTL）再返回；
//! 都未命中时交给调用方计算，调用方再 set，两级按各自 TTL 写入。
//!
//! 不做 single-flight：同一 key 的并发未命中可能各自计算一次。
//! L2 不可用时静默退化为仅 L1（错误记日志并计入 l2_failures）。

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::key::{CacheNamespace, QueryNormalizer};
use crate::config::CacheSection;
use crate::core::ResilientExecutor;
use crate::store::ResilientKv;

/// 条目所在层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    L1,
    L2,
}

/// 一次命中的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub payload: T,
    pub tier: Tier,
}

/// 缓存参数
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    pub l1_capacity: usize,
    pub max_key_len: usize,
}

impl CacheSettings {
    pub fn from_section(section: &CacheSection) -> Self {
        Self {
            l1_ttl: Duration::from_secs(section.l1_ttl_secs),
            l2_ttl: Duration::from_secs(section.l2_ttl_secs),
            l1_capacity: section.l1_capacity,
            max_key_len: section.max_key_len,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            l1_ttl: Duration::from_secs(600),
            l2_ttl: Duration::from_secs(1800),
            l1_capacity: 10_000,
            max_key_len: 200,
        }
    }
}

/// 统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l2_failures: u64,
}

impl CacheStatistics {
    /// (l1_hits + l2_hits) / 总查找次数；尚无查找时为 0
    pub fn hit_rate(&self) -> f64 {
        let hits = self.l1_hits + self.l2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    l2_failures: AtomicU64,
}

#[derive(Debug, Clone)]
struct L1Entry<T> {
    payload: T,
    written_at: Instant,
    ttl: Duration,
}

impl<T> L1Entry<T> {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) < self.ttl
    }
}

/// 两级缓存
pub struct TieredCache<T> {
    namespace: CacheNamespace,
    normalizer: QueryNormalizer,
    settings: CacheSettings,
    l1: DashMap<String, L1Entry<T>>,
    l2: Option<ResilientKv>,
    counters: CacheCounters,
}

impl<T> TieredCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// l2 为 None 时只使用进程内一级
    pub fn new(namespace: CacheNamespace, settings: CacheSettings, l2: Option<ResilientKv>) -> Self {
        Self {
            normalizer: QueryNormalizer::new(settings.max_key_len),
            namespace,
            settings,
            l1: DashMap::new(),
            l2,
            counters: CacheCounters::default(),
        }
    }

    pub fn with_normalizer(mut self, normalizer: QueryNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// 查询对应的完整缓存键
    pub fn key_for(&self, query: &str) -> String {
        self.namespace.key_for(&self.normalizer.normalize(query))
    }

    pub async fn get(&self, query: &str) -> Option<T> {
        self.lookup(query).await.map(|c| c.payload)
    }

    /// 按 L1 → L2 顺序查找，并返回命中层级
    pub async fn lookup(&self, query: &str) -> Option<Cached<T>> {
        let key = self.key_for(query);

        if let Some(payload) = self.l1_get(&key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(Cached {
                payload,
                tier: Tier::L1,
            });
        }

        if let Some(payload) = self.l2_get(&key).await {
            self.l1_put(key, payload.clone());
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
            return Some(Cached {
                payload,
                tier: Tier::L2,
            });
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// 两级写入；L2 失败不影响 L1
    pub async fn set(&self, query: &str, payload: T) {
        let key = self.key_for(query);

        if let Some(l2) = &self.l2 {
            match serde_json::to_string(&payload) {
                Ok(raw) => {
                    if let Err(e) = l2.set(&key, &raw, self.settings.l2_ttl).await {
                        self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            key = %key,
                            kind = %e.kind(),
                            detail = e.detail().unwrap_or(""),
                            "L2 cache write failed, continuing with L1 only"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(key = %key, "Cache payload not serializable, skipping L2: {}", e);
                }
            }
        }

        self.l1_put(key, payload);
    }

    /// 查找；未命中时执行 compute 并写回。compute 失败时原样返回错误，不缓存
    pub async fn get_or_compute<F, Fut, E>(&self, query: &str, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(query).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(query, value.clone()).await;
        Ok(value)
    }

    /// 从两级中删除
    pub async fn invalidate(&self, query: &str) {
        let key = self.key_for(query);
        self.l1.remove(&key);
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.delete(&key).await {
                self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, kind = %e.kind(), "L2 cache delete failed");
            }
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            l2_failures: self.counters.l2_failures.load(Ordering::Relaxed),
        }
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    fn l1_get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        if let Some(entry) = self.l1.get(key) {
            if entry.is_live(now) {
                return Some(entry.payload.clone());
            }
        }
        self.l1.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    async fn l2_get(&self, key: &str) -> Option<T> {
        let l2 = self.l2.as_ref()?;
        match l2.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(key = %key, "Undecodable L2 cache entry, treating as miss: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.counters.l2_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %key,
                    kind = %e.kind(),
                    detail = e.detail().unwrap_or(""),
                    "L2 cache unavailable, treating as miss"
                );
                None
            }
        }
    }

    fn l1_put(&self, key: String, payload: T) {
        if self.l1.len() >= self.settings.l1_capacity && !self.l1.contains_key(&key) {
            self.evict_for_insert();
        }
        self.l1.insert(
            key,
            L1Entry {
                payload,
                written_at: Instant::now(),
                ttl: self.settings.l1_ttl,
            },
        );
    }

    /// 先清掉过期条目，仍然满时淘汰最早写入的一条
    fn evict_for_insert(&self) {
        let now = Instant::now();
        self.l1.retain(|_, e| e.is_live(now));
        if self.l1.len() < self.settings.l1_capacity {
            return;
        }
        let oldest = self
            .l1
            .iter()
            .min_by_key(|e| e.value().written_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.l1.remove(&key);
        }
    }
}

/// 按 [cache] 段创建缓存
///
/// 配置了 store_path 且 async-sqlite feature 启用时以 SQLite 作为 L2，并启动过期行清理任务（shutdown 时停止）；否则只有 L1
#[cfg_attr(not(feature = "async-sqlite"), allow(unused_variables))]
pub async fn create_cache<T>(
    section: &CacheSection,
    executor: Arc<ResilientExecutor>,
    shutdown: CancellationToken,
) -> TieredCache<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let namespace = CacheNamespace::new(&section.domain, &section.environment, &section.version);
    let settings = CacheSettings::from_section(section);

    #[cfg(feature = "async-sqlite")]
    if let Some(path) = &section.store_path {
        match crate::store::SqliteKvStore::open(path).await {
            Ok(backend) => {
                tracing::info!("Using SQLite L2 cache: {:?}", path);
                let backend = Arc::new(backend);
                backend.spawn_purger(section.purge_interval(), shutdown);
                let l2 = ResilientKv::new(backend, executor);
                return TieredCache::new(namespace, settings, Some(l2));
            }
            Err(e) => {
                tracing::warn!("Failed to open L2 cache store, using L1 only: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if section.store_path.is_some() {
        tracing::warn!("L2 cache requested but async-sqlite feature not enabled, using L1 only");
    }

    TieredCache::new(namespace, settings, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde::Deserialize;

    use crate::core::CallError;
    use crate::store::{KvStore, MemoryKvStore};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Criteria {
        min_players: u32,
        mechanics: Vec<String>,
    }

    fn sample() -> Criteria {
        Criteria {
            min_players: 2,
            mechanics: vec!["deck building".into()],
        }
    }

    fn namespace() -> CacheNamespace {
        CacheNamespace::new("games", "test", "v1")
    }

    fn cache_with_l2(backend: Arc<dyn KvStore>) -> TieredCache<Criteria> {
        TieredCache::new(
            namespace(),
            CacheSettings::default(),
            Some(ResilientKv::new(backend, Arc::new(ResilientExecutor::default()))),
        )
    }

    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CallError> {
            Err(CallError::Connectivity("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CallError> {
            Err(CallError::Connectivity("down".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CallError> {
            Err(CallError::Connectivity("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CallError> {
            Err(CallError::Connectivity("down".into()))
        }
    }

    #[tokio::test]
    async fn test_miss_then_set_then_l1_hit() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        assert_eq!(cache.get("deck builders").await, None);
        cache.set("deck builders", sample()).await;

        let hit = cache.lookup("deck builders").await.unwrap();
        assert_eq!(hit.tier, Tier::L1);
        assert_eq!(hit.payload, sample());

        let stats = cache.statistics();
        assert_eq!((stats.l1_hits, stats.l2_hits, stats.misses), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_equivalent_queries_hit_same_entry() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        assert!(cache.get("Show me deck builders!").await.is_none());
        cache.set("Show me deck builders!", sample()).await;
        assert_eq!(cache.get("  deck BUILDERS ").await, Some(sample()));
    }

    #[tokio::test]
    async fn test_l2_hit_is_promoted_into_l1() {
        let backend: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let writer = cache_with_l2(backend.clone());
        writer.set("worker placement", sample()).await;

        // 另一个进程：L1 为空，L2 共享
        let reader = cache_with_l2(backend);
        let first = reader.lookup("worker placement").await.unwrap();
        assert_eq!(first.tier, Tier::L2);
        assert_eq!(reader.l1_len(), 1);

        let second = reader.lookup("worker placement").await.unwrap();
        assert_eq!(second.tier, Tier::L1);
        assert_eq!(second.payload, first.payload);

        let stats = reader.statistics();
        assert_eq!((stats.l1_hits, stats.l2_hits, stats.misses), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_hit_rate_after_n_misses_and_n_hits() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        let n = 8;
        for i in 0..n {
            let q = format!("query number {i}");
            assert!(cache.get(&q).await.is_none());
            cache.set(&q, sample()).await;
        }
        for i in 0..n {
            assert!(cache.get(&format!("query number {i}")).await.is_some());
        }
        let stats = cache.statistics();
        assert_eq!(stats.misses, n);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_l1_expires_independently_of_l2() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        cache.set("abstract strategy", sample()).await;

        // 超过 L1 TTL（10 分钟），未超过 L2 TTL（30 分钟）
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        let hit = cache.lookup("abstract strategy").await.unwrap();
        assert_eq!(hit.tier, Tier::L2);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert!(cache.lookup("abstract strategy").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_l2_outage_degrades_to_l1_only() {
        let cache = cache_with_l2(Arc::new(DownStore));
        assert!(cache.get("party games").await.is_none());
        cache.set("party games", sample()).await;
        assert_eq!(cache.get("party games").await, Some(sample()));

        let stats = cache.statistics();
        assert_eq!(stats.l1_hits, 1);
        assert_eq!(stats.l2_failures, 2);
    }

    #[tokio::test]
    async fn test_l1_only_cache() {
        let cache: TieredCache<Criteria> =
            TieredCache::new(namespace(), CacheSettings::default(), None);
        cache.set("solo", sample()).await;
        assert_eq!(cache.get("solo").await, Some(sample()));
    }

    #[tokio::test]
    async fn test_custom_fillers_shape_the_key() {
        let cache: TieredCache<Criteria> = TieredCache::new(namespace(), CacheSettings::default(), None)
            .with_normalizer(QueryNormalizer::new(200).with_fillers(["board", "games", "for"]));

        assert_eq!(cache.key_for("Board games for Two"), "games:test:v1:two");
        cache.set("board games for two", sample()).await;
        assert_eq!(cache.get("two").await, Some(sample()));
        assert!(cache.get("show me two").await.is_none());
    }

    #[tokio::test]
    async fn test_l1_capacity_evicts_oldest() {
        let settings = CacheSettings {
            l1_capacity: 2,
            ..CacheSettings::default()
        };
        let cache: TieredCache<u32> = TieredCache::new(namespace(), settings, None);
        cache.set("one", 1).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("two", 2).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set("three", 3).await;

        assert_eq!(cache.l1_len(), 2);
        assert_eq!(cache.get("one").await, None);
        assert_eq!(cache.get("three").await, Some(3));
    }

    #[tokio::test]
    async fn test_get_or_compute_runs_once_per_miss() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        let counter = AtomicU64::new(0);
        let computed = &counter;

        for _ in 0..3 {
            let value: Result<Criteria, String> = cache
                .get_or_compute("cooperative", || async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    Ok(sample())
                })
                .await;
            assert_eq!(value.unwrap(), sample());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_error_is_not_cached() {
        let cache = cache_with_l2(Arc::new(MemoryKvStore::new()));
        let err = cache
            .get_or_compute("broken", || async { Err::<Criteria, _>("resolver down") })
            .await
            .unwrap_err();
        assert_eq!(err, "resolver down");
        assert_eq!(cache.l1_len(), 0);
    }

    #[tokio::test]
    async fn test_version_bump_invalidates_entries() {
        let backend: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let v1 = cache_with_l2(backend.clone());
        v1.set("heavy euro", sample()).await;

        let v2: TieredCache<Criteria> = TieredCache::new(
            CacheNamespace::new("games", "test", "v2"),
            CacheSettings::default(),
            Some(ResilientKv::new(backend, Arc::new(ResilientExecutor::default()))),
        );
        assert!(v2.get("heavy euro").await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_tiers() {
        let backend: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = cache_with_l2(backend.clone());
        cache.set("legacy", sample()).await;
        cache.invalidate("legacy").await;
        assert!(cache.get("legacy").await.is_none());
        assert_eq!(backend.get(&cache.key_for("legacy")).await.unwrap(), None);
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_create_cache_shares_l2_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let section = CacheSection {
            store_path: Some(dir.path().join("cache.db")),
            ..CacheSection::default()
        };
        let executor = Arc::new(ResilientExecutor::default());
        let first: TieredCache<Criteria> =
            create_cache(&section, executor.clone(), CancellationToken::new()).await;
        first.set("roll and write", sample()).await;

        let second: TieredCache<Criteria> =
            create_cache(&section, executor, CancellationToken::new()).await;
        let hit = second.lookup("roll and write").await.unwrap();
        assert_eq!(hit.tier, Tier::L2);
    }

    #[tokio::test]
    async fn test_create_cache_without_store_is_l1_only() {
        let cache: TieredCache<u32> = create_cache(
            &CacheSection::default(),
            Arc::new(ResilientExecutor::default()),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(cache.key_for("The Crew"), "games:development:v1:crew");
        cache.set("the crew", 5).await;
        assert_eq!(cache.lookup("crew").await.unwrap().tier, Tier::L1);
    }
}
