//! 会话线程映射存储
//!
//! conversation_id -> Agent 运行时 thread_id，滑动 TTL（每次命中都会续期）。
//! - KvThreadStore：分布式键值后端，key 为 `thread:{conversation_id}`，经执行器访问
//! - InMemoryThreadStore：进程内降级实现，定期清扫过期条目；多进程之间不共享，仅用于降级模式
//!
//! 后端故障一律吞掉：get 视为未命中，set/remove 静默忽略。最坏结果是下游多创建一个新线程。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::kv::{KvStore, ResilientKv};
use crate::config::ThreadsSection;
use crate::core::ResilientExecutor;

/// 线程映射存储接口；实现内部同步，调用方无需加锁
#[async_trait]
pub trait ThreadMappingStore: Send + Sync {
    /// 命中时返回 thread_id 并续期
    async fn get(&self, conversation_id: &str) -> Option<String>;

    /// 写入映射（后写者覆盖）
    async fn set(&self, conversation_id: &str, thread_id: &str);

    async fn remove(&self, conversation_id: &str);
}

pub fn thread_key(conversation_id: &str) -> String {
    format!("thread:{conversation_id}")
}

/// 基于键值后端的映射存储
pub struct KvThreadStore {
    kv: ResilientKv,
    ttl: Duration,
    /// 被吞掉的后端错误次数
    degraded_events: AtomicU64,
}

impl KvThreadStore {
    pub fn new(backend: Arc<dyn KvStore>, executor: Arc<ResilientExecutor>, ttl: Duration) -> Self {
        Self {
            kv: ResilientKv::new(backend, executor),
            ttl,
            degraded_events: AtomicU64::new(0),
        }
    }

    pub fn degraded_events(&self) -> u64 {
        self.degraded_events.load(Ordering::Relaxed)
    }

    fn record_degraded(&self) {
        self.degraded_events.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl ThreadMappingStore for KvThreadStore {
    async fn get(&self, conversation_id: &str) -> Option<String> {
        let key = thread_key(conversation_id);
        let thread_id = match self.kv.get(&key).await {
            Ok(found) => found?,
            Err(e) => {
                self.record_degraded();
                tracing::warn!(
                    conversation_id,
                    kind = %e.kind(),
                    detail = e.detail().unwrap_or(""),
                    "Thread store unavailable, treating as miss"
                );
                return None;
            }
        };

        if let Err(e) = self.kv.expire(&key, self.ttl).await {
            self.record_degraded();
            tracing::warn!(conversation_id, kind = %e.kind(), "Failed to refresh thread mapping TTL");
        }
        Some(thread_id)
    }

    async fn set(&self, conversation_id: &str, thread_id: &str) {
        if let Err(e) = self.kv.set(&thread_key(conversation_id), thread_id, self.ttl).await {
            self.record_degraded();
            tracing::warn!(
                conversation_id,
                kind = %e.kind(),
                detail = e.detail().unwrap_or(""),
                "Thread store unavailable, mapping not saved"
            );
        }
    }

    async fn remove(&self, conversation_id: &str) {
        if let Err(e) = self.kv.delete(&thread_key(conversation_id)).await {
            self.record_degraded();
            tracing::warn!(conversation_id, kind = %e.kind(), "Thread store unavailable, mapping not removed");
        }
    }
}

/// 单条映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMapping {
    pub conversation_id: String,
    pub thread_id: String,
    pub expires_at: Instant,
}

impl ThreadMapping {
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// 进程内映射存储（降级模式）
#[derive(Debug)]
pub struct InMemoryThreadStore {
    entries: DashMap<String, ThreadMapping>,
    ttl: Duration,
}

impl InMemoryThreadStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// 当前映射快照（不续期）
    pub fn mapping(&self, conversation_id: &str) -> Option<ThreadMapping> {
        self.entries.get(conversation_id).map(|m| m.clone())
    }

    /// 清扫过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, m| m.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 启动后台清扫任务，cancel 触发后退出
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired thread mappings");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ThreadMappingStore for InMemoryThreadStore {
    async fn get(&self, conversation_id: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(mut mapping) = self.entries.get_mut(conversation_id) {
            if mapping.is_live(now) {
                mapping.expires_at = now + self.ttl;
                return Some(mapping.thread_id.clone());
            }
        }
        self.entries.remove_if(conversation_id, |_, m| !m.is_live(now));
        None
    }

    async fn set(&self, conversation_id: &str, thread_id: &str) {
        self.entries.insert(
            conversation_id.to_string(),
            ThreadMapping {
                conversation_id: conversation_id.to_string(),
                thread_id: thread_id.to_string(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn remove(&self, conversation_id: &str) {
        self.entries.remove(conversation_id);
    }
}

/// 创建线程映射存储
///
/// 配置了 store_path 且 async-sqlite feature 启用时，使用 SQLite 键值后端；否则使用进程内降级实现
pub async fn create_thread_store(
    section: &ThreadsSection,
    #[cfg_attr(not(feature = "async-sqlite"), allow(unused_variables))] executor: Arc<ResilientExecutor>,
    shutdown: CancellationToken,
) -> Arc<dyn ThreadMappingStore> {
    let ttl = section.ttl();

    #[cfg(feature = "async-sqlite")]
    if let Some(path) = &section.store_path {
        match super::SqliteKvStore::open(path).await {
            Ok(backend) => {
                tracing::info!("Using SQLite thread store: {:?}", path);
                let backend = Arc::new(backend);
                backend.spawn_purger(section.sweep_interval(), shutdown.clone());
                return Arc::new(KvThreadStore::new(backend, executor, ttl));
            }
            Err(e) => {
                tracing::warn!("Failed to open thread store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if section.store_path.is_some() {
        tracing::warn!("Shared thread store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::warn!("Using in-process thread store (degraded mode, not shared across processes)");
    let store = Arc::new(InMemoryThreadStore::new(ttl));
    store.spawn_sweeper(section.sweep_interval(), shutdown);
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CallError;
    use crate::store::MemoryKvStore;

    /// 永远失败的后端
    struct DownStore;

    #[async_trait]
    impl KvStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CallError> {
            Err(CallError::Connectivity("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CallError> {
            Err(CallError::Connectivity("connection refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CallError> {
            Err(CallError::Connectivity("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CallError> {
            Err(CallError::Connectivity("connection refused".into()))
        }
    }

    fn kv_store(backend: Arc<dyn KvStore>, ttl: Duration) -> KvThreadStore {
        KvThreadStore::new(backend, Arc::new(ResilientExecutor::default()), ttl)
    }

    #[test]
    fn test_thread_key_format() {
        assert_eq!(thread_key("conv-1"), "thread:conv-1");
    }

    #[tokio::test]
    async fn test_kv_set_then_get() {
        let backend = Arc::new(MemoryKvStore::new());
        let store = kv_store(backend.clone(), Duration::from_secs(7200));
        store.set("conv-1", "thread-A").await;
        assert_eq!(store.get("conv-1").await.as_deref(), Some("thread-A"));
        assert_eq!(
            backend.get("thread:conv-1").await.unwrap().as_deref(),
            Some("thread-A")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_ttl_expiry_after_simulated_minutes() {
        let store = kv_store(Arc::new(MemoryKvStore::new()), Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        tokio::time::advance(Duration::from_secs(180)).await;
        assert_eq!(store.get("conv-1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_get_slides_ttl() {
        let store = kv_store(Arc::new(MemoryKvStore::new()), Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(store.get("conv-1").await.is_some());
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(store.get("conv-1").await.as_deref(), Some("thread-A"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_outage_never_propagates() {
        let store = kv_store(Arc::new(DownStore), Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        assert_eq!(store.get("conv-1").await, None);
        store.remove("conv-1").await;
        assert_eq!(store.degraded_events(), 3);
    }

    #[tokio::test]
    async fn test_kv_remove() {
        let store = kv_store(Arc::new(MemoryKvStore::new()), Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        store.remove("conv-1").await;
        assert_eq!(store.get("conv-1").await, None);
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = InMemoryThreadStore::new(Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        store.set("conv-1", "thread-B").await;
        assert_eq!(store.get("conv-1").await.as_deref(), Some("thread-B"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ttl_expiry_after_simulated_minutes() {
        let store = InMemoryThreadStore::new(Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        tokio::time::advance(Duration::from_secs(180)).await;
        assert_eq!(store.get("conv-1").await, None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_get_refreshes_expiry() {
        let store = InMemoryThreadStore::new(Duration::from_secs(120));
        store.set("conv-1", "thread-A").await;
        let first = store.mapping("conv-1").unwrap().expires_at;

        tokio::time::advance(Duration::from_secs(60)).await;
        store.get("conv-1").await;
        let refreshed = store.mapping("conv-1").unwrap().expires_at;
        assert_eq!(refreshed - first, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let store = Arc::new(InMemoryThreadStore::new(Duration::from_secs(60)));
        let cancel = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_secs(600), cancel.clone());

        store.set("old", "thread-old").await;
        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert!(store.mapping("old").is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_falls_back_to_memory() {
        let section = ThreadsSection::default();
        let cancel = CancellationToken::new();
        let store = create_thread_store(
            &section,
            Arc::new(ResilientExecutor::default()),
            cancel.clone(),
        )
        .await;
        store.set("c", "t").await;
        assert_eq!(store.get("c").await.as_deref(), Some("t"));
        cancel.cancel();
    }

    #[cfg(feature = "async-sqlite")]
    #[tokio::test]
    async fn test_factory_uses_sqlite_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let section = ThreadsSection {
            store_path: Some(dir.path().join("threads.db")),
            ..ThreadsSection::default()
        };
        let store = create_thread_store(
            &section,
            Arc::new(ResilientExecutor::default()),
            CancellationToken::new(),
        )
        .await;
        store.set("c", "t").await;

        let reopened = crate::store::SqliteKvStore::open(dir.path().join("threads.db"))
            .await
            .unwrap();
        assert_eq!(reopened.get("thread:c").await.unwrap().as_deref(), Some("t"));
    }
}
