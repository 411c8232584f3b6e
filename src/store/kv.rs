//! 键值存储抽象
//!
//! 线程映射与 L2 缓存共用的后端接口：按 key 读写字符串值，每个值带独立 TTL。
//! - MemoryKvStore：进程内实现（开发 / 测试 / 单进程降级）
//! - SqliteKvStore：同机多进程共享（见 sqlite.rs，需 async-sqlite feature）
//! - ResilientKv：经 ResilientExecutor（CacheOp 策略）包装后的访问入口

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::core::{CallError, PolicyClass, ResilientExecutor};

/// 键值存储接口
#[async_trait]
pub trait KvStore: Send + Sync {
    /// 读取未过期的值
    async fn get(&self, key: &str) -> Result<Option<String>, CallError>;

    /// 写入（覆盖）值并设置 TTL
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CallError>;

    /// 重置 TTL；key 不存在或已过期时返回 false
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CallError>;

    async fn delete(&self, key: &str) -> Result<(), CallError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// 进程内键值存储：DashMap + 读取时惰性过期，purge_expired 供定期清扫
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 删除所有已过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CallError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, e| e.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CallError> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CallError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CallError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// 经执行器包装的键值访问：每个操作按 CacheOp 策略超时 + 重试
#[derive(Clone)]
pub struct ResilientKv {
    backend: Arc<dyn KvStore>,
    executor: Arc<ResilientExecutor>,
}

impl ResilientKv {
    pub fn new(backend: Arc<dyn KvStore>, executor: Arc<ResilientExecutor>) -> Self {
        Self { backend, executor }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CallError> {
        let backend = self.backend.clone();
        let key = key.to_string();
        self.executor
            .execute(PolicyClass::CacheOp, "kv.get", move || {
                let backend = backend.clone();
                let key = key.clone();
                async move { backend.get(&key).await }
            })
            .await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CallError> {
        let backend = self.backend.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.executor
            .execute(PolicyClass::CacheOp, "kv.set", move || {
                let backend = backend.clone();
                let key = key.clone();
                let value = value.clone();
                async move { backend.set(&key, &value, ttl).await }
            })
            .await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CallError> {
        let backend = self.backend.clone();
        let key = key.to_string();
        self.executor
            .execute(PolicyClass::CacheOp, "kv.expire", move || {
                let backend = backend.clone();
                let key = key.clone();
                async move { backend.expire(&key, ttl).await }
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CallError> {
        let backend = self.backend.clone();
        let key = key.to_string();
        self.executor
            .execute(PolicyClass::CacheOp, "kv.delete", move || {
                let backend = backend.clone();
                let key = key.clone();
                async move { backend.delete(&key).await }
            })
            .await
    }
}
