//! SQLite 共享键值存储
//!
//! 同一台机器上的多个进程可指向同一个数据库文件，从而共享线程映射与 L2 缓存。
//! 过期时间以 Unix 毫秒存储；过期行对读取不可见，由 spawn_purger 启动的后台任务定期物理删除。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::kv::KvStore;
use crate::core::CallError;

/// SQLite 键值存储（sqlx 连接池）
pub struct SqliteKvStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteKvStore {
    /// 打开（不存在则创建）数据库并初始化表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries(expires_at_ms)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// 物理删除已过期的行
    pub async fn purge_expired(&self) -> Result<u64, CallError> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at_ms <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    /// 启动后台清理任务，每隔 every 删除一次过期行，cancel 触发时退出
    pub fn spawn_purger(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(removed, "Purged expired kv entries"),
                        Err(e) => tracing::warn!(kind = %e.kind(), "Failed to purge expired kv entries"),
                    },
                }
            }
        })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

fn map_sqlx_error(err: sqlx::Error) -> CallError {
    match &err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            CallError::Malformed(err.to_string())
        }
        _ => CallError::Connectivity(err.to_string()),
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CallError> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ? AND expires_at_ms > ?")
            .bind(key)
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CallError> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
        )
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CallError> {
        let result = sqlx::query(
            "UPDATE kv_entries SET expires_at_ms = ? WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(expiry_ms(ttl))
        .bind(key)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<(), CallError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}
