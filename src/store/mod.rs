//! 存储层：键值后端抽象与会话线程映射

pub mod kv;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;
pub mod thread_store;

pub use kv::{KvStore, MemoryKvStore, ResilientKv};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteKvStore;
pub use thread_store::{
    create_thread_store, thread_key, InMemoryThreadStore, KvThreadStore, ThreadMapping,
    ThreadMappingStore,
};
