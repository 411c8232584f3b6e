//! 查询结果缓存：键归一化 + 两级（L1/L2）存储

pub mod key;
pub mod tiered;

pub use key::{CacheNamespace, QueryNormalizer};
pub use tiered::{create_cache, CacheSettings, CacheStatistics, Cached, Tier, TieredCache};
