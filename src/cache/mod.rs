//! 缓存防护层
//!
//! @yutiansut @quantaxis
//!
//! 汇总引擎读取切片前经过 `ProtectedCache`：
//! 布隆过滤 → 空值缓存 → 单键互斥加载 → TTL 抖动

pub mod bloom;
pub mod protect;

pub use bloom::BloomFilter;
pub use protect::{CacheConfig, CacheStatsSnapshot, ProtectedCache};
