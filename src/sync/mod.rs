// 增量同步
//
// 架构设计：
//
//   ingest / purge
//        │ notify_mutation(keys)      (fire-and-forget)
//        ▼
//   ┌─────────────────────┐
//   │   有界任务队列        │  已在队列中的 key 折叠
//   │   (crossbeam)        │
//   └──────────┬──────────┘
//              ▼
//   ┌─────────────────────┐
//   │   Worker 线程池      │  失败 key 指数退避重试
//   └──────────┬──────────┘
//              ▼
//   ┌─────────────────────┐
//   │   Synchronizer       │  每个 key 同时只有一个重建
//   │  扫描事实 → 执行计划  │  → 单次提交替换该 key 的全部切片
//   └──────────┬──────────┘
//              ▼
//   SyncListener: 缓存失效 / 路由刷新
//
// 分区键为 store_id；不含 STORE_ID 维度的汇总表在同一次提交中按全局 scope 重建。

pub mod synchronizer;
pub mod worker;

pub use synchronizer::Synchronizer;
pub use worker::{SyncWorkerConfig, SyncWorkerPool};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fact::FactStoreError;
use crate::rollup::{AggregationError, RollupBatch};

/// 同步失败原因
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncCause {
    #[error("fact store: {0}")]
    FactStore(#[from] FactStoreError),

    #[error("aggregation: {0}")]
    Aggregation(#[from] AggregationError),
}

/// 单个 key 的重建失败 (可重试，旧汇总行保持有效)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Sync of key {key} failed (schema {schema:?}): {cause}")]
pub struct SyncFailure {
    pub key: String,
    pub schema: Option<String>,
    pub cause: SyncCause,
}

/// 异步同步入口错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Sync queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Sync workers are shut down")]
    ShutDown,
}

/// 一次 sync 调用的结果
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// 成功提交的 key
    pub rebuilt: Vec<String>,
    pub failures: Vec<SyncFailure>,
    /// 复用进行中重建结果的 key 数量
    pub coalesced: usize,
    /// 最后一次提交后的汇总表版本
    pub version: u64,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.key.clone()).collect()
    }
}

/// 同步事件监听
pub trait SyncListener: Send + Sync {
    /// 批次即将可见 (用于提前登记存在性过滤器)
    fn before_commit(&self, _batch: &RollupBatch) {}

    /// key 的切片已提交，`slices` 为 (schema, scope)
    fn on_committed(&self, key: &str, slices: &[(String, String)]);

    /// 一次 sync 调用结束
    fn on_batch_complete(&self, _report: &SyncReport) {}
}

/// 同步统计
#[derive(Debug, Default)]
pub struct SyncStats {
    pub syncs: AtomicU64,
    pub keys_rebuilt: AtomicU64,
    pub failures: AtomicU64,
    pub coalesced: AtomicU64,
    pub retries: AtomicU64,
    pub exhausted: AtomicU64,
    pub queue_rejected: AtomicU64,
    pub last_version: AtomicU64,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            syncs: self.syncs.load(Ordering::Relaxed),
            keys_rebuilt: self.keys_rebuilt.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            queue_rejected: self.queue_rejected.load(Ordering::Relaxed),
            last_version: self.last_version.load(Ordering::Relaxed),
        }
    }
}

/// 同步统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatsSnapshot {
    pub syncs: u64,
    pub keys_rebuilt: u64,
    pub failures: u64,
    pub coalesced: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub queue_rejected: u64,
    pub last_version: u64,
}
