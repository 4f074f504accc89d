// 日期分区列式存储
//
// 设计理念:
// - 每个 (store_id, date) 一个不可变 Parquet 文件
// - 以内容哈希标识分区，相同内容重写为空操作
// - 写入使用临时文件 + rename，清单原子保存
// - 查询并行读取文件，按请求维度运行两阶段聚合内核
//
// 目录结构:
//
//   <root>/
//     manifest.json
//     <store_id>/<date>-<hash>.parquet

pub mod codec;
pub mod file;
pub mod manifest;
pub mod migrator;
pub mod store;

pub use manifest::{PartitionEntry, PartitionManifest};
pub use migrator::{MigrationReport, MigratorConfig, PartitionMigrator};
pub use store::{Clock, FixedClock, PartitionStore, PartitionStoreConfig, SystemClock};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 分区标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub store_id: String,
    pub date: NaiveDate,
}

impl PartitionId {
    pub fn new(store_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            store_id: store_id.into(),
            date,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_id, self.date)
    }
}

/// 分区引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRef {
    pub id: PartitionId,
    pub path: PathBuf,
    /// crc32 内容哈希 (十六进制) + 行数
    pub content_hash: String,
    pub row_count: usize,
    /// 本次调用是否实际写入了文件
    pub written: bool,
}

/// 分区存储错误
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Partition {0} is closed; rewrite it with write_partition")]
    ClosedPartition(PartitionId),

    #[error("Fact {record_id} does not belong to partition {partition}")]
    InvalidFacts {
        partition: PartitionId,
        record_id: String,
    },

    #[error("Partition scan cancelled")]
    Cancelled,

    #[error("{pending} partitions in range have not caught up with the fact store")]
    Incomplete { pending: usize },

    #[error("Fact store error: {0}")]
    FactStore(#[from] crate::fact::FactStoreError),

    #[error("Partition aggregation failed: {0}")]
    Aggregation(#[from] crate::rollup::AggregationError),
}

impl From<arrow2::error::Error> for PartitionError {
    fn from(e: arrow2::error::Error) -> Self {
        PartitionError::Parquet(e.to_string())
    }
}

impl From<serde_json::Error> for PartitionError {
    fn from(e: serde_json::Error) -> Self {
        PartitionError::Manifest(e.to_string())
    }
}
