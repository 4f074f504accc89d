//! # QAREPORT-RS
//!
//! 零售订单报表的分层查询核心：物化汇总表 + 日期分区两套引擎
//!
//! ## 核心能力
//!
//! - **Schema 编译**: 声明式汇总定义 → 校验 → 重建计划 (两阶段聚合 + 派生公式)
//! - **增量同步**: 按门店重建汇总切片，单次原子提交，同 key 重建合并
//! - **分区存储**: 每 (门店, 日期) 一个 Parquet 文件，内容哈希保证幂等
//! - **查询路由**: 按数据规模在 ROLLUP / PARTITION 之间切换，故障单次降级
//! - **缓存防护**: 布隆过滤 / 空值缓存 / 单键互斥 / TTL 抖动
//! - **对外服务**: 运维 HTTP 接口 (基于 Actix-web) + Prometheus 指标
//!
//! ## 架构设计
//!
//! ```text
//! ingest / purge ──► FactStore ──► notify_mutation
//!                                      │
//!                     SyncWorkerPool ◄─┘
//!                          │
//!                     Synchronizer ──► RollupStore ──► ProtectedCache ──► RollupEngine ─┐
//!                                                                                       ├─► QueryRouter
//! FactStore ──► PartitionMigrator ──► PartitionStore ──────────────────► PartitionEngine ┘
//! ```
//!
//! 两个引擎共享同一个聚合内核，结果逐字段一致。

// ============================================================================
// 外部依赖
// ============================================================================

pub use chrono;
pub use log;
pub use serde;
pub use serde_json;

// ============================================================================
// 内部模块
// ============================================================================

/// 订单明细事实表
pub mod fact;

/// 汇总 Schema、编译器、聚合内核与汇总表存储
pub mod rollup;

/// 增量同步
pub mod sync;

/// 日期分区列式存储
pub mod partition;

/// 缓存防护层
pub mod cache;

/// 查询路由与引擎
pub mod router;

/// 服务门面与 HTTP 接口
pub mod service;

/// 可观测性
pub mod observability;

/// 工具模块
pub mod utils;

// ============================================================================
// 错误类型
// ============================================================================

use router::Engine;

/// 全局错误类型
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Schema error: {0}")]
    Schema(#[from] rollup::SchemaError),

    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    #[error("Partition error: {0}")]
    Partition(#[from] partition::PartitionError),

    #[error("Engine error: {0}")]
    Engine(#[from] router::EngineError),

    #[error("Fact store error: {0}")]
    FactStore(#[from] fact::FactStoreError),

    #[error("Config error: {0}")]
    Config(#[from] utils::config::ConfigError),

    #[error("Engine {engine} unavailable: {reason}")]
    EngineUnavailable { engine: Engine, reason: String },

    #[error("Inconsistent aggregation for schema {schema}: {detail}")]
    InconsistentAggregation { schema: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReportError>;

// ============================================================================
// 常用导出
// ============================================================================

pub mod prelude {
    pub use crate::fact::{Amount, FactCatalog, FactRecord, FactStore, MemoryFactStore};
    pub use crate::rollup::{
        AggFunc, DerivedField, Dimension, FieldSpec, MetricValue, RebuildPlan, RollupSchema,
        SourceExpr,
    };
    pub use crate::router::{AggregateResult, EmptyReason, Engine, MetricRequest, RoutedResult};
    pub use crate::service::ReportService;
    pub use crate::utils::config::ReportConfig;
    pub use crate::{ReportError, Result};
}
