//! 汇总表 (Rollup)
//!
//! @yutiansut @quantaxis
//!
//! - `schema`: 声明式汇总表定义
//! - `compiler`: 定义校验与重建计划
//! - `aggregate`: 两阶段聚合内核 (两个查询引擎共用)
//! - `formula`: 注入的派生字段公式表
//! - `store`: 物化汇总行，按批次原子替换

pub mod aggregate;
pub mod compiler;
pub mod formula;
pub mod row;
pub mod schema;
pub mod store;

pub use aggregate::AggregationError;
pub use compiler::{compile, RebuildPlan, SchemaError};
pub use formula::{Formula, FormulaError, FormulaRegistry};
pub use row::{AggregateRow, GroupKey, MetricValue, RollupRow};
pub use schema::{AggFunc, DerivedField, Dimension, FieldSpec, RollupSchema, SourceExpr};
pub use store::{slice_key, RollupBatch, RollupStore, GLOBAL_SCOPE};
