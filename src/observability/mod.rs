//! 可观测性模块
//!
//! @yutiansut @quantaxis
//!
//! 提供 Prometheus 指标导出

pub mod metrics;

pub use metrics::*;
