//! Prometheus 指标导出模块
//!
//! @yutiansut @quantaxis
//!
//! 提供报表查询层的监控指标，包括：
//! - 增量同步 (重建、合并、重试)
//! - 查询路由 (引擎选择、降级、一致性校验)
//! - 缓存保护层
//! - 分区存储

use lazy_static::lazy_static;
use prometheus::{
    self, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry,
};

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ═══════════════════════════════════════════════════════════════════
    // 同步指标
    // ═══════════════════════════════════════════════════════════════════

    /// 按 key 统计的重建结果 (rebuilt / failed / coalesced)
    pub static ref SYNC_KEYS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_keys_total", "Partition keys processed by the synchronizer")
            .namespace("qareport"),
        &["result"]
    ).expect("Failed to create SYNC_KEYS_TOTAL metric");

    /// 单个 key 重建延迟 (毫秒)
    pub static ref SYNC_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("sync_key_latency_ms", "Per-key rebuild latency in milliseconds")
            .namespace("qareport")
            .buckets(vec![0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0])
    ).expect("Failed to create SYNC_LATENCY metric");

    /// 重试调度 (scheduled / exhausted)
    pub static ref SYNC_RETRY_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sync_retry_total", "Sync retries by outcome")
            .namespace("qareport"),
        &["outcome"]
    ).expect("Failed to create SYNC_RETRY_TOTAL metric");

    /// 汇总表行数
    pub static ref ROLLUP_ROWS: IntGauge = IntGauge::new(
        "qareport_rollup_rows", "Materialized rollup rows"
    ).expect("Failed to create ROLLUP_ROWS metric");

    // ═══════════════════════════════════════════════════════════════════
    // 路由指标
    // ═══════════════════════════════════════════════════════════════════

    /// 查询总数
    pub static ref QUERY_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("query_total", "Queries by engine and status")
            .namespace("qareport"),
        &["engine", "status"]
    ).expect("Failed to create QUERY_TOTAL metric");

    /// 查询延迟 (毫秒)
    pub static ref QUERY_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("query_latency_ms", "Query latency in milliseconds")
            .namespace("qareport")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 2000.0]),
        &["engine"]
    ).expect("Failed to create QUERY_LATENCY metric");

    /// 分区引擎失败后降级到汇总引擎的次数
    pub static ref QUERY_DEGRADED_TOTAL: IntCounter = IntCounter::new(
        "qareport_query_degraded_total", "Queries demoted from PARTITION to ROLLUP"
    ).expect("Failed to create QUERY_DEGRADED_TOTAL metric");

    /// 引擎结果不一致次数
    pub static ref INCONSISTENT_AGGREGATION_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("inconsistent_aggregation_total", "Engine verification mismatches")
            .namespace("qareport"),
        &["schema"]
    ).expect("Failed to create INCONSISTENT_AGGREGATION_TOTAL metric");

    /// 当前引擎 (0=ROLLUP, 1=PARTITION)
    pub static ref ROUTER_ENGINE: IntGauge = IntGauge::new(
        "qareport_router_engine", "Current engine (0=ROLLUP, 1=PARTITION)"
    ).expect("Failed to create ROUTER_ENGINE metric");

    /// 最近一次测量的事实记录数
    pub static ref FACT_RECORDS: IntGauge = IntGauge::new(
        "qareport_fact_records", "Fact record count at the last router refresh"
    ).expect("Failed to create FACT_RECORDS metric");

    // ═══════════════════════════════════════════════════════════════════
    // 缓存指标
    // ═══════════════════════════════════════════════════════════════════

    /// 缓存访问结果 (hit / miss / null_hit / bloom_reject / stale / lock_timeout)
    pub static ref CACHE_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_requests_total", "Protected cache lookups by outcome")
            .namespace("qareport"),
        &["outcome"]
    ).expect("Failed to create CACHE_REQUESTS metric");

    // ═══════════════════════════════════════════════════════════════════
    // 分区存储指标
    // ═══════════════════════════════════════════════════════════════════

    /// 分区写入 (written / unchanged)
    pub static ref PARTITION_WRITES: IntCounterVec = IntCounterVec::new(
        Opts::new("partition_writes_total", "Partition writes by outcome")
            .namespace("qareport"),
        &["outcome"]
    ).expect("Failed to create PARTITION_WRITES metric");

    /// 分区文件数
    pub static ref PARTITION_FILES: IntGauge = IntGauge::new(
        "qareport_partition_files", "Partition files in the manifest"
    ).expect("Failed to create PARTITION_FILES metric");

    /// 落后于事实表的分区数
    pub static ref PARTITION_PENDING: IntGauge = IntGauge::new(
        "qareport_partition_pending", "Partitions whose facts changed since the last write"
    ).expect("Failed to create PARTITION_PENDING metric");
}

/// 初始化所有指标到 Registry
pub fn init_metrics() {
    // 同步指标
    REGISTRY.register(Box::new(SYNC_KEYS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(SYNC_LATENCY.clone())).ok();
    REGISTRY.register(Box::new(SYNC_RETRY_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROLLUP_ROWS.clone())).ok();

    // 路由指标
    REGISTRY.register(Box::new(QUERY_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(QUERY_LATENCY.clone())).ok();
    REGISTRY.register(Box::new(QUERY_DEGRADED_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(INCONSISTENT_AGGREGATION_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(ROUTER_ENGINE.clone())).ok();
    REGISTRY.register(Box::new(FACT_RECORDS.clone())).ok();

    // 缓存指标
    REGISTRY.register(Box::new(CACHE_REQUESTS.clone())).ok();

    // 分区指标
    REGISTRY.register(Box::new(PARTITION_WRITES.clone())).ok();
    REGISTRY.register(Box::new(PARTITION_FILES.clone())).ok();
    REGISTRY.register(Box::new(PARTITION_PENDING.clone())).ok();

    log::info!("Prometheus metrics initialized");
}

/// 导出指标为 Prometheus 文本格式
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        log::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// 计时器辅助结构 (毫秒)
pub struct Timer {
    start: std::time::Instant,
    histogram: Histogram,
}

impl Timer {
    pub fn new(histogram: Histogram) -> Self {
        Self {
            start: std::time::Instant::now(),
            histogram,
        }
    }

    pub fn observe(self) {
        let elapsed = self.start.elapsed().as_secs_f64() * 1000.0;
        self.histogram.observe(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();

        SYNC_KEYS_TOTAL.with_label_values(&["rebuilt"]).inc();
        QUERY_TOTAL.with_label_values(&["ROLLUP", "ok"]).inc();
        QUERY_LATENCY.with_label_values(&["ROLLUP"]).observe(1.5);
        CACHE_REQUESTS.with_label_values(&["hit"]).inc();
        PARTITION_WRITES.with_label_values(&["written"]).inc();

        let output = export_metrics();
        assert!(output.contains("qareport_sync_keys_total"));
        assert!(output.contains("qareport_query_total"));
        assert!(output.contains("qareport_cache_requests_total"));
    }

    #[test]
    fn test_timer() {
        init_metrics();

        let timer = Timer::new(SYNC_LATENCY.clone());
        std::thread::sleep(std::time::Duration::from_micros(100));
        timer.observe();
    }
}
