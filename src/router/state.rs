//! 查询路由器
//!
//! @yutiansut @quantaxis
//!
//! 状态只有 ROLLUP / PARTITION 两种：
//! - `refresh()` 按事实表规模和分区引擎健康度选择引擎，并清除强制指定
//! - `force()` 钉住某个健康的引擎，直到下一次显式 `refresh()`
//! - 查询在发起时快照状态；PARTITION 出错仅对本次查询降级到 ROLLUP

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{AggregateResult, Engine, EngineError, MetricRequest, QueryEngine};
use crate::fact::FactStore;
use crate::observability::metrics;
use crate::rollup::{GroupKey, MetricValue};
use crate::sync::{SyncListener, SyncReport};
use crate::{ReportError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// 配置与状态
// ═══════════════════════════════════════════════════════════════════════════

/// 路由器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// 事实记录数达到该值后切换到分区引擎
    #[serde(default = "default_switch_threshold")]
    pub switch_threshold: u64,

    /// 定时刷新间隔（秒），0 表示不启用
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// 引擎一致性校验容差
    #[serde(default = "default_verify_tolerance")]
    pub verify_tolerance: f64,
}

fn default_switch_threshold() -> u64 {
    1_000_000
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_verify_tolerance() -> f64 {
    1e-6
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            switch_threshold: default_switch_threshold(),
            refresh_interval_secs: default_refresh_interval_secs(),
            verify_tolerance: default_verify_tolerance(),
        }
    }
}

#[derive(Debug, Clone)]
struct RouterState {
    engine: Engine,
    forced: Option<Engine>,
    record_count: u64,
    last_refresh: Option<DateTime<Utc>>,
}

/// 路由器状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterSnapshot {
    pub engine: Engine,
    pub forced: Option<Engine>,
    pub record_count: u64,
    pub switch_threshold: u64,
    pub rollup_healthy: bool,
    pub partition_healthy: bool,
    pub last_refresh: Option<DateTime<Utc>>,
    pub queries: u64,
    pub degraded: u64,
    pub inconsistencies: u64,
}

/// 路由后的查询结果
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResult {
    pub result: AggregateResult,
    pub engine_used: Engine,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    /// 本次查询是否从 PARTITION 降级
    pub degraded: bool,
}

fn serialize_millis<S: Serializer>(latency: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(latency.as_secs_f64() * 1000.0)
}

// ═══════════════════════════════════════════════════════════════════════════
// 路由器
// ═══════════════════════════════════════════════════════════════════════════

/// 查询路由器
pub struct QueryRouter {
    config: RouterConfig,
    facts: Arc<dyn FactStore>,
    rollup: Arc<dyn QueryEngine>,
    partition: Arc<dyn QueryEngine>,
    state: RwLock<RouterState>,
    queries: AtomicU64,
    degraded: AtomicU64,
    inconsistencies: AtomicU64,
    timer: Mutex<Option<(Sender<()>, std::thread::JoinHandle<()>)>>,
}

impl QueryRouter {
    pub fn new(
        config: RouterConfig,
        facts: Arc<dyn FactStore>,
        rollup: Arc<dyn QueryEngine>,
        partition: Arc<dyn QueryEngine>,
    ) -> Self {
        Self {
            config,
            facts,
            rollup,
            partition,
            state: RwLock::new(RouterState {
                engine: Engine::Rollup,
                forced: None,
                record_count: 0,
                last_refresh: None,
            }),
            queries: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn engine_for(&self, engine: Engine) -> &Arc<dyn QueryEngine> {
        match engine {
            Engine::Rollup => &self.rollup,
            Engine::Partition => &self.partition,
        }
    }

    /// 启动时调用，等同于 `refresh()`
    pub fn initialize(&self) -> Result<Engine> {
        let engine = self.refresh()?;
        log::info!("Query router initialized on {}", engine);
        Ok(engine)
    }

    /// 重新测量事实表规模并选择引擎，清除强制指定
    pub fn refresh(&self) -> Result<Engine> {
        self.reevaluate(true)
    }

    /// 重新测量但保留强制指定 (同步完成和定时器触发)
    fn reevaluate(&self, clear_force: bool) -> Result<Engine> {
        let record_count = self.facts.count()?;
        let automatic = if record_count >= self.config.switch_threshold && self.partition.is_healthy() {
            Engine::Partition
        } else {
            Engine::Rollup
        };

        let mut state = self.state.write();
        if clear_force {
            if let Some(forced) = state.forced.take() {
                log::info!("Router force on {} cleared by refresh", forced);
            }
        }
        let engine = state.forced.unwrap_or(automatic);
        if engine != state.engine {
            log::info!(
                "Router switched {} -> {} (records {}, threshold {})",
                state.engine,
                engine,
                record_count,
                self.config.switch_threshold
            );
        }
        state.engine = engine;
        state.record_count = record_count;
        state.last_refresh = Some(Utc::now());
        drop(state);

        metrics::FACT_RECORDS.set(record_count as i64);
        metrics::ROUTER_ENGINE.set(engine.gauge_value());
        Ok(engine)
    }

    /// 强制使用某个引擎，直到下一次 `refresh()`
    pub fn force(&self, engine: Engine) -> Result<()> {
        if !self.engine_for(engine).is_healthy() {
            log::warn!("Refusing to force router onto unhealthy engine {}", engine);
            return Err(ReportError::EngineUnavailable {
                engine,
                reason: "engine is unhealthy".to_string(),
            });
        }

        let mut state = self.state.write();
        state.forced = Some(engine);
        state.engine = engine;
        drop(state);

        metrics::ROUTER_ENGINE.set(engine.gauge_value());
        log::info!("Router forced onto {}", engine);
        Ok(())
    }

    pub fn current_engine(&self) -> Engine {
        self.state.read().engine
    }

    // ───────────────────────────────────────────────────────────────────────
    // 查询
    // ───────────────────────────────────────────────────────────────────────

    /// 按当前状态路由查询
    pub fn query(&self, request: &MetricRequest) -> Result<RoutedResult> {
        let engine = self.current_engine();
        self.queries.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        match self.dispatch(engine, request) {
            Ok(result) => Ok(self.routed(result, engine, start, false)),
            Err(e) if e.is_request_error() => {
                self.record_failure(engine);
                Err(ReportError::Engine(e))
            }
            Err(e) if engine == Engine::Partition => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                metrics::QUERY_DEGRADED_TOTAL.inc();
                self.record_failure(Engine::Partition);
                log::warn!(
                    "Degraded: request {} on PARTITION failed ({}), retrying on ROLLUP",
                    request.request_id,
                    e
                );

                match self.dispatch(Engine::Rollup, request) {
                    Ok(result) => Ok(self.routed(result, Engine::Rollup, start, true)),
                    Err(e) => {
                        self.record_failure(Engine::Rollup);
                        Err(self.unavailable(Engine::Rollup, e))
                    }
                }
            }
            Err(e) => {
                self.record_failure(engine);
                Err(self.unavailable(engine, e))
            }
        }
    }

    /// 绕过路由，直接使用指定引擎
    pub fn query_via(&self, engine: Engine, request: &MetricRequest) -> Result<AggregateResult> {
        self.dispatch(engine, request).map_err(ReportError::Engine)
    }

    /// 两个引擎各执行一次并逐字段比较
    pub fn verify(&self, request: &MetricRequest, tolerance: f64) -> Result<AggregateResult> {
        let rollup = self.query_via(Engine::Rollup, request)?;
        let partition = self.query_via(Engine::Partition, request)?;

        if let Some(detail) = compare_results(&rollup, &partition, tolerance) {
            self.inconsistencies.fetch_add(1, Ordering::Relaxed);
            metrics::INCONSISTENT_AGGREGATION_TOTAL
                .with_label_values(&[request.schema.as_str()])
                .inc();
            log::error!(
                "Inconsistent aggregation for schema {} (request {}): {}",
                request.schema,
                request.request_id,
                detail
            );
            return Err(ReportError::InconsistentAggregation {
                schema: request.schema.clone(),
                detail,
            });
        }
        Ok(rollup)
    }

    fn dispatch(&self, engine: Engine, request: &MetricRequest) -> std::result::Result<AggregateResult, EngineError> {
        let timer = Instant::now();
        let result = self.engine_for(engine).execute(request, None);
        metrics::QUERY_LATENCY
            .with_label_values(&[engine.as_str()])
            .observe(timer.elapsed().as_secs_f64() * 1000.0);
        result
    }

    fn routed(&self, result: AggregateResult, engine: Engine, start: Instant, degraded: bool) -> RoutedResult {
        metrics::QUERY_TOTAL
            .with_label_values(&[engine.as_str(), "ok"])
            .inc();
        RoutedResult {
            result,
            engine_used: engine,
            latency: start.elapsed(),
            degraded,
        }
    }

    fn record_failure(&self, engine: Engine) {
        metrics::QUERY_TOTAL
            .with_label_values(&[engine.as_str(), "error"])
            .inc();
    }

    fn unavailable(&self, engine: Engine, e: EngineError) -> ReportError {
        log::error!("Engine {} failed: {}", engine, e);
        ReportError::EngineUnavailable {
            engine,
            reason: e.to_string(),
        }
    }

    pub fn status(&self) -> RouterSnapshot {
        let state = self.state.read().clone();
        RouterSnapshot {
            engine: state.engine,
            forced: state.forced,
            record_count: state.record_count,
            switch_threshold: self.config.switch_threshold,
            rollup_healthy: self.rollup.is_healthy(),
            partition_healthy: self.partition.is_healthy(),
            last_refresh: state.last_refresh,
            queries: self.queries.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // 定时刷新
    // ───────────────────────────────────────────────────────────────────────

    /// 启动定时刷新线程
    pub fn start_refresh_timer(self: &Arc<Self>) -> std::io::Result<()> {
        if self.config.refresh_interval_secs == 0 {
            return Ok(());
        }
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.refresh_interval_secs);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let router = Arc::downgrade(self);

        let handle = std::thread::Builder::new()
            .name("router-refresh".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(router) = router.upgrade() else {
                    break;
                };
                if let Err(e) = router.reevaluate(false) {
                    log::warn!("Periodic router refresh failed: {}", e);
                }
            })?;

        *timer = Some((stop_tx, handle));
        log::info!("Router refresh timer started, interval {:?}", interval);
        Ok(())
    }

    pub fn stop_refresh_timer(&self) {
        if let Some((stop_tx, handle)) = self.timer.lock().take() {
            let _ = stop_tx.send(());
            if let Err(e) = handle.join() {
                log::error!("Router refresh thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for QueryRouter {
    fn drop(&mut self) {
        if let Some((stop_tx, _)) = self.timer.get_mut().take() {
            let _ = stop_tx.send(());
        }
    }
}

/// 同步完成后重新评估引擎 (保留强制指定)
impl SyncListener for QueryRouter {
    fn on_committed(&self, _key: &str, _slices: &[(String, String)]) {}

    fn on_batch_complete(&self, report: &SyncReport) {
        if report.rebuilt.is_empty() {
            return;
        }
        if let Err(e) = self.reevaluate(false) {
            log::warn!("Router refresh after sync failed: {}", e);
        }
    }
}

/// 比较两个结果，返回第一处差异的描述
fn compare_results(left: &AggregateResult, right: &AggregateResult, tolerance: f64) -> Option<String> {
    let index = |result: &AggregateResult| -> BTreeMap<GroupKey, BTreeMap<String, MetricValue>> {
        result
            .rows
            .iter()
            .map(|row| (row.key.clone(), row.values.clone()))
            .collect()
    };
    let (left_rows, right_rows) = (index(left), index(right));

    if left_rows.len() != right_rows.len() {
        return Some(format!(
            "{} has {} groups, {} has {} groups",
            left.engine,
            left_rows.len(),
            right.engine,
            right_rows.len()
        ));
    }

    for (key, left_values) in &left_rows {
        let Some(right_values) = right_rows.get(key) else {
            return Some(format!("group {} missing from {}", key, right.engine));
        };
        for (field, value) in left_values {
            let other = right_values.get(field).unwrap_or(&MetricValue::Null);
            if !value.approx_eq(other, tolerance) {
                return Some(format!(
                    "group {} field {}: {} = {}, {} = {}",
                    key, field, left.engine, value, right.engine, other
                ));
            }
        }
        if let Some(extra) = right_values.keys().find(|f| !left_values.contains_key(*f)) {
            return Some(format!("group {} field {} only in {}", key, extra, right.engine));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactRecord, MemoryFactStore};
    use crate::rollup::AggregateRow;
    use chrono::NaiveDateTime;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// 固定返回结果的引擎
    struct StubEngine {
        engine: Engine,
        healthy: AtomicBool,
        fail: AtomicBool,
        revenue: i64,
        calls: AtomicUsize,
    }

    impl StubEngine {
        fn new(engine: Engine, revenue: i64) -> Arc<Self> {
            Arc::new(Self {
                engine,
                healthy: AtomicBool::new(true),
                fail: AtomicBool::new(false),
                revenue,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl QueryEngine for StubEngine {
        fn engine(&self) -> Engine {
            self.engine
        }

        fn execute(
            &self,
            request: &MetricRequest,
            _cancel: Option<&AtomicBool>,
        ) -> std::result::Result<AggregateResult, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.schema == "missing" {
                return Err(EngineError::UnknownSchema(request.schema.clone()));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Unavailable("stub failure".to_string()));
            }
            let mut values = BTreeMap::new();
            values.insert("revenue".to_string(), MetricValue::Amount(Amount::from_units(self.revenue)));
            Ok(AggregateResult::new(
                vec![AggregateRow {
                    key: GroupKey::new(["S1"]),
                    values,
                }],
                self.engine,
            ))
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn facts(n: usize) -> Arc<MemoryFactStore> {
        let ts = NaiveDateTime::parse_from_str("2025-01-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let store = Arc::new(MemoryFactStore::new());
        store
            .append(
                (0..n)
                    .map(|i| FactRecord::new(format!("r{}", i), format!("o{}", i), "S1", ts, "meituan"))
                    .collect(),
            )
            .unwrap();
        store
    }

    fn setup(
        records: usize,
        threshold: u64,
        partition_revenue: i64,
    ) -> (QueryRouter, Arc<StubEngine>, Arc<StubEngine>, Arc<MemoryFactStore>) {
        let facts = facts(records);
        let rollup = StubEngine::new(Engine::Rollup, 10);
        let partition = StubEngine::new(Engine::Partition, partition_revenue);
        let config = RouterConfig {
            switch_threshold: threshold,
            refresh_interval_secs: 0,
            ..Default::default()
        };
        let router = QueryRouter::new(config, facts.clone(), rollup.clone(), partition.clone());
        (router, rollup, partition, facts)
    }

    #[test]
    fn test_threshold_selects_engine() {
        let (router, _, partition, _) = setup(5, 5, 10);
        assert_eq!(router.initialize().unwrap(), Engine::Partition);

        partition.healthy.store(false, Ordering::SeqCst);
        assert_eq!(router.refresh().unwrap(), Engine::Rollup);

        let (router, _, _, _) = setup(4, 5, 10);
        assert_eq!(router.initialize().unwrap(), Engine::Rollup);
        assert_eq!(router.status().record_count, 4);
    }

    #[test]
    fn test_force_and_refresh() {
        let (router, _, partition, _) = setup(1, 100, 10);
        router.initialize().unwrap();

        router.force(Engine::Partition).unwrap();
        assert_eq!(router.current_engine(), Engine::Partition);
        assert_eq!(router.status().forced, Some(Engine::Partition));

        // 同步触发的重新评估保留强制指定
        router.on_batch_complete(&SyncReport {
            rebuilt: vec!["S1".to_string()],
            ..Default::default()
        });
        assert_eq!(router.current_engine(), Engine::Partition);

        assert_eq!(router.refresh().unwrap(), Engine::Rollup);
        assert_eq!(router.status().forced, None);

        partition.healthy.store(false, Ordering::SeqCst);
        let err = router.force(Engine::Partition).unwrap_err();
        assert!(matches!(err, ReportError::EngineUnavailable { engine: Engine::Partition, .. }));
    }

    #[test]
    fn test_degrades_for_one_call() {
        let (router, rollup, partition, _) = setup(10, 1, 10);
        router.initialize().unwrap();
        partition.fail.store(true, Ordering::SeqCst);

        let request = MetricRequest::new("store_daily", vec![]);
        let routed = router.query(&request).unwrap();
        assert!(routed.degraded);
        assert_eq!(routed.engine_used, Engine::Rollup);
        assert_eq!(router.current_engine(), Engine::Partition);
        assert_eq!(router.status().degraded, 1);
        assert_eq!(rollup.calls.load(Ordering::SeqCst), 1);

        partition.fail.store(false, Ordering::SeqCst);
        let routed = router.query(&request).unwrap();
        assert!(!routed.degraded);
        assert_eq!(routed.engine_used, Engine::Partition);
    }

    #[test]
    fn test_rollup_failure_is_unavailable() {
        let (router, rollup, _, _) = setup(1, 100, 10);
        router.initialize().unwrap();
        rollup.fail.store(true, Ordering::SeqCst);

        let err = router.query(&MetricRequest::new("store_daily", vec![])).unwrap_err();
        assert!(matches!(err, ReportError::EngineUnavailable { engine: Engine::Rollup, .. }));
    }

    #[test]
    fn test_request_error_not_degraded() {
        let (router, rollup, _, _) = setup(10, 1, 10);
        router.initialize().unwrap();

        let err = router.query(&MetricRequest::new("missing", vec![])).unwrap_err();
        assert!(matches!(err, ReportError::Engine(EngineError::UnknownSchema(_))));
        assert_eq!(rollup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(router.status().degraded, 0);
    }

    #[test]
    fn test_verify() {
        let (router, _, _, _) = setup(1, 100, 10);
        let request = MetricRequest::new("store_daily", vec![]);
        assert!(router.verify(&request, 1e-9).is_ok());

        let (router, _, _, _) = setup(1, 100, 11);
        let err = router.verify(&request, 1e-9).unwrap_err();
        assert!(matches!(err, ReportError::InconsistentAggregation { .. }));
        assert_eq!(router.status().inconsistencies, 1);
    }

    #[test]
    fn test_refresh_fails_when_facts_unavailable() {
        let (router, _, _, facts) = setup(1, 100, 10);
        router.initialize().unwrap();
        facts.set_available(false);
        assert!(router.refresh().is_err());
        assert_eq!(router.current_engine(), Engine::Rollup);
    }
}
