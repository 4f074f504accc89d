//! 服务门面
//!
//! @yutiansut @quantaxis
//!
//! `ReportService` 组装全部组件并提供对外操作：
//! - 写入：`ingest` / `purge` / `notify_mutation`
//! - 查询：`query` / `verify`
//! - 运维：`status` / `refresh` / `force` / `cache_stats` / `sync_stats`

pub mod http;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheStatsSnapshot;
use crate::fact::{FactRecord, FactStore, MemoryFactStore};
use crate::observability::metrics;
use crate::partition::{
    Clock, MigrationReport, PartitionId, PartitionMigrator, PartitionStore, SystemClock,
};
use crate::rollup::{compile, FormulaRegistry, RebuildPlan, RollupStore, SchemaError};
use crate::router::{
    AggregateResult, Engine, MetricRequest, PartitionEngine, PlanMap, QueryRouter, RollupEngine,
    RoutedResult, RouterSnapshot, SliceCache,
};
use crate::sync::{SyncReport, SyncStatsSnapshot, SyncWorkerPool, Synchronizer};
use crate::utils::config::ReportConfig;
use crate::Result;

/// 报表服务
pub struct ReportService {
    config: ReportConfig,
    facts: Arc<MemoryFactStore>,
    rollups: Arc<RollupStore>,
    plans: Arc<PlanMap>,
    synchronizer: Arc<Synchronizer>,
    workers: SyncWorkerPool,
    cache: Arc<SliceCache>,
    partitions: Arc<PartitionStore>,
    migrator: Arc<PartitionMigrator>,
    router: Arc<QueryRouter>,
}

impl ReportService {
    /// 使用内置公式和系统时钟构建
    pub fn build(config: ReportConfig) -> Result<Self> {
        Self::build_with(config, FormulaRegistry::with_builtins(), Arc::new(SystemClock))
    }

    /// 构建服务 (可注入公式表和营业日时钟)
    pub fn build_with(
        config: ReportConfig,
        formulas: FormulaRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let formulas = Arc::new(formulas);
        let plans = compile_all(&config, formulas)?;
        log::info!("Compiled {} rollup schemas", plans.len());

        let facts = Arc::new(MemoryFactStore::new());
        let rollups = Arc::new(RollupStore::new());
        let synchronizer = Arc::new(Synchronizer::new(
            facts.clone(),
            rollups.clone(),
            plans.values().cloned().collect(),
        ));

        // 缓存必须先于首次提交注册，布隆过滤器才能看到全部切片
        let cache = Arc::new(SliceCache::new(config.cache.clone()));
        synchronizer.add_listener(cache.clone());

        let mut partitions = PartitionStore::open(&config.partition)?.with_clock(clock);
        if let Some(name) = &config.partition.summary_schema {
            if let Some(plan) = plans.get(name) {
                partitions = partitions.with_summary_plan(plan.clone());
            }
        }
        let partitions = Arc::new(partitions);

        let router = Arc::new(QueryRouter::new(
            config.router.clone(),
            facts.clone(),
            Arc::new(RollupEngine::new(rollups.clone(), plans.clone(), cache.clone())),
            Arc::new(PartitionEngine::new(partitions.clone(), plans.clone())),
        ));
        synchronizer.add_listener(router.clone());

        let workers = SyncWorkerPool::new(synchronizer.clone(), config.sync.worker_config());
        let migrator = Arc::new(PartitionMigrator::new(
            facts.clone(),
            partitions.clone(),
            config.migrator.clone(),
        ));

        Ok(Self {
            config,
            facts,
            rollups,
            plans,
            synchronizer,
            workers,
            cache,
            partitions,
            migrator,
            router,
        })
    }

    /// 全量重建、初始化路由、启动后台线程
    pub fn start(&self) -> Result<()> {
        let report = self.synchronizer.rebuild_all();
        if !report.is_success() {
            log::warn!(
                "Initial rebuild finished with {} failed keys: {:?}",
                report.failures.len(),
                report.failed_keys()
            );
        }

        self.router.initialize()?;
        self.workers.start()?;
        if self.config.migrator.interval_secs > 0 {
            self.migrator.start()?;
        }
        self.router.start_refresh_timer()?;

        log::info!(
            "Report service started: {} schemas, {} rollup rows, engine {}",
            self.plans.len(),
            self.rollups.row_count(),
            self.router.current_engine()
        );
        Ok(())
    }

    /// 停止全部后台线程
    pub fn shutdown(&self) {
        log::info!("Shutting down report service...");
        self.router.stop_refresh_timer();
        self.migrator.stop();
        self.workers.stop();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // 写入
    // ═══════════════════════════════════════════════════════════════════════

    /// 追加事实记录并通知同步
    ///
    /// 受影响的分区标记为待迁移；当前营业日的分区随即追加，
    /// 已关闭日期的迟到数据等待迁移器重写。
    pub fn ingest(&self, records: Vec<FactRecord>) -> Result<BTreeSet<String>> {
        let touched: BTreeSet<PartitionId> = records
            .iter()
            .map(|r| PartitionId::new(r.store_id.clone(), r.date()))
            .collect();

        let keys = self.facts.append(records)?;
        self.partitions.mark_pending(touched.iter().cloned());
        metrics::FACT_RECORDS.set(self.facts.count()? as i64);
        self.notify_mutation(&keys)?;

        if self.config.migrator.append_on_ingest {
            let open: BTreeSet<PartitionId> = touched
                .into_iter()
                .filter(|id| !self.partitions.is_closed(id.date))
                .collect();
            if !open.is_empty() {
                self.migrator.refresh(&open);
            }
        }
        Ok(keys)
    }

    /// 删除某门店的全部事实记录及其分区
    pub fn purge(&self, store_id: &str) -> Result<usize> {
        let mut touched: BTreeSet<PartitionId> = self
            .facts
            .partition_dates(store_id)?
            .into_iter()
            .map(|date| PartitionId::new(store_id, date))
            .collect();
        touched.extend(
            self.partitions
                .partitions()
                .iter()
                .filter(|entry| entry.store_id == store_id)
                .map(|entry| entry.id()),
        );

        let removed = self.facts.purge(store_id);
        if removed > 0 {
            self.partitions.mark_pending(touched.iter().cloned());
            let keys: BTreeSet<String> = [store_id.to_string()].into_iter().collect();
            self.notify_mutation(&keys)?;
        }
        if !touched.is_empty() {
            self.migrator.refresh(&touched);
        }
        Ok(removed)
    }

    /// 通知变更 (异步重建)
    pub fn notify_mutation(&self, keys: &BTreeSet<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.workers.notify_mutation(keys).map_err(|e| {
            log::warn!("Mutation notification for {} keys rejected: {}", keys.len(), e);
            e.into()
        })
    }

    /// 同步重建 (绕过工作队列)
    pub fn sync_now(&self, keys: &BTreeSet<String>) -> SyncReport {
        self.synchronizer.record_mutation(keys);
        self.synchronizer.sync(keys)
    }

    /// 等待工作队列清空
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        self.workers.wait_idle(timeout)
    }

    /// 立即执行一次分区迁移
    pub fn migrate_now(&self) -> Result<MigrationReport> {
        Ok(self.migrator.run_once()?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // 查询
    // ═══════════════════════════════════════════════════════════════════════

    pub fn query(&self, request: &MetricRequest) -> Result<RoutedResult> {
        self.router.query(request)
    }

    pub fn query_via(&self, engine: Engine, request: &MetricRequest) -> Result<AggregateResult> {
        self.router.query_via(engine, request)
    }

    /// 两个引擎结果一致性校验
    pub fn verify(&self, request: &MetricRequest) -> Result<AggregateResult> {
        self.router.verify(request, self.config.router.verify_tolerance)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // 运维
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> RouterSnapshot {
        self.router.status()
    }

    pub fn refresh(&self) -> Result<Engine> {
        self.router.refresh()
    }

    pub fn force(&self, engine: Engine) -> Result<()> {
        self.router.force(engine)
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn sync_stats(&self) -> SyncStatsSnapshot {
        self.synchronizer.stats()
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    pub fn facts(&self) -> &Arc<MemoryFactStore> {
        &self.facts
    }

    pub fn rollups(&self) -> &Arc<RollupStore> {
        &self.rollups
    }

    pub fn partitions(&self) -> &Arc<PartitionStore> {
        &self.partitions
    }

    pub fn plan(&self, schema: &str) -> Option<&Arc<RebuildPlan>> {
        self.plans.get(schema)
    }
}

impl Drop for ReportService {
    fn drop(&mut self) {
        self.router.stop_refresh_timer();
        self.migrator.stop();
    }
}

/// 编译全部 schema，名称重复视为错误
fn compile_all(config: &ReportConfig, formulas: Arc<FormulaRegistry>) -> Result<Arc<PlanMap>> {
    let mut plans: PlanMap = HashMap::new();
    for schema in &config.schemas {
        if plans.contains_key(&schema.name) {
            return Err(SchemaError::DuplicateSchema(schema.name.clone()).into());
        }
        let plan = compile(schema, &config.catalog, formulas.clone())?;
        log::debug!(
            "Schema {} v{} compiled: group_by {:?}, {} outputs",
            schema.name,
            schema.version,
            schema.group_by,
            plan.output_names().len()
        );
        plans.insert(schema.name.clone(), Arc::new(plan));
    }
    Ok(Arc::new(plans))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactCatalog};
    use crate::partition::{FixedClock, PartitionStoreConfig};
    use crate::rollup::{Dimension, FieldSpec, MetricValue, RollupSchema};
    use crate::ReportError;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> ReportConfig {
        let mut config = ReportConfig::default();
        config.partition = PartitionStoreConfig::with_root(root);
        config.router.refresh_interval_secs = 0;
        config.migrator.interval_secs = 0;
        config.catalog = FactCatalog::new(["revenue"], ["delivery_fee"]);
        config.schemas = vec![RollupSchema::new("store_daily", vec![Dimension::StoreId, Dimension::Date])
            .with_field(FieldSpec::sum("revenue", "revenue"))
            .with_field(FieldSpec::sum("delivery_fee", "delivery_fee").order_level())];
        config
    }

    fn build(root: &std::path::Path) -> ReportService {
        ReportService::build_with(
            config(root),
            FormulaRegistry::with_builtins(),
            Arc::new(FixedClock::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap())),
        )
        .unwrap()
    }

    fn fact(record: &str, order: &str, store: &str, revenue: i64) -> FactRecord {
        let ts = NaiveDateTime::parse_from_str("2025-01-01 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        FactRecord::new(record, order, store, ts, "meituan")
            .with_item("revenue", Amount::from_units(revenue))
            .with_order("delivery_fee", Amount::from_units(3))
    }

    #[test]
    fn test_duplicate_schema_rejected() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        let duplicate = config.schemas[0].clone();
        config.schemas.push(duplicate);
        let err = ReportService::build(config).err().unwrap();
        assert!(matches!(err, ReportError::Schema(SchemaError::DuplicateSchema(_))));
    }

    #[test]
    fn test_ingest_query_purge() {
        let dir = tempdir().unwrap();
        let service = build(dir.path());
        service.start().unwrap();

        service
            .ingest(vec![fact("r1", "o1", "S1", 10), fact("r2", "o1", "S1", 5), fact("r3", "o2", "S2", 7)])
            .unwrap();
        assert!(service.wait_for_sync(Duration::from_secs(5)));

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]);
        let routed = service.query(&request).unwrap();
        assert_eq!(routed.engine_used, Engine::Rollup);
        assert_eq!(routed.result.rows.len(), 2);
        assert_eq!(
            routed.result.rows[0].get("delivery_fee"),
            Some(&MetricValue::Amount(Amount::from_units(3)))
        );

        assert_eq!(service.purge("S1").unwrap(), 2);
        assert!(service.wait_for_sync(Duration::from_secs(5)));
        let routed = service.query(&request).unwrap();
        assert_eq!(routed.result.rows.len(), 1);

        service.shutdown();
    }

    #[test]
    fn test_migrate_and_verify() {
        let dir = tempdir().unwrap();
        let service = build(dir.path());
        service.start().unwrap();

        service
            .ingest(vec![fact("r1", "o1", "S1", 10), fact("r2", "o2", "S1", 5)])
            .unwrap();
        assert!(service.wait_for_sync(Duration::from_secs(5)));

        let report = service.migrate_now().unwrap();
        assert_eq!(report.written, 1);

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId, Dimension::Date]);
        let verified = service.verify(&request).unwrap();
        assert_eq!(verified.rows.len(), 1);

        service.force(Engine::Partition).unwrap();
        assert_eq!(service.query(&request).unwrap().engine_used, Engine::Partition);
        assert_eq!(service.refresh().unwrap(), Engine::Rollup);

        service.shutdown();
    }
}
