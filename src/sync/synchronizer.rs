//! 增量同步器
//!
//! 每个分区键 (store_id) 是一个逻辑单元：重新扫描该 key 的事实记录，
//! 执行全部重建计划，在一次汇总表提交中替换该 key 的所有切片。
//! 任一计划失败则整个 key 不提交，旧行继续有效。
//!
//! 全局 scope 切片由任意 key 的重建顺带刷新，不同 key 可能并发重建；
//! 每次全表扫描带数据版本，只提交不旧于已提交版本的全局切片。

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use super::{SyncCause, SyncFailure, SyncListener, SyncReport, SyncStats, SyncStatsSnapshot};
use crate::fact::FactStore;
use crate::observability::metrics;
use crate::rollup::{RebuildPlan, RollupBatch, RollupRow, RollupStore, GLOBAL_SCOPE};

type KeyOutcome = Result<u64, SyncFailure>;

/// 进行中的单 key 重建
struct InFlight {
    /// 本次重建开始时该 key 的变更序号，已覆盖 <= 此序号的变更
    covered_seq: u64,
    outcome: Mutex<Option<KeyOutcome>>,
    done: Condvar,
}

impl InFlight {
    fn new(covered_seq: u64) -> Self {
        Self {
            covered_seq,
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: KeyOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> KeyOutcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

/// 全局 scope 汇总结果
#[derive(Clone)]
struct GlobalSlices {
    /// 扫描时的事实表版本
    version: u64,
    rows: Vec<(String, Vec<RollupRow>)>,
}

/// 同一次 sync 调用内复用
type GlobalRows = Result<GlobalSlices, SyncFailure>;

/// 待提交的单 key 批次
struct PendingBatch {
    batch: RollupBatch,
    globals: Option<GlobalSlices>,
}

/// 增量同步器
pub struct Synchronizer {
    facts: Arc<dyn FactStore>,
    rollups: Arc<RollupStore>,
    plans: Vec<Arc<RebuildPlan>>,
    listeners: RwLock<Vec<Arc<dyn SyncListener>>>,
    inflight: Mutex<HashMap<String, Arc<InFlight>>>,
    /// key -> 变更序号
    sequences: DashMap<String, u64>,
    /// 已提交全局切片的事实表版本；提交全局切片时持有
    global_version: Mutex<Option<u64>>,
    stats: SyncStats,
}

impl Synchronizer {
    pub fn new(
        facts: Arc<dyn FactStore>,
        rollups: Arc<RollupStore>,
        plans: Vec<Arc<RebuildPlan>>,
    ) -> Self {
        Self {
            facts,
            rollups,
            plans,
            listeners: RwLock::new(Vec::new()),
            inflight: Mutex::new(HashMap::new()),
            sequences: DashMap::new(),
            global_version: Mutex::new(None),
            stats: SyncStats::default(),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SyncListener>) {
        self.listeners.write().push(listener);
    }

    pub fn plans(&self) -> &[Arc<RebuildPlan>] {
        &self.plans
    }

    pub fn plan(&self, schema: &str) -> Option<&Arc<RebuildPlan>> {
        self.plans.iter().find(|p| p.name() == schema)
    }

    pub fn rollup_store(&self) -> &Arc<RollupStore> {
        &self.rollups
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &SyncStats {
        &self.stats
    }

    /// 记录 key 的一次变更 (序号加一)
    pub fn record_mutation<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for key in keys {
            *self.sequences.entry(key.clone()).or_insert(0) += 1;
        }
    }

    fn sequence_of(&self, key: &str) -> u64 {
        self.sequences.get(key).map(|s| *s).unwrap_or(0)
    }

    /// 同步受影响的 key
    pub fn sync(&self, keys: &BTreeSet<String>) -> SyncReport {
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        let mut report = SyncReport::default();
        let mut globals: Option<GlobalRows> = None;

        for key in keys {
            let requested = self.sequence_of(key);
            let (outcome, coalesced) = self.sync_key(key, requested, &mut globals);

            if coalesced {
                report.coalesced += 1;
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::SYNC_KEYS_TOTAL.with_label_values(&["coalesced"]).inc();
            }

            match outcome {
                Ok(version) => {
                    report.rebuilt.push(key.clone());
                    report.version = report.version.max(version);
                }
                Err(failure) => {
                    log::warn!("{}", failure);
                    report.failures.push(failure);
                }
            }
        }

        if report.version > 0 {
            self.stats
                .last_version
                .fetch_max(report.version, Ordering::Relaxed);
        }
        metrics::ROLLUP_ROWS.set(self.rollups.row_count() as i64);

        log::debug!(
            "Sync finished: {} rebuilt, {} failed, {} coalesced",
            report.rebuilt.len(),
            report.failures.len(),
            report.coalesced
        );

        for listener in self.listeners.read().iter() {
            listener.on_batch_complete(&report);
        }
        report
    }

    /// 全量重建 (启动时)
    pub fn rebuild_all(&self) -> SyncReport {
        match self.facts.partition_keys() {
            Ok(keys) => {
                let keys: BTreeSet<String> = keys.into_iter().collect();
                log::info!("Rebuilding rollups for {} partition keys", keys.len());
                let mut report = self.sync(&keys);
                if keys.is_empty() {
                    // 没有事实数据时仍需清理全局切片
                    if let Err(failure) = self.commit_globals_only() {
                        report.failures.push(failure);
                    }
                }
                report
            }
            Err(e) => {
                log::error!("Full rebuild failed to list partition keys: {}", e);
                SyncReport {
                    failures: vec![SyncFailure {
                        key: GLOBAL_SCOPE.to_string(),
                        schema: None,
                        cause: SyncCause::FactStore(e),
                    }],
                    ..SyncReport::default()
                }
            }
        }
    }

    /// 返回 (结果, 是否复用了他人的重建)
    fn sync_key(
        &self,
        key: &str,
        requested: u64,
        globals: &mut Option<GlobalRows>,
    ) -> (KeyOutcome, bool) {
        loop {
            let (flight, leader) = {
                let mut inflight = self.inflight.lock();
                match inflight.get(key) {
                    Some(flight) => (flight.clone(), false),
                    None => {
                        let flight = Arc::new(InFlight::new(self.sequence_of(key)));
                        inflight.insert(key.to_string(), flight.clone());
                        (flight, true)
                    }
                }
            };

            if leader {
                let outcome = self.rebuild_key(key, globals);
                {
                    let mut inflight = self.inflight.lock();
                    if inflight.get(key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                        inflight.remove(key);
                    }
                }
                flight.complete(outcome.clone());
                return (outcome, false);
            }

            let outcome = flight.wait();
            if flight.covered_seq >= requested {
                return (outcome, true);
            }
            // 进行中的重建早于本次变更，等待后重跑
            log::debug!(
                "Key {} changed after in-flight rebuild started (seq {} < {}), re-running",
                key,
                flight.covered_seq,
                requested
            );
        }
    }

    fn rebuild_key(&self, key: &str, globals: &mut Option<GlobalRows>) -> KeyOutcome {
        let timer = metrics::Timer::new(metrics::SYNC_LATENCY.clone());
        let started = Instant::now();

        let result = self
            .build_batch(key, globals)
            .map(|pending| self.commit(key, pending));
        timer.observe();

        match &result {
            Ok(version) => {
                self.stats.keys_rebuilt.fetch_add(1, Ordering::Relaxed);
                metrics::SYNC_KEYS_TOTAL.with_label_values(&["rebuilt"]).inc();
                log::debug!(
                    "Rebuilt key {} in {:?} (rollup version {})",
                    key,
                    started.elapsed(),
                    version
                );
            }
            Err(_) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                metrics::SYNC_KEYS_TOTAL.with_label_values(&["failed"]).inc();
            }
        }
        result
    }

    fn build_batch(&self, key: &str, globals: &mut Option<GlobalRows>) -> Result<PendingBatch, SyncFailure> {
        let scope: BTreeSet<String> = [key.to_string()].into_iter().collect();
        let facts = self.facts.scan_keys(&scope).map_err(|e| SyncFailure {
            key: key.to_string(),
            schema: None,
            cause: SyncCause::FactStore(e),
        })?;

        let mut batch = RollupBatch::new();
        for plan in self.plans.iter().filter(|p| p.is_store_scoped()) {
            let rows = plan.execute(&facts, None).map_err(|e| SyncFailure {
                key: key.to_string(),
                schema: Some(plan.name().to_string()),
                cause: SyncCause::Aggregation(e),
            })?;
            batch.replace(plan.name(), key, rows);
        }

        let mut pending = PendingBatch { batch, globals: None };
        if self.plans.iter().any(|p| !p.is_store_scoped()) {
            match globals.get_or_insert_with(|| self.build_globals()) {
                Ok(slices) => pending.globals = Some(slices.clone()),
                Err(failure) => {
                    return Err(SyncFailure {
                        key: key.to_string(),
                        ..failure.clone()
                    });
                }
            }
        }

        Ok(pending)
    }

    /// 提交批次并通知监听器，返回汇总表版本
    ///
    /// 全局切片的版本检查与提交在同一把锁内完成，
    /// 较旧的全表扫描不会覆盖较新的全局切片。
    fn commit(&self, key: &str, pending: PendingBatch) -> u64 {
        let PendingBatch { mut batch, globals } = pending;
        let listeners = self.listeners.read();

        let (version, slices) = {
            let mut committed = self.global_version.lock();
            if let Some(globals) = globals {
                if (*committed).is_some_and(|v| globals.version < v) {
                    log::debug!(
                        "Skipping global slices for key {}: scanned version {} older than committed {:?}",
                        key,
                        globals.version,
                        *committed
                    );
                } else {
                    *committed = Some(globals.version);
                    for (schema, rows) in globals.rows {
                        batch.replace(schema, GLOBAL_SCOPE, rows);
                    }
                }
            }

            let slices = batch.slice_ids();
            for listener in listeners.iter() {
                listener.before_commit(&batch);
            }
            (self.rollups.commit(batch), slices)
        };

        for listener in listeners.iter() {
            listener.on_committed(key, &slices);
        }
        version
    }

    fn build_globals(&self) -> GlobalRows {
        let snapshot = self.facts.scan_all().map_err(|e| SyncFailure {
            key: GLOBAL_SCOPE.to_string(),
            schema: None,
            cause: SyncCause::FactStore(e),
        })?;

        let rows = self
            .plans
            .iter()
            .filter(|p| !p.is_store_scoped())
            .map(|plan| {
                plan.execute(&snapshot.records, None)
                    .map(|rows| (plan.name().to_string(), rows))
                    .map_err(|e| SyncFailure {
                        key: GLOBAL_SCOPE.to_string(),
                        schema: Some(plan.name().to_string()),
                        cause: SyncCause::Aggregation(e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GlobalSlices {
            version: snapshot.version,
            rows,
        })
    }

    fn commit_globals_only(&self) -> Result<(), SyncFailure> {
        if self.plans.iter().all(|p| p.is_store_scoped()) {
            return Ok(());
        }
        let globals = self.build_globals()?;
        self.commit(
            GLOBAL_SCOPE,
            PendingBatch {
                batch: RollupBatch::new(),
                globals: Some(globals),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactCatalog, FactRecord, FactSnapshot, FactStoreError, MemoryFactStore};
    use crate::rollup::{compile, DerivedField, Dimension, FieldSpec, FormulaRegistry, RollupSchema};
    use chrono::{NaiveDate, NaiveDateTime};
    use crossbeam::channel::{bounded, Receiver, Sender};
    use std::sync::atomic::AtomicUsize;

    fn fact(record: &str, order: &str, store: &str, revenue: i64, cost: i64) -> FactRecord {
        FactRecord::new(
            record,
            order,
            store,
            NaiveDateTime::parse_from_str("2025-01-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            "meituan",
        )
        .with_item("revenue", Amount::from_units(revenue))
        .with_item("cost", Amount::from_units(cost))
    }

    fn plans() -> Vec<Arc<RebuildPlan>> {
        let catalog = FactCatalog::new(["revenue", "cost"], Vec::<String>::new());
        let formulas = Arc::new(FormulaRegistry::with_builtins());
        let by_store = RollupSchema::new("by_store", vec![Dimension::StoreId])
            .with_field(FieldSpec::sum("revenue", "revenue"))
            .with_field(FieldSpec::sum("cost", "cost"))
            .with_derived(DerivedField::new("margin", "ratio", ["revenue", "cost"]));
        let by_channel = RollupSchema::new("by_channel", vec![Dimension::Channel])
            .with_field(FieldSpec::sum("revenue", "revenue"));
        vec![
            Arc::new(compile(&by_store, &catalog, formulas.clone()).unwrap()),
            Arc::new(compile(&by_channel, &catalog, formulas).unwrap()),
        ]
    }

    fn setup() -> (Arc<MemoryFactStore>, Arc<RollupStore>, Synchronizer) {
        let facts = Arc::new(MemoryFactStore::new());
        let rollups = Arc::new(RollupStore::new());
        let sync = Synchronizer::new(facts.clone(), rollups.clone(), plans());
        (facts, rollups, sync)
    }

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sync_builds_store_and_global_slices() {
        let (facts, rollups, sync) = setup();
        facts
            .append(vec![fact("r1", "o1", "S1", 10, 4), fact("r2", "o2", "S2", 20, 5)])
            .unwrap();

        let report = sync.sync(&keys(&["S1", "S2"]));
        assert!(report.is_success());
        assert_eq!(report.rebuilt, vec!["S1", "S2"]);

        let s1 = rollups.get("by_store", "S1").unwrap();
        assert_eq!(s1[0].amount("revenue"), Some(Amount::from_units(10)));
        let global = rollups.get("by_channel", GLOBAL_SCOPE).unwrap();
        assert_eq!(global[0].amount("revenue"), Some(Amount::from_units(30)));
    }

    #[test]
    fn test_failed_key_keeps_old_rows() {
        let (facts, rollups, sync) = setup();
        facts.append(vec![fact("r1", "o1", "S1", 10, 4)]).unwrap();
        sync.sync(&keys(&["S1"]));

        // 成本为 0 的新店使 ratio 除零，S1 追加新行后重建成功
        facts
            .append(vec![fact("r2", "o2", "S2", 20, 0), fact("r3", "o3", "S1", 5, 1)])
            .unwrap();
        let report = sync.sync(&keys(&["S1", "S2"]));

        assert_eq!(report.rebuilt, vec!["S1"]);
        assert_eq!(report.failed_keys(), vec!["S2"]);
        assert_eq!(report.failures[0].schema.as_deref(), Some("by_store"));
        assert!(rollups.get("by_store", "S2").is_none());
        assert_eq!(
            rollups.get("by_store", "S1").unwrap()[0].amount("revenue"),
            Some(Amount::from_units(15))
        );
    }

    #[test]
    fn test_purged_key_removes_slice() {
        let (facts, rollups, sync) = setup();
        facts.append(vec![fact("r1", "o1", "S1", 10, 4)]).unwrap();
        sync.rebuild_all();
        assert!(rollups.get("by_store", "S1").is_some());

        facts.purge("S1");
        sync.sync(&keys(&["S1"]));
        assert!(rollups.get("by_store", "S1").is_none());
        assert!(rollups.get("by_channel", GLOBAL_SCOPE).is_none());
    }

    struct CountingListener {
        committed: AtomicUsize,
        batches: AtomicUsize,
    }

    impl SyncListener for CountingListener {
        fn on_committed(&self, _key: &str, _slices: &[(String, String)]) {
            self.committed.fetch_add(1, Ordering::SeqCst);
        }

        fn on_batch_complete(&self, _report: &SyncReport) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listeners_notified() {
        let (facts, _rollups, sync) = setup();
        let listener = Arc::new(CountingListener {
            committed: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        });
        sync.add_listener(listener.clone());

        facts
            .append(vec![fact("r1", "o1", "S1", 10, 4), fact("r2", "o2", "S2", 20, 5)])
            .unwrap();
        sync.sync(&keys(&["S1", "S2"]));

        assert_eq!(listener.committed.load(Ordering::SeqCst), 2);
        assert_eq!(listener.batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_sync_same_key() {
        let (facts, rollups, sync) = setup();
        facts.append(vec![fact("r1", "o1", "S1", 10, 4)]).unwrap();
        let sync = Arc::new(sync);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sync = sync.clone();
                std::thread::spawn(move || sync.sync(&keys(&["S1"])))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_success());
        }

        let stats = sync.stats();
        // 每次调用要么自己重建，要么复用进行中的结果
        assert_eq!(stats.keys_rebuilt + stats.coalesced, 8);
        assert_eq!(
            rollups.get("by_store", "S1").unwrap()[0].amount("revenue"),
            Some(Amount::from_units(10))
        );
    }

    /// 首次全表扫描完成后暂停，直到测试放行
    struct PausingFacts {
        inner: Arc<MemoryFactStore>,
        gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    }

    impl FactStore for PausingFacts {
        fn count(&self) -> Result<u64, FactStoreError> {
            self.inner.count()
        }

        fn partition_keys(&self) -> Result<Vec<String>, FactStoreError> {
            self.inner.partition_keys()
        }

        fn scan_keys(&self, keys: &BTreeSet<String>) -> Result<Vec<FactRecord>, FactStoreError> {
            self.inner.scan_keys(keys)
        }

        fn scan_all(&self) -> Result<FactSnapshot, FactStoreError> {
            let snapshot = self.inner.scan_all()?;
            let gate = self.gate.lock().take();
            if let Some((scanned, release)) = gate {
                let _ = scanned.send(());
                let _ = release.recv();
            }
            Ok(snapshot)
        }

        fn partition_dates(&self, store_id: &str) -> Result<Vec<NaiveDate>, FactStoreError> {
            self.inner.partition_dates(store_id)
        }

        fn scan_partition(&self, store_id: &str, date: NaiveDate) -> Result<Vec<FactRecord>, FactStoreError> {
            self.inner.scan_partition(store_id, date)
        }
    }

    #[test]
    fn test_stale_global_scan_never_overwrites_newer() {
        let inner = Arc::new(MemoryFactStore::new());
        let (scanned_tx, scanned_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let facts = Arc::new(PausingFacts {
            inner: inner.clone(),
            gate: Mutex::new(Some((scanned_tx, release_rx))),
        });
        let rollups = Arc::new(RollupStore::new());
        let sync = Arc::new(Synchronizer::new(facts, rollups.clone(), plans()));

        inner.append(vec![fact("r1", "o1", "S1", 10, 4)]).unwrap();
        let slow = {
            let sync = sync.clone();
            std::thread::spawn(move || sync.sync(&keys(&["S1"])))
        };
        // S1 的全表扫描只看到 10
        scanned_rx.recv().unwrap();

        inner.append(vec![fact("r2", "o2", "S2", 7, 2)]).unwrap();
        assert!(sync.sync(&keys(&["S2"])).is_success());
        let global = rollups.get("by_channel", GLOBAL_SCOPE).unwrap();
        assert_eq!(global[0].amount("revenue"), Some(Amount::from_units(17)));

        release_tx.send(()).unwrap();
        assert!(slow.join().unwrap().is_success());

        // 较旧的扫描结果被丢弃，门店切片照常提交
        let global = rollups.get("by_channel", GLOBAL_SCOPE).unwrap();
        assert_eq!(global[0].amount("revenue"), Some(Amount::from_units(17)));
        assert_eq!(
            rollups.get("by_store", "S1").unwrap()[0].amount("revenue"),
            Some(Amount::from_units(10))
        );
    }

    #[test]
    fn test_concurrent_keys_keep_global_current() {
        let (facts, rollups, sync) = setup();
        let sync = Arc::new(sync);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let facts = facts.clone();
                let sync = sync.clone();
                std::thread::spawn(move || {
                    let store = format!("S{}", t);
                    for n in 0..25 {
                        let id = format!("{}-{}", store, n);
                        facts.append(vec![fact(&id, &id, &store, 1, 1)]).unwrap();
                        assert!(sync.sync(&keys(&[store.as_str()])).is_success());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let global = rollups.get("by_channel", GLOBAL_SCOPE).unwrap();
        assert_eq!(global[0].amount("revenue"), Some(Amount::from_units(100)));
    }
}
