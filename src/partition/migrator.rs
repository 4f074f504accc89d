// 事实表 → 分区迁移器
//
// 职责：
// 1. 定期扫描事实表中的 (store_id, date) 组合
// 2. 为已关闭日期写入分区 (可选包含当前营业日，开放日期走 append_open)
// 3. 事实表中已不存在的分区被删除
// 4. 写入成功后清除分区的待迁移标记
//
// 依赖内容哈希保证幂等：内容未变的分区不会重写文件。

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use super::{PartitionError, PartitionId, PartitionStore};
use crate::fact::FactStore;

/// 迁移器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorConfig {
    /// 扫描间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// 定期扫描是否同时写入当前营业日分区
    #[serde(default)]
    pub include_open: bool,

    /// 写入事实时立即追加到当前营业日分区
    #[serde(default = "default_append_on_ingest")]
    pub append_on_ingest: bool,
}

fn default_append_on_ingest() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            include_open: false,
            append_on_ingest: default_append_on_ingest(),
        }
    }
}

/// 单次迁移结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
    /// 跳过的开放日期分区
    pub skipped_open: usize,
    pub failed: Vec<PartitionId>,
}

/// 分区迁移器
pub struct PartitionMigrator {
    facts: Arc<dyn FactStore>,
    store: Arc<PartitionStore>,
    config: MigratorConfig,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PartitionMigrator {
    pub fn new(facts: Arc<dyn FactStore>, store: Arc<PartitionStore>, config: MigratorConfig) -> Self {
        Self {
            facts,
            store,
            config,
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// 执行一次完整扫描
    pub fn run_once(&self) -> Result<MigrationReport, PartitionError> {
        let mut report = MigrationReport::default();
        let mut live = BTreeSet::new();

        for store_id in self.facts.partition_keys()? {
            for date in self.facts.partition_dates(&store_id)? {
                live.insert(PartitionId::new(store_id.clone(), date));
            }
        }

        // 事实表中已消失但仍有文件或标记的分区
        let mut targets = live.clone();
        targets.extend(self.store.partitions().iter().map(|entry| entry.id()));
        targets.extend(self.store.pending());

        for id in &targets {
            if live.contains(id) && !self.store.is_closed(id.date) && !self.config.include_open {
                report.skipped_open += 1;
                continue;
            }
            self.migrate_one(id, &mut report);
        }

        log::debug!("Migration pass finished: {:?}", report);
        Ok(report)
    }

    /// 立即按事实表重写指定分区 (不受 include_open 限制)
    pub fn refresh(&self, ids: &BTreeSet<PartitionId>) -> MigrationReport {
        let mut report = MigrationReport::default();
        for id in ids {
            self.migrate_one(id, &mut report);
        }
        if !report.failed.is_empty() {
            log::warn!("Partition refresh left {} partitions pending", report.failed.len());
        }
        report
    }

    /// 先读标记序号再扫描事实，扫描之后的变更会让标记保留
    fn migrate_one(&self, id: &PartitionId, report: &mut MigrationReport) {
        let seq = self.store.pending_seq(id);

        let result = self
            .facts
            .scan_partition(&id.store_id, id.date)
            .map_err(PartitionError::from)
            .and_then(|facts| {
                if facts.is_empty() {
                    self.store
                        .remove_partition(&id.store_id, id.date)
                        .map(|removed| (false, removed))
                } else if self.store.is_closed(id.date) {
                    self.store
                        .write_partition(&id.store_id, id.date, facts)
                        .map(|partition| (partition.written, false))
                } else {
                    self.store
                        .append_open(&id.store_id, id.date, facts)
                        .map(|partition| (partition.written, false))
                }
            });

        match result {
            Ok((written, removed)) => {
                if removed {
                    report.removed += 1;
                } else if written {
                    report.written += 1;
                } else if self.store.get(&id.store_id, id.date).is_some() {
                    report.unchanged += 1;
                }
                self.store.clear_pending(id, seq);
            }
            Err(e) => {
                log::error!("Failed to migrate partition {}: {}", id, e);
                report.failed.push(id.clone());
            }
        }
    }

    /// 启动后台线程
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        let migrator = Arc::clone(self);

        *handle = Some(
            std::thread::Builder::new()
                .name("partition-migrator".to_string())
                .spawn(move || {
                    log::info!("Partition migrator started, interval {:?}", interval);
                    loop {
                        if let Err(e) = migrator.run_once() {
                            log::error!("Partition migration failed: {}", e);
                        }
                        match stop_rx.recv_timeout(interval) {
                            Err(RecvTimeoutError::Timeout) => continue,
                            _ => break,
                        }
                    }
                    log::info!("Partition migrator stopped");
                })?,
        );
        *self.stop_tx.lock() = Some(stop_tx);
        Ok(())
    }

    /// 停止后台线程
    pub fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            if let Err(e) = handle.join() {
                log::error!("Partition migrator thread panicked: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactRecord, MemoryFactStore};
    use crate::partition::{FixedClock, PartitionStoreConfig};
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn fact(record: &str, store: &str, d: u32) -> FactRecord {
        let ts = NaiveDateTime::parse_from_str(&format!("2025-01-{:02} 09:00:00", d), "%Y-%m-%d %H:%M:%S")
            .unwrap();
        FactRecord::new(record, format!("o-{}", record), store, ts, "meituan")
            .with_item("revenue", Amount::from_units(10))
    }

    fn setup(dir: &std::path::Path, config: MigratorConfig) -> (Arc<MemoryFactStore>, Arc<PartitionStore>, PartitionMigrator) {
        let facts = Arc::new(MemoryFactStore::new());
        let store = Arc::new(
            PartitionStore::open(&PartitionStoreConfig::with_root(dir))
                .unwrap()
                .with_clock(Arc::new(FixedClock::new(day(3)))),
        );
        let migrator = PartitionMigrator::new(facts.clone(), store.clone(), config);
        (facts, store, migrator)
    }

    #[test]
    fn test_migrates_closed_dates_only() {
        let dir = tempdir().unwrap();
        let (facts, store, migrator) = setup(dir.path(), MigratorConfig::default());

        facts
            .append(vec![fact("r1", "S1", 1), fact("r2", "S1", 2), fact("r3", "S1", 3), fact("r4", "S2", 1)])
            .unwrap();

        let report = migrator.run_once().unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.skipped_open, 1);
        assert_eq!(store.partition_count(), 3);

        let report = migrator.run_once().unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.unchanged, 3);
        assert_eq!(store.file_count(), 3);
    }

    #[test]
    fn test_include_open_and_removal() {
        let dir = tempdir().unwrap();
        let config = MigratorConfig {
            include_open: true,
            ..Default::default()
        };
        let (facts, store, migrator) = setup(dir.path(), config);

        facts.append(vec![fact("r1", "S1", 2), fact("r2", "S1", 3)]).unwrap();
        assert_eq!(migrator.run_once().unwrap().written, 2);

        facts.purge_partition("S1", day(2));
        let report = migrator.run_once().unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(store.partition_count(), 1);
        assert!(store.get("S1", day(3)).is_some());
    }

    #[test]
    fn test_clears_pending_marks() {
        let dir = tempdir().unwrap();
        let (facts, store, migrator) = setup(dir.path(), MigratorConfig::default());

        facts.append(vec![fact("r1", "S1", 1), fact("r2", "S1", 3)]).unwrap();
        let closed = PartitionId::new("S1", day(1));
        let open = PartitionId::new("S1", day(3));
        let gone = PartitionId::new("S9", day(1));
        store.mark_pending([closed.clone(), open.clone(), gone.clone()]);

        let report = migrator.run_once().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.skipped_open, 1);
        // 开放日期仍待迁移，没有事实的标记被清除
        assert_eq!(store.pending(), vec![open.clone()]);

        // 显式刷新开放日期：追加写入
        let ids: BTreeSet<PartitionId> = [open.clone()].into_iter().collect();
        let report = migrator.refresh(&ids);
        assert_eq!(report.written, 1);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.read_partition("S1", day(3)).unwrap().unwrap().len(), 1);

        facts.append(vec![fact("r3", "S1", 3)]).unwrap();
        store.mark_pending([open.clone()]);
        assert_eq!(migrator.refresh(&ids).written, 1);
        assert_eq!(store.read_partition("S1", day(3)).unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_start_stop() {
        let dir = tempdir().unwrap();
        let (facts, store, migrator) = setup(dir.path(), MigratorConfig::default());
        facts.append(vec![fact("r1", "S1", 1)]).unwrap();

        let migrator = Arc::new(migrator);
        migrator.start().unwrap();
        migrator.stop();
        assert_eq!(store.partition_count(), 1);
    }
}
