// 分区存储
//
// 写入语义:
// - write_partition: 整体替换，相同内容哈希为空操作
// - append_open: 仅允许当前营业日，合并后整体重写
// - 已关闭的日期 (早于 today) 只能通过 write_partition 重写
//
// 读取语义:
// - 按清单裁剪分区，rayon 并行读文件
// - 文件之间检查取消标志和截止时间
// - 请求范围内存在待迁移分区时返回 Incomplete，不返回缺行的结果

use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::manifest::now_secs;
use super::{codec, file};
use super::{PartitionEntry, PartitionError, PartitionId, PartitionManifest, PartitionRef};
use crate::fact::FactRecord;
use crate::observability::metrics;
use crate::rollup::{AggregateRow, RebuildPlan};
use crate::router::{AggregateResult, EmptyReason, Engine, MetricRequest};

// ═══════════════════════════════════════════════════════════════════════════
// 时钟
// ═══════════════════════════════════════════════════════════════════════════

/// 营业日时钟 (可注入，便于测试关闭/开放日期)
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// 本地系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// 固定时钟
#[derive(Debug)]
pub struct FixedClock {
    today: RwLock<NaiveDate>,
}

impl FixedClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: RwLock::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.write() = today;
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        *self.today.read()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 配置
// ═══════════════════════════════════════════════════════════════════════════

/// 分区存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStoreConfig {
    /// 存储根目录
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// 写入时预计算日汇总所用的 schema
    #[serde(default)]
    pub summary_schema: Option<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from("./data/partitions")
}

fn default_manifest_file() -> String {
    "manifest.json".to_string()
}

impl Default for PartitionStoreConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            manifest_file: default_manifest_file(),
            summary_schema: None,
        }
    }
}

impl PartitionStoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 分区存储
// ═══════════════════════════════════════════════════════════════════════════

/// 日期分区列式存储
pub struct PartitionStore {
    root: PathBuf,
    manifest: RwLock<PartitionManifest>,
    /// 串行化所有写入 (write_partition / append_open)
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    summary_plan: Option<Arc<RebuildPlan>>,
    healthy: AtomicBool,
    /// 事实已变更、文件尚未跟上的分区 -> 标记序号
    pending: DashMap<PartitionId, u64>,
    pending_seq: AtomicU64,
}

impl PartitionStore {
    /// 打开存储：创建目录、加载清单、清理残留临时文件
    pub fn open(config: &PartitionStoreConfig) -> Result<Self, PartitionError> {
        std::fs::create_dir_all(&config.root)?;
        let manifest = PartitionManifest::load(config.root.join(&config.manifest_file))?;

        let removed = cleanup_temp_files(&config.root)?;
        if removed > 0 {
            log::warn!("Removed {} leftover temp files under {:?}", removed, config.root);
        }

        log::info!(
            "Partition store opened at {:?}: {} partitions, {} rows",
            config.root,
            manifest.len(),
            manifest.total_rows()
        );
        metrics::PARTITION_FILES.set(manifest.len() as i64);

        Ok(Self {
            root: config.root.clone(),
            manifest: RwLock::new(manifest),
            write_lock: Mutex::new(()),
            clock: Arc::new(SystemClock),
            summary_plan: None,
            healthy: AtomicBool::new(true),
            pending: DashMap::new(),
            pending_seq: AtomicU64::new(0),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 配置日汇总计划，之后的每次写入都会附带汇总行
    pub fn with_summary_plan(mut self, plan: Arc<RebuildPlan>) -> Self {
        self.summary_plan = Some(plan);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// 日期是否已关闭
    pub fn is_closed(&self, date: NaiveDate) -> bool {
        date < self.clock.today()
    }

    // ───────────────────────────────────────────────────────────────────────
    // 写入
    // ───────────────────────────────────────────────────────────────────────

    /// 整体写入 (store_id, date) 分区
    ///
    /// 内容哈希与现有分区相同时不写文件，返回 `written = false`；
    /// 空记录集合删除该分区。
    pub fn write_partition(
        &self,
        store_id: &str,
        date: NaiveDate,
        facts: Vec<FactRecord>,
    ) -> Result<PartitionRef, PartitionError> {
        let id = PartitionId::new(store_id, date);
        validate_facts(&id, &facts)?;

        let _guard = self.write_lock.lock();
        self.replace_locked(id, facts)
    }

    /// 向当前营业日分区追加记录
    ///
    /// 已存在的 record_id 被忽略。
    pub fn append_open(
        &self,
        store_id: &str,
        date: NaiveDate,
        facts: Vec<FactRecord>,
    ) -> Result<PartitionRef, PartitionError> {
        let id = PartitionId::new(store_id, date);
        if self.is_closed(date) {
            return Err(PartitionError::ClosedPartition(id));
        }
        validate_facts(&id, &facts)?;

        let _guard = self.write_lock.lock();
        let existing = self.manifest.read().get(&id).cloned();

        let mut merged = match &existing {
            Some(entry) => file::read_partition_file(&self.root.join(&entry.file))?,
            None => Vec::new(),
        };
        let mut seen: HashSet<String> = merged.iter().map(|f| f.record_id.clone()).collect();
        let before = merged.len();
        for fact in facts {
            if seen.insert(fact.record_id.clone()) {
                merged.push(fact);
            } else {
                log::debug!("Skipping duplicate record {} for {}", fact.record_id, id);
            }
        }

        log::debug!("Appending {} facts to open partition {}", merged.len() - before, id);
        self.replace_locked(id, merged)
    }

    /// 删除分区
    pub fn remove_partition(&self, store_id: &str, date: NaiveDate) -> Result<bool, PartitionError> {
        let _guard = self.write_lock.lock();
        let id = PartitionId::new(store_id, date);
        let existed = self.manifest.read().get(&id).is_some();
        self.replace_locked(id, Vec::new())?;
        Ok(existed)
    }

    /// 调用方必须持有 write_lock
    fn replace_locked(
        &self,
        id: PartitionId,
        mut facts: Vec<FactRecord>,
    ) -> Result<PartitionRef, PartitionError> {
        codec::canonical_sort(&mut facts);
        let content_hash = codec::content_hash(&facts)?;
        let existing = self.manifest.read().get(&id).cloned();

        if facts.is_empty() {
            return self.drop_locked(id, existing, content_hash);
        }

        if let Some(entry) = &existing {
            let path = self.root.join(&entry.file);
            if entry.content_hash == content_hash && path.exists() {
                log::debug!("Partition {} unchanged ({})", id, content_hash);
                metrics::PARTITION_WRITES.with_label_values(&["unchanged"]).inc();
                return Ok(PartitionRef {
                    id,
                    path,
                    content_hash,
                    row_count: entry.row_count,
                    written: false,
                });
            }
        }

        let relative = relative_file(&id, &content_hash);
        let path = self.root.join(&relative);
        let file_size = file::write_partition_file(&path, &facts)?;

        let summary = self.summary_plan.as_ref().and_then(|plan| {
            match plan.aggregate(facts.iter(), None) {
                Ok(rows) => Some(rows),
                Err(e) => {
                    log::warn!("Daily summary for {} skipped: {}", id, e);
                    None
                }
            }
        });

        let entry = PartitionEntry {
            store_id: id.store_id.clone(),
            date: id.date,
            file: relative.clone(),
            content_hash: content_hash.clone(),
            row_count: facts.len(),
            file_size,
            written_at: now_secs(),
            summary,
        };

        let previous = {
            let mut manifest = self.manifest.write();
            let previous = manifest.upsert(entry);
            if let Err(e) = manifest.save() {
                match previous {
                    Some(old) => {
                        let keep_new = old.file == relative;
                        manifest.upsert(old);
                        if !keep_new {
                            remove_file_quiet(&path);
                        }
                    }
                    None => {
                        manifest.remove(&id);
                        remove_file_quiet(&path);
                    }
                }
                return Err(e);
            }
            metrics::PARTITION_FILES.set(manifest.len() as i64);
            previous
        };

        if let Some(old) = previous {
            if old.file != relative {
                remove_file_quiet(&self.root.join(&old.file));
            }
        }

        metrics::PARTITION_WRITES.with_label_values(&["written"]).inc();
        log::info!(
            "Partition {} written: {} rows, {} bytes, hash {}",
            id,
            facts.len(),
            file_size,
            content_hash
        );

        Ok(PartitionRef {
            id,
            path,
            content_hash,
            row_count: facts.len(),
            written: true,
        })
    }

    fn drop_locked(
        &self,
        id: PartitionId,
        existing: Option<PartitionEntry>,
        content_hash: String,
    ) -> Result<PartitionRef, PartitionError> {
        let Some(entry) = existing else {
            return Ok(PartitionRef {
                path: self.root.join(relative_file(&id, &content_hash)),
                id,
                content_hash,
                row_count: 0,
                written: false,
            });
        };

        {
            let mut manifest = self.manifest.write();
            manifest.remove(&id);
            if let Err(e) = manifest.save() {
                manifest.upsert(entry);
                return Err(e);
            }
            metrics::PARTITION_FILES.set(manifest.len() as i64);
        }

        let path = self.root.join(&entry.file);
        remove_file_quiet(&path);
        log::info!("Partition {} removed", id);

        Ok(PartitionRef {
            id,
            path,
            content_hash,
            row_count: 0,
            written: true,
        })
    }

    // ───────────────────────────────────────────────────────────────────────
    // 待迁移标记
    // ───────────────────────────────────────────────────────────────────────

    /// 标记分区落后于事实表，返回本次标记的序号
    pub fn mark_pending<I>(&self, ids: I) -> u64
    where
        I: IntoIterator<Item = PartitionId>,
    {
        let seq = self.pending_seq.fetch_add(1, Ordering::SeqCst) + 1;
        for id in ids {
            self.pending.insert(id, seq);
        }
        metrics::PARTITION_PENDING.set(self.pending.len() as i64);
        seq
    }

    pub fn pending_seq(&self, id: &PartitionId) -> Option<u64> {
        self.pending.get(id).map(|seq| *seq)
    }

    /// 标记序号未变时清除；读取序号之后又被标记的分区保持待迁移
    pub fn clear_pending(&self, id: &PartitionId, seq: Option<u64>) -> bool {
        let Some(seq) = seq else {
            return false;
        };
        let cleared = self
            .pending
            .remove_if(id, |_, current| *current == seq)
            .is_some();
        metrics::PARTITION_PENDING.set(self.pending.len() as i64);
        cleared
    }

    pub fn pending(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // ───────────────────────────────────────────────────────────────────────
    // 查询
    // ───────────────────────────────────────────────────────────────────────

    /// 按请求维度在匹配的分区上执行两阶段聚合
    pub fn query(
        &self,
        request: &MetricRequest,
        plan: &RebuildPlan,
        cancel: Option<&AtomicBool>,
    ) -> Result<AggregateResult, PartitionError> {
        let deadline = request.timeout().map(|t| Instant::now() + t);

        let pending = self
            .pending
            .iter()
            .filter(|e| request.filter.matches_store(&e.key().store_id) && request.filter.matches_date(e.key().date))
            .count();
        if pending > 0 {
            log::debug!(
                "Request {}: {} partitions in range are behind the fact store",
                request.request_id,
                pending
            );
            return Err(PartitionError::Incomplete { pending });
        }

        let entries: Vec<PartitionEntry> = self
            .manifest
            .read()
            .entries()
            .filter(|entry| request.filter.matches_partition(entry))
            .cloned()
            .collect();

        if entries.is_empty() {
            log::debug!("Request {}: no partition matches filter", request.request_id);
            return Ok(AggregateResult::empty(Engine::Partition, EmptyReason::PartitionMissing));
        }

        let batches = entries
            .par_iter()
            .map(|entry| {
                check_cancelled(cancel, deadline)?;
                let facts = self.read_entry(entry)?;
                Ok(facts
                    .into_iter()
                    .filter(|f| request.filter.matches_channel(&f.channel))
                    .collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>, PartitionError>>()?;
        check_cancelled(cancel, deadline)?;

        let plan = plan.with_dimensions(request.dimensions.clone());
        let mut rows = plan.aggregate(batches.iter().flatten(), None)?;
        for row in &mut rows {
            plan.project(&mut row.values, &request.fields);
        }

        log::debug!(
            "Request {}: scanned {} partitions, {} groups",
            request.request_id,
            entries.len(),
            rows.len()
        );
        Ok(AggregateResult::new(rows, Engine::Partition))
    }

    /// 读取分区文件；文件已被并发替换时按清单重新定位
    fn read_entry(&self, entry: &PartitionEntry) -> Result<Vec<FactRecord>, PartitionError> {
        match file::read_partition_file(&self.root.join(&entry.file)) {
            Err(PartitionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let current = self.manifest.read().get(&entry.id()).cloned();
                match current {
                    Some(current) if current.file != entry.file => {
                        file::read_partition_file(&self.root.join(&current.file))
                    }
                    None => Ok(Vec::new()),
                    Some(_) => Err(PartitionError::Io(e)),
                }
            }
            other => other,
        }
    }

    /// 读取单个分区的全部记录
    pub fn read_partition(
        &self,
        store_id: &str,
        date: NaiveDate,
    ) -> Result<Option<Vec<FactRecord>>, PartitionError> {
        let entry = self.manifest.read().get(&PartitionId::new(store_id, date)).cloned();
        entry.map(|e| self.read_entry(&e)).transpose()
    }

    // ───────────────────────────────────────────────────────────────────────
    // 状态
    // ───────────────────────────────────────────────────────────────────────

    pub fn get(&self, store_id: &str, date: NaiveDate) -> Option<PartitionEntry> {
        self.manifest.read().get(&PartitionId::new(store_id, date)).cloned()
    }

    pub fn partitions(&self) -> Vec<PartitionEntry> {
        self.manifest.read().entries().cloned().collect()
    }

    pub fn partition_count(&self) -> usize {
        self.manifest.read().len()
    }

    pub fn total_rows(&self) -> usize {
        self.manifest.read().total_rows()
    }

    /// 写入时预计算的日汇总
    pub fn summary(&self, store_id: &str, date: NaiveDate) -> Option<Vec<AggregateRow>> {
        self.get(store_id, date).and_then(|e| e.summary)
    }

    /// 磁盘上的 parquet 文件数
    pub fn file_count(&self) -> usize {
        count_files(&self.root, "parquet")
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        let old = self.healthy.swap(healthy, Ordering::AcqRel);
        if old != healthy {
            log::warn!("Partition store health changed: {} -> {}", old, healthy);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 辅助函数
// ═══════════════════════════════════════════════════════════════════════════

fn validate_facts(id: &PartitionId, facts: &[FactRecord]) -> Result<(), PartitionError> {
    if let Some(bad) = facts
        .iter()
        .find(|f| f.store_id != id.store_id || f.date() != id.date)
    {
        return Err(PartitionError::InvalidFacts {
            partition: id.clone(),
            record_id: bad.record_id.clone(),
        });
    }
    Ok(())
}

fn check_cancelled(cancel: Option<&AtomicBool>, deadline: Option<Instant>) -> Result<(), PartitionError> {
    if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
        return Err(PartitionError::Cancelled);
    }
    if deadline.map_or(false, |d| Instant::now() >= d) {
        return Err(PartitionError::Cancelled);
    }
    Ok(())
}

/// `<store>/<date>-<hash>.parquet`
fn relative_file(id: &PartitionId, content_hash: &str) -> String {
    format!(
        "{}/{}-{}.parquet",
        sanitize(&id.store_id),
        id.date.format("%Y-%m-%d"),
        content_hash
    )
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn remove_file_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

fn cleanup_temp_files(dir: &Path) -> Result<usize, PartitionError> {
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removed += cleanup_temp_files(&path)?;
        } else if path.extension().map_or(false, |ext| ext == "tmp") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn count_files(dir: &Path, extension: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .map(|path| {
            if path.is_dir() {
                count_files(&path, extension)
            } else if path.extension().map_or(false, |ext| ext == extension) {
                1
            } else {
                0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactCatalog};
    use crate::rollup::{compile, Dimension, FieldSpec, FormulaRegistry, MetricValue, RollupSchema};
    use chrono::NaiveDateTime;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn fact(record: &str, order: &str, store: &str, d: u32, channel: &str, revenue: i64) -> FactRecord {
        let ts = NaiveDateTime::parse_from_str(&format!("2025-01-{:02} 12:00:00", d), "%Y-%m-%d %H:%M:%S")
            .unwrap();
        FactRecord::new(record, order, store, ts, channel)
            .with_item("revenue", Amount::from_units(revenue))
            .with_order("delivery_fee", Amount::from_units(5))
    }

    fn plan() -> RebuildPlan {
        let schema = RollupSchema::new("store_daily", vec![Dimension::StoreId, Dimension::Date])
            .with_field(FieldSpec::sum("revenue", "revenue"))
            .with_field(FieldSpec::sum("delivery_fee", "delivery_fee").order_level());
        compile(
            &schema,
            &FactCatalog::new(["revenue"], ["delivery_fee"]),
            Arc::new(FormulaRegistry::with_builtins()),
        )
        .unwrap()
    }

    fn open(dir: &Path) -> PartitionStore {
        PartitionStore::open(&PartitionStoreConfig::with_root(dir))
            .unwrap()
            .with_clock(Arc::new(FixedClock::new(day(10))))
    }

    #[test]
    fn test_idempotent_write() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let facts = vec![fact("r1", "o1", "S1", 1, "meituan", 10), fact("r2", "o1", "S1", 1, "meituan", 20)];
        let first = store.write_partition("S1", day(1), facts.clone()).unwrap();
        assert!(first.written);
        assert_eq!(store.file_count(), 1);

        let mut reversed = facts;
        reversed.reverse();
        let second = store.write_partition("S1", day(1), reversed).unwrap();
        assert!(!second.written);
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn test_rewrite_replaces_file() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 1, "meituan", 10)])
            .unwrap();
        let rewritten = store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 1, "meituan", 99)])
            .unwrap();
        assert!(rewritten.written);
        assert_eq!(store.file_count(), 1);
        assert!(rewritten.path.exists());

        let facts = store.read_partition("S1", day(1)).unwrap().unwrap();
        assert_eq!(facts[0].item_field("revenue"), Some(Amount::from_units(99)));

        // 重新打开后清单仍在
        drop(store);
        let reopened = open(dir.path());
        assert_eq!(reopened.partition_count(), 1);
        assert_eq!(reopened.get("S1", day(1)).unwrap().content_hash, rewritten.content_hash);
    }

    #[test]
    fn test_invalid_facts_rejected() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let err = store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S2", 1, "meituan", 10)])
            .unwrap_err();
        assert!(matches!(err, PartitionError::InvalidFacts { .. }));

        let err = store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 2, "meituan", 10)])
            .unwrap_err();
        assert!(matches!(err, PartitionError::InvalidFacts { .. }));
        assert_eq!(store.file_count(), 0);
    }

    #[test]
    fn test_append_open_and_closed() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let err = store
            .append_open("S1", day(9), vec![fact("r1", "o1", "S1", 9, "meituan", 10)])
            .unwrap_err();
        assert!(matches!(err, PartitionError::ClosedPartition(_)));

        store
            .append_open("S1", day(10), vec![fact("r1", "o1", "S1", 10, "meituan", 10)])
            .unwrap();
        let appended = store
            .append_open(
                "S1",
                day(10),
                vec![fact("r1", "o1", "S1", 10, "meituan", 10), fact("r2", "o2", "S1", 10, "eleme", 7)],
            )
            .unwrap();
        assert!(appended.written);
        assert_eq!(appended.row_count, 2);
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn test_empty_write_removes_partition() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 1, "meituan", 10)])
            .unwrap();
        assert!(store.remove_partition("S1", day(1)).unwrap());
        assert_eq!(store.partition_count(), 0);
        assert_eq!(store.file_count(), 0);
        assert!(!store.remove_partition("S1", day(1)).unwrap());
    }

    #[test]
    fn test_query_filters_and_missing() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = plan();

        store
            .write_partition(
                "S1",
                day(1),
                vec![
                    fact("r1", "o1", "S1", 1, "meituan", 10),
                    fact("r2", "o1", "S1", 1, "meituan", 20),
                    fact("r3", "o2", "S1", 1, "eleme", 5),
                ],
            )
            .unwrap();
        store
            .write_partition("S2", day(1), vec![fact("r4", "o3", "S2", 1, "meituan", 7)])
            .unwrap();

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_stores(["S1"]);
        let result = store.query(&request, &plan, None).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get("revenue"), Some(&MetricValue::Amount(Amount::from_units(35))));
        assert_eq!(result.rows[0].get("delivery_fee"), Some(&MetricValue::Amount(Amount::from_units(10))));

        let request = MetricRequest::new("store_daily", vec![])
            .with_channels(["meituan"])
            .with_fields(["revenue"]);
        let result = store.query(&request, &plan, None).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].values.len(), 1);
        assert_eq!(result.rows[0].get("revenue"), Some(&MetricValue::Amount(Amount::from_units(37))));

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_stores(["S9"]);
        let result = store.query(&request, &plan, None).unwrap();
        assert_eq!(result.reason, Some(EmptyReason::PartitionMissing));

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_channels(["jd"]);
        let result = store.query(&request, &plan, None).unwrap();
        assert_eq!(result.reason, Some(EmptyReason::NoMatchingRows));
    }

    #[test]
    fn test_pending_partitions_block_query() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let plan = plan();
        store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 1, "meituan", 10)])
            .unwrap();

        let seq = store.mark_pending([PartitionId::new("S1", day(2))]);
        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]);
        let err = store.query(&request, &plan, None).unwrap_err();
        assert!(matches!(err, PartitionError::Incomplete { pending: 1 }));

        // 范围之外的待迁移分区不影响查询
        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_date_range(day(1), day(1));
        assert_eq!(store.query(&request, &plan, None).unwrap().rows.len(), 1);
        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_stores(["S2"]);
        assert_eq!(store.query(&request, &plan, None).unwrap().reason, Some(EmptyReason::PartitionMissing));

        // 读取序号后再次标记：旧序号不能清除
        let id = PartitionId::new("S1", day(2));
        let newer = store.mark_pending([id.clone()]);
        assert!(newer > seq);
        assert!(!store.clear_pending(&id, Some(seq)));
        assert!(store.clear_pending(&id, Some(newer)));
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_query_cancelled() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        store
            .write_partition("S1", day(1), vec![fact("r1", "o1", "S1", 1, "meituan", 10)])
            .unwrap();

        let cancel = AtomicBool::new(true);
        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]);
        let err = store.query(&request, &plan(), Some(&cancel)).unwrap_err();
        assert!(matches!(err, PartitionError::Cancelled));
    }

    #[test]
    fn test_summary_kept_in_manifest() {
        let dir = tempdir().unwrap();
        let store = open(dir.path()).with_summary_plan(Arc::new(plan()));

        store
            .write_partition(
                "S1",
                day(1),
                vec![fact("r1", "o1", "S1", 1, "meituan", 10), fact("r2", "o2", "S1", 1, "eleme", 4)],
            )
            .unwrap();

        let summary = store.summary("S1", day(1)).unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].get("revenue"), Some(&MetricValue::Amount(Amount::from_units(14))));
    }

    #[test]
    fn test_open_cleans_temp_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("S1")).unwrap();
        std::fs::write(dir.path().join("S1").join("2025-01-01-x.parquet.tmp"), b"partial").unwrap();

        let _store = open(dir.path());
        assert!(!dir.path().join("S1").join("2025-01-01-x.parquet.tmp").exists());
    }
}
