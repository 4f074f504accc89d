//! 事实表存储适配器
//!
//! 行式、只追加 (append-only) 的订单行存储。
//! 供 Schema 重建计划和分区写入器读取。

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::FactRecord;

/// 事实表错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactStoreError {
    #[error("Fact store unavailable: {0}")]
    Unavailable(String),

    #[error("Duplicate record id: {0}")]
    DuplicateRecord(String),

    #[error("Invalid record {record_id}: {reason}")]
    InvalidRecord { record_id: String, reason: String },
}

/// 事实表只读接口
pub trait FactStore: Send + Sync {
    /// 记录总数 (路由器据此选择引擎)
    fn count(&self) -> Result<u64, FactStoreError>;

    /// 所有分区键 (store_id)
    fn partition_keys(&self) -> Result<Vec<String>, FactStoreError>;

    /// 读取指定分区键的全部记录
    fn scan_keys(&self, keys: &BTreeSet<String>) -> Result<Vec<FactRecord>, FactStoreError>;

    /// 全表扫描，附带扫描时刻的数据版本
    fn scan_all(&self) -> Result<FactSnapshot, FactStoreError>;

    /// 某门店有数据的日期
    fn partition_dates(&self, store_id: &str) -> Result<Vec<NaiveDate>, FactStoreError>;

    /// 读取 (store_id, date) 分区的全部记录
    fn scan_partition(
        &self,
        store_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<FactRecord>, FactStoreError>;
}

/// 全表快照
#[derive(Debug, Clone, Default)]
pub struct FactSnapshot {
    /// 每次追加或清除加一
    pub version: u64,
    pub records: Vec<FactRecord>,
}

/// 订单头：同一订单的所有行必须一致
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderHeader {
    store_id: String,
    channel: String,
    timestamp: NaiveDateTime,
}

impl OrderHeader {
    fn of(record: &FactRecord) -> Self {
        Self {
            store_id: record.store_id.clone(),
            channel: record.channel.clone(),
            timestamp: record.timestamp,
        }
    }
}

#[derive(Default)]
struct FactTable {
    /// store_id -> 记录 (按写入顺序)
    by_store: BTreeMap<String, Vec<FactRecord>>,
    record_ids: HashSet<String>,
    /// order_id -> 订单头
    orders: HashMap<String, OrderHeader>,
}

/// 内存事实表
pub struct MemoryFactStore {
    table: RwLock<FactTable>,
    record_count: AtomicU64,
    /// 只在持有写锁时推进
    version: AtomicU64,
    available: AtomicBool,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(FactTable::default()),
            record_count: AtomicU64::new(0),
            version: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// 批量追加记录，返回受影响的分区键
    ///
    /// 批内任一记录无效或 record_id 重复时整批拒绝。
    /// 同一订单的行 (含此前写入的行) 必须共享 store_id、channel 与 timestamp，
    /// 否则订单会落入不同分组，订单级字段在上卷时被重复计算。
    pub fn append(&self, records: Vec<FactRecord>) -> Result<BTreeSet<String>, FactStoreError> {
        self.check_available()?;

        let mut table = self.table.write();

        let mut batch_ids = HashSet::with_capacity(records.len());
        let mut batch_orders: HashMap<&str, OrderHeader> = HashMap::new();
        for record in &records {
            if record.record_id.is_empty() || record.order_id.is_empty() {
                return Err(FactStoreError::InvalidRecord {
                    record_id: record.record_id.clone(),
                    reason: "record_id and order_id are required".to_string(),
                });
            }
            if record.store_id.is_empty() {
                return Err(FactStoreError::InvalidRecord {
                    record_id: record.record_id.clone(),
                    reason: "store_id is required".to_string(),
                });
            }
            if table.record_ids.contains(&record.record_id)
                || !batch_ids.insert(record.record_id.clone())
            {
                return Err(FactStoreError::DuplicateRecord(record.record_id.clone()));
            }

            let header = OrderHeader::of(record);
            let known = table
                .orders
                .get(&record.order_id)
                .or_else(|| batch_orders.get(record.order_id.as_str()));
            match known {
                Some(existing) if *existing != header => {
                    return Err(FactStoreError::InvalidRecord {
                        record_id: record.record_id.clone(),
                        reason: format!(
                            "order {} lines disagree on store, channel or timestamp",
                            record.order_id
                        ),
                    });
                }
                Some(_) => {}
                None => {
                    batch_orders.insert(record.order_id.as_str(), header);
                }
            }
        }

        let new_orders: Vec<(String, OrderHeader)> = batch_orders
            .into_iter()
            .map(|(order_id, header)| (order_id.to_string(), header))
            .collect();
        table.orders.extend(new_orders);

        let mut affected = BTreeSet::new();
        let appended = records.len() as u64;
        for record in records {
            affected.insert(record.store_id.clone());
            table.record_ids.insert(record.record_id.clone());
            table
                .by_store
                .entry(record.store_id.clone())
                .or_default()
                .push(record);
        }

        self.record_count.fetch_add(appended, Ordering::SeqCst);
        self.version.fetch_add(1, Ordering::SeqCst);
        log::debug!("Appended {} fact records across {} stores", appended, affected.len());

        Ok(affected)
    }

    /// 清除某门店的全部记录，返回删除条数
    pub fn purge(&self, store_id: &str) -> usize {
        let mut table = self.table.write();
        let removed = table.by_store.remove(store_id).unwrap_or_default();
        for record in &removed {
            table.record_ids.remove(&record.record_id);
        }
        table.orders.retain(|_, header| header.store_id != store_id);
        self.record_count
            .fetch_sub(removed.len() as u64, Ordering::SeqCst);
        if !removed.is_empty() {
            self.version.fetch_add(1, Ordering::SeqCst);
            log::info!("Purged {} fact records of store {}", removed.len(), store_id);
        }
        removed.len()
    }

    /// 清除某门店某日的记录
    pub fn purge_partition(&self, store_id: &str, date: NaiveDate) -> usize {
        let mut table = self.table.write();
        let FactTable {
            by_store,
            record_ids,
            orders,
        } = &mut *table;

        let Some(records) = by_store.get_mut(store_id) else {
            return 0;
        };

        let before = records.len();
        records.retain(|r| {
            if r.date() == date {
                record_ids.remove(&r.record_id);
                false
            } else {
                true
            }
        });
        let removed = before - records.len();
        if records.is_empty() {
            by_store.remove(store_id);
        }
        // 订单的所有行同日，整单随分区清除
        orders.retain(|_, header| header.store_id != store_id || header.timestamp.date() != date);

        self.record_count.fetch_sub(removed as u64, Ordering::SeqCst);
        if removed > 0 {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// 当前数据版本
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// 模拟存储不可用 (测试/运维使用)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), FactStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FactStoreError::Unavailable(
                "memory fact store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryFactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore for MemoryFactStore {
    fn count(&self) -> Result<u64, FactStoreError> {
        self.check_available()?;
        Ok(self.record_count.load(Ordering::SeqCst))
    }

    fn partition_keys(&self) -> Result<Vec<String>, FactStoreError> {
        self.check_available()?;
        Ok(self.table.read().by_store.keys().cloned().collect())
    }

    fn scan_keys(&self, keys: &BTreeSet<String>) -> Result<Vec<FactRecord>, FactStoreError> {
        self.check_available()?;
        let table = self.table.read();
        Ok(keys
            .iter()
            .filter_map(|key| table.by_store.get(key))
            .flat_map(|records| records.iter().cloned())
            .collect())
    }

    fn scan_all(&self) -> Result<FactSnapshot, FactStoreError> {
        self.check_available()?;
        let table = self.table.read();
        Ok(FactSnapshot {
            version: self.version.load(Ordering::SeqCst),
            records: table.by_store.values().flatten().cloned().collect(),
        })
    }

    fn partition_dates(&self, store_id: &str) -> Result<Vec<NaiveDate>, FactStoreError> {
        self.check_available()?;
        let table = self.table.read();
        let dates: BTreeSet<NaiveDate> = table
            .by_store
            .get(store_id)
            .map(|records| records.iter().map(|r| r.date()).collect())
            .unwrap_or_default();
        Ok(dates.into_iter().collect())
    }

    fn scan_partition(
        &self,
        store_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<FactRecord>, FactStoreError> {
        self.check_available()?;
        let table = self.table.read();
        Ok(table
            .by_store
            .get(store_id)
            .map(|records| records.iter().filter(|r| r.date() == date).cloned().collect())
            .unwrap_or_default())
    }
}
