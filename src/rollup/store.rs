//! 汇总表存储
//!
//! 行按 (schema, scope) 切片保存，scope 为门店 ID，
//! 不含 STORE_ID 维度的汇总表使用全局 scope `*`。
//!
//! 一个批次内所有切片在同一次写锁内替换，读者在读锁内收集 `Arc` 切片，
//! 因此永远看不到半个批次。

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::row::RollupRow;

/// 全局 scope
pub const GLOBAL_SCOPE: &str = "*";

/// 切片标识 "schema/scope"
pub fn slice_key(schema: &str, scope: &str) -> String {
    format!("{}/{}", schema, scope)
}

type Slice = Arc<Vec<RollupRow>>;

/// 一次原子替换的切片集合
#[derive(Debug, Default)]
pub struct RollupBatch {
    slices: Vec<(String, String, Vec<RollupRow>)>,
}

impl RollupBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用 `rows` 整体替换 (schema, scope)；空行集表示删除该切片
    pub fn replace(&mut self, schema: impl Into<String>, scope: impl Into<String>, rows: Vec<RollupRow>) {
        self.slices.push((schema.into(), scope.into(), rows));
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// 批次涉及的切片 (schema, scope)
    pub fn slice_ids(&self) -> Vec<(String, String)> {
        self.slices
            .iter()
            .map(|(schema, scope, _)| (schema.clone(), scope.clone()))
            .collect()
    }

    /// 批次中的所有行
    pub fn rows(&self) -> impl Iterator<Item = &RollupRow> {
        self.slices.iter().flat_map(|(_, _, rows)| rows.iter())
    }
}

/// 汇总表存储
pub struct RollupStore {
    /// schema -> scope -> 行
    tables: RwLock<HashMap<String, HashMap<String, Slice>>>,
    version: AtomicU64,
    healthy: AtomicBool,
}

impl RollupStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// 原子提交批次，返回新版本号
    pub fn commit(&self, batch: RollupBatch) -> u64 {
        let slices = batch.slices.len();
        let mut tables = self.tables.write();
        for (schema, scope, rows) in batch.slices {
            let table = tables.entry(schema).or_default();
            if rows.is_empty() {
                table.remove(&scope);
            } else {
                table.insert(scope, Arc::new(rows));
            }
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        drop(tables);

        log::debug!("Rollup store committed {} slices (version {})", slices, version);
        version
    }

    /// 读取单个切片
    pub fn get(&self, schema: &str, scope: &str) -> Option<Arc<Vec<RollupRow>>> {
        self.tables
            .read()
            .get(schema)
            .and_then(|table| table.get(scope))
            .cloned()
    }

    /// 某汇总表的全部 scope
    pub fn scopes(&self, schema: &str) -> Vec<String> {
        let mut scopes: Vec<String> = self
            .tables
            .read()
            .get(schema)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        scopes.sort();
        scopes
    }

    /// 一次读锁内取多个切片的一致快照；`scopes` 为 None 时取全部
    pub fn snapshot(&self, schema: &str, scopes: Option<&[String]>) -> Vec<Arc<Vec<RollupRow>>> {
        let tables = self.tables.read();
        let Some(table) = tables.get(schema) else {
            return Vec::new();
        };
        match scopes {
            Some(scopes) => scopes.iter().filter_map(|s| table.get(s).cloned()).collect(),
            None => {
                let mut entries: Vec<_> = table.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                entries.into_iter().map(|(_, slice)| slice.clone()).collect()
            }
        }
    }

    /// 全部切片标识 "schema/scope"
    pub fn keys(&self) -> Vec<String> {
        let tables = self.tables.read();
        let mut keys: Vec<String> = tables
            .iter()
            .flat_map(|(schema, table)| table.keys().map(move |scope| slice_key(schema, scope)))
            .collect();
        keys.sort();
        keys
    }

    pub fn row_count(&self) -> usize {
        self.tables
            .read()
            .values()
            .flat_map(|table| table.values())
            .map(|slice| slice.len())
            .sum()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl Default for RollupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Amount;
    use crate::rollup::row::{GroupKey, MetricValue};
    use std::collections::BTreeMap;

    fn row(schema: &str, store: &str, revenue: i64) -> RollupRow {
        let mut values = BTreeMap::new();
        values.insert(
            "total_revenue".to_string(),
            MetricValue::Amount(Amount::from_units(revenue)),
        );
        RollupRow {
            schema: schema.to_string(),
            key: GroupKey::new([store]),
            values,
        }
    }

    #[test]
    fn test_commit_and_snapshot() {
        let store = RollupStore::new();
        let mut batch = RollupBatch::new();
        batch.replace("by_store", "S1", vec![row("by_store", "S1", 10)]);
        batch.replace("by_store", "S2", vec![row("by_store", "S2", 20)]);
        batch.replace("global", GLOBAL_SCOPE, vec![row("global", "all", 30)]);
        assert_eq!(store.commit(batch), 1);

        assert_eq!(store.scopes("by_store"), vec!["S1", "S2"]);
        assert_eq!(store.snapshot("by_store", None).len(), 2);
        assert_eq!(store.get("global", GLOBAL_SCOPE).unwrap().len(), 1);
        assert_eq!(store.keys(), vec!["by_store/S1", "by_store/S2", "global/*"]);
        assert_eq!(store.row_count(), 3);
    }

    #[test]
    fn test_empty_rows_remove_slice() {
        let store = RollupStore::new();
        let mut batch = RollupBatch::new();
        batch.replace("by_store", "S1", vec![row("by_store", "S1", 10)]);
        store.commit(batch);

        let mut batch = RollupBatch::new();
        batch.replace("by_store", "S1", Vec::new());
        assert_eq!(store.commit(batch), 2);
        assert!(store.get("by_store", "S1").is_none());
    }

    #[test]
    fn test_old_snapshot_unaffected_by_commit() {
        let store = RollupStore::new();
        let mut batch = RollupBatch::new();
        batch.replace("by_store", "S1", vec![row("by_store", "S1", 10)]);
        store.commit(batch);

        let before = store.get("by_store", "S1").unwrap();
        let mut batch = RollupBatch::new();
        batch.replace("by_store", "S1", vec![row("by_store", "S1", 99)]);
        store.commit(batch);

        assert_eq!(before[0].amount("total_revenue"), Some(Amount::from_units(10)));
        assert_eq!(
            store.get("by_store", "S1").unwrap()[0].amount("total_revenue"),
            Some(Amount::from_units(99))
        );
    }
}
