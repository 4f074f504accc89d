//! 订单明细事实表
//!
//! @yutiansut @quantaxis
//!
//! 一条 `FactRecord` 对应一个订单行 (line item)：
//! - 行级字段 (item_fields): 每行不同，按订单内求和 (如行收入、行成本)
//! - 订单级字段 (order_fields): 同一订单所有行相同 (如配送费、平台佣金)，
//!   只能按 FIRST/MAX 归约，不能求和，否则多行订单会被重复计算

pub mod amount;
pub mod store;

pub use amount::{Amount, AmountParseError};
pub use store::{FactSnapshot, FactStore, FactStoreError, MemoryFactStore};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 订单行事实记录 (写入后不可变)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRecord {
    pub record_id: String,
    pub order_id: String,
    pub store_id: String,
    /// 业务本地时间
    pub timestamp: NaiveDateTime,
    pub channel: String,
    #[serde(default)]
    pub item_fields: BTreeMap<String, Amount>,
    #[serde(default)]
    pub order_fields: BTreeMap<String, Amount>,
}

impl FactRecord {
    pub fn new(
        record_id: impl Into<String>,
        order_id: impl Into<String>,
        store_id: impl Into<String>,
        timestamp: NaiveDateTime,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            order_id: order_id.into(),
            store_id: store_id.into(),
            timestamp,
            channel: channel.into(),
            item_fields: BTreeMap::new(),
            order_fields: BTreeMap::new(),
        }
    }

    pub fn with_item(mut self, name: impl Into<String>, value: Amount) -> Self {
        self.item_fields.insert(name.into(), value);
        self
    }

    pub fn with_order(mut self, name: impl Into<String>, value: Amount) -> Self {
        self.order_fields.insert(name.into(), value);
        self
    }

    /// 业务日期 (分区日期)
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn item_field(&self, name: &str) -> Option<Amount> {
        self.item_fields.get(name).copied()
    }

    pub fn order_field(&self, name: &str) -> Option<Amount> {
        self.order_fields.get(name).copied()
    }
}

/// 事实表字段目录
///
/// Schema 编译时用于校验字段来源，以及区分行级/订单级字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCatalog {
    #[serde(default)]
    pub item_fields: BTreeSet<String>,
    #[serde(default)]
    pub order_fields: BTreeSet<String>,
}

/// 字段归属
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldLevel {
    Item,
    Order,
}

impl FactCatalog {
    pub fn new<I, O, S, T>(item_fields: I, order_fields: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            item_fields: item_fields.into_iter().map(Into::into).collect(),
            order_fields: order_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// 从样本记录推断字段目录
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FactRecord>) -> Self {
        let mut catalog = Self::default();
        for record in records {
            catalog.item_fields.extend(record.item_fields.keys().cloned());
            catalog.order_fields.extend(record.order_fields.keys().cloned());
        }
        catalog
    }

    pub fn level_of(&self, name: &str) -> Option<FieldLevel> {
        if self.order_fields.contains(name) {
            Some(FieldLevel::Order)
        } else if self.item_fields.contains(name) {
            Some(FieldLevel::Item)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_record_builder() {
        let record = FactRecord::new("r1", "o1", "S1", ts("2025-01-01 12:30:00"), "meituan")
            .with_item("revenue", Amount::from_units(10))
            .with_order("delivery_fee", Amount::from_units(5));

        assert_eq!(record.date(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(record.item_field("revenue"), Some(Amount::from_units(10)));
        assert_eq!(record.order_field("delivery_fee"), Some(Amount::from_units(5)));
        assert_eq!(record.item_field("delivery_fee"), None);
    }

    #[test]
    fn test_catalog_levels() {
        let catalog = FactCatalog::new(["revenue", "cost"], ["delivery_fee"]);
        assert_eq!(catalog.level_of("revenue"), Some(FieldLevel::Item));
        assert_eq!(catalog.level_of("delivery_fee"), Some(FieldLevel::Order));
        assert_eq!(catalog.level_of("unknown"), None);
    }

    #[test]
    fn test_record_json_roundtrip_shape() {
        let json = r#"{
            "record_id": "r1", "order_id": "o1", "store_id": "S1",
            "timestamp": "2025-01-01T09:00:00", "channel": "eleme",
            "item_fields": {"revenue": "10.50"},
            "order_fields": {"delivery_fee": 5}
        }"#;
        let record: FactRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.item_field("revenue"), Some(Amount::from_cents(1050)));
        assert_eq!(record.order_field("delivery_fee"), Some(Amount::from_units(5)));
    }
}
