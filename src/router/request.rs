// 查询请求与结果类型
//
// 两个引擎共用同一套请求/响应结构，调用方看不出结果来自哪个引擎。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use super::Engine;
use crate::fact::FactRecord;
use crate::partition::PartitionEntry;
use crate::rollup::{AggregateRow, Dimension};

// ═══════════════════════════════════════════════════════════════════════════
// 过滤条件
// ═══════════════════════════════════════════════════════════════════════════

/// 查询过滤条件，`None` 表示不过滤
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub stores: Option<BTreeSet<String>>,
    /// 闭区间 [start, end]
    #[serde(default)]
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    #[serde(default)]
    pub channels: Option<BTreeSet<String>>,
}

impl QueryFilter {
    pub fn is_empty(&self) -> bool {
        self.stores.is_none() && self.date_range.is_none() && self.channels.is_none()
    }

    pub fn matches_store(&self, store_id: &str) -> bool {
        self.stores.as_ref().map_or(true, |s| s.contains(store_id))
    }

    pub fn matches_date(&self, date: NaiveDate) -> bool {
        self.date_range
            .map_or(true, |(start, end)| date >= start && date <= end)
    }

    pub fn matches_channel(&self, channel: &str) -> bool {
        self.channels.as_ref().map_or(true, |c| c.contains(channel))
    }

    pub fn matches_fact(&self, fact: &FactRecord) -> bool {
        self.matches_store(&fact.store_id)
            && self.matches_date(fact.date())
            && self.matches_channel(&fact.channel)
    }

    /// 分区级裁剪 (渠道过滤在读取后进行)
    pub fn matches_partition(&self, entry: &PartitionEntry) -> bool {
        self.matches_store(&entry.store_id) && self.matches_date(entry.date)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 请求
// ═══════════════════════════════════════════════════════════════════════════

/// 指标查询请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub schema: String,
    /// 结果分组维度，必须是 schema.group_by 的子集
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub filter: QueryFilter,
    /// 输出列，空表示全部
    #[serde(default)]
    pub fields: Vec<String>,
    /// 超时 (毫秒)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl MetricRequest {
    pub fn new(schema: impl Into<String>, dimensions: Vec<Dimension>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            schema: schema.into(),
            dimensions,
            filter: QueryFilter::default(),
            fields: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn with_stores<I, S>(mut self, stores: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.stores = Some(stores.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.filter.date_range = Some((start, end));
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 结果
// ═══════════════════════════════════════════════════════════════════════════

/// 空结果原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyReason {
    /// 没有任何分区匹配过滤条件
    PartitionMissing,
    NoMatchingRows,
}

/// 聚合结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub rows: Vec<AggregateRow>,
    pub engine: Engine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EmptyReason>,
}

impl AggregateResult {
    /// 空行集合时自动补上 `NoMatchingRows`
    pub fn new(rows: Vec<AggregateRow>, engine: Engine) -> Self {
        let reason = rows.is_empty().then_some(EmptyReason::NoMatchingRows);
        Self { rows, engine, reason }
    }

    pub fn empty(engine: Engine, reason: EmptyReason) -> Self {
        Self {
            rows: Vec::new(),
            engine,
            reason: Some(reason),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
