//! 汇总行与指标值

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::fact::Amount;

/// 分组键 (维度值元组，按 group_by 顺序)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<String>);

impl GroupKey {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    /// 按维度下标投影出子键
    pub fn project(&self, indices: &[usize]) -> GroupKey {
        GroupKey(indices.iter().map(|&i| self.0[i].clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// 指标值
///
/// 金额与计数保持精确类型，比率只在汇总完成后派生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Amount(Amount),
    Count(u64),
    Ratio(f64),
    Null,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Amount(a) => Some(a.to_f64()),
            MetricValue::Count(c) => Some(*c as f64),
            MetricValue::Ratio(r) => Some(*r),
            MetricValue::Null => None,
        }
    }

    pub fn as_amount(&self) -> Option<Amount> {
        match self {
            MetricValue::Amount(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            MetricValue::Count(c) => Some(*c),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// 容差比较：金额/计数要求精确相等，比率允许 `tolerance` 的相对误差
    pub fn approx_eq(&self, other: &MetricValue, tolerance: f64) -> bool {
        match (self, other) {
            (MetricValue::Amount(a), MetricValue::Amount(b)) => a == b,
            (MetricValue::Count(a), MetricValue::Count(b)) => a == b,
            (MetricValue::Null, MetricValue::Null) => true,
            (MetricValue::Ratio(a), MetricValue::Ratio(b)) => {
                if a.is_nan() || b.is_nan() {
                    return a.is_nan() && b.is_nan();
                }
                let scale = a.abs().max(b.abs()).max(1.0);
                (a - b).abs() <= tolerance * scale
            }
            _ => false,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Amount(a) => write!(f, "{}", a),
            MetricValue::Count(c) => write!(f, "{}", c),
            MetricValue::Ratio(r) => write!(f, "{:.6}", r),
            MetricValue::Null => write!(f, "null"),
        }
    }
}

/// 一行聚合结果 (与引擎无关)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub key: GroupKey,
    pub values: BTreeMap<String, MetricValue>,
}

impl AggregateRow {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }
}

/// 物化汇总行，主键 (schema, key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupRow {
    pub schema: String,
    pub key: GroupKey,
    pub values: BTreeMap<String, MetricValue>,
}

impl RollupRow {
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.values.get(name)
    }

    pub fn amount(&self, name: &str) -> Option<Amount> {
        self.values.get(name).and_then(MetricValue::as_amount)
    }

    pub fn count(&self, name: &str) -> Option<u64> {
        self.values.get(name).and_then(MetricValue::as_count)
    }
}
