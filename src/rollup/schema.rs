//! 声明式汇总表定义
//!
//! 部署时通过配置文件声明，例如：
//!
//! ```toml
//! [[schemas]]
//! name = "store_daily"
//! group_by = ["STORE_ID", "DATE"]
//! fields = [
//!     { name = "total_revenue", source = { field = "revenue" }, agg = "SUM" },
//!     { name = "total_delivery_fee", source = { field = "delivery_fee" }, agg = "SUM", is_order_level = true },
//!     { name = "order_count", source = "order_id", agg = "COUNT_DISTINCT" },
//! ]
//! derived_fields = [
//!     { name = "avg_order_value", formula = "safe_ratio", inputs = ["total_revenue", "order_count"] },
//! ]
//! ```

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::fact::{Amount, FactRecord};

/// 分组维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    StoreId,
    Channel,
    /// YYYY-MM-DD
    Date,
    /// YYYY-MM
    Month,
    /// 00-23
    Hour,
}

impl Dimension {
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::StoreId => "store_id",
            Dimension::Channel => "channel",
            Dimension::Date => "date",
            Dimension::Month => "month",
            Dimension::Hour => "hour",
        }
    }

    /// 从事实记录提取维度值
    pub fn extract(&self, fact: &FactRecord) -> String {
        match self {
            Dimension::StoreId => fact.store_id.clone(),
            Dimension::Channel => fact.channel.clone(),
            Dimension::Date => fact.timestamp.format("%Y-%m-%d").to_string(),
            Dimension::Month => fact.timestamp.format("%Y-%m").to_string(),
            Dimension::Hour => format!("{:02}", fact.timestamp.hour()),
        }
    }
}

/// 聚合函数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggFunc {
    Sum,
    Count,
    CountDistinct,
    Max,
    Min,
    First,
}

impl AggFunc {
    /// 是否可以在已汇总的行之上再次合并 (上卷)
    pub fn is_mergeable(self) -> bool {
        matches!(self, AggFunc::Sum | AggFunc::Count | AggFunc::Max | AggFunc::Min)
    }
}

/// 字段来源表达式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceExpr {
    /// 事实表数值字段 (行级或订单级)
    Field(String),
    /// 常量
    Constant(Amount),
    OrderId,
    RecordId,
}

impl SourceExpr {
    /// 是否为文本值 (只能计数)
    pub fn is_textual(&self) -> bool {
        matches!(self, SourceExpr::OrderId | SourceExpr::RecordId)
    }
}

/// 汇总字段定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub source: SourceExpr,
    pub agg: AggFunc,
    /// 订单级字段：先按订单取值 (MAX) 再参与外层聚合
    #[serde(default)]
    pub is_order_level: bool,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, source: SourceExpr, agg: AggFunc) -> Self {
        Self {
            name: name.into(),
            source,
            agg,
            is_order_level: false,
        }
    }

    /// SUM(field)
    pub fn sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::new(name, SourceExpr::Field(field.into()), AggFunc::Sum)
    }

    pub fn order_level(mut self) -> Self {
        self.is_order_level = true;
        self
    }
}

/// 派生字段：基于已聚合字段的公式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    /// 公式名 (注入的公式表中的键)
    pub formula: String,
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl DerivedField {
    pub fn new<I, S>(name: impl Into<String>, formula: impl Into<String>, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            formula: formula.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
        }
    }
}

fn default_version() -> u32 {
    1
}

/// 汇总表定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupSchema {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub group_by: Vec<Dimension>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub derived_fields: Vec<DerivedField>,
}

impl RollupSchema {
    pub fn new(name: impl Into<String>, group_by: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            group_by,
            fields: Vec::new(),
            derived_fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_derived(mut self, derived: DerivedField) -> Self {
        self.derived_fields.push(derived);
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn has_dimension(&self, dimension: Dimension) -> bool {
        self.group_by.contains(&dimension)
    }

    /// 按门店划分 (可按门店增量重建)
    pub fn is_store_scoped(&self) -> bool {
        self.has_dimension(Dimension::StoreId)
    }
}
