//! 两阶段聚合内核
//!
//! 阶段一按 (分组键, order_id) 归约同一订单的所有行，
//! 阶段二按分组键聚合订单级部分结果。
//!
//! 汇总表重建与分区扫描都调用此内核，两个引擎的数值结果因此完全一致。
//! 订单级字段 (配送费等) 在阶段一按 MAX 归约为每单一个值，
//! 多行订单不会被重复计算。

use std::collections::{BTreeMap, BTreeSet};

use super::formula::FormulaError;
use super::row::{AggregateRow, GroupKey, MetricValue};
use super::schema::{AggFunc, Dimension, FieldSpec, SourceExpr};
use crate::fact::{Amount, FactRecord};

/// 聚合错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("Arithmetic overflow while aggregating field {field}")]
    Overflow { field: String },

    #[error("Formula {formula} failed for derived field {field}: {source}")]
    Formula {
        field: String,
        formula: String,
        #[source]
        source: FormulaError,
    },

    #[error("Field {field} ({agg:?}) cannot be merged across groups")]
    NotMergeable { field: String, agg: AggFunc },

    #[error("Dimension {0:?} is not part of the source grouping")]
    UnsupportedDimension(Dimension),
}

// ═══════════════════════════════════════════════════════════════════════════
// 阶段一：订单内归约
// ═══════════════════════════════════════════════════════════════════════════

enum LineValue<'a> {
    Amount(Amount),
    Text(&'a str),
}

impl LineValue<'_> {
    fn amount(&self) -> Option<Amount> {
        match self {
            LineValue::Amount(a) => Some(*a),
            LineValue::Text(_) => None,
        }
    }

    fn distinct_key(&self) -> String {
        match self {
            LineValue::Amount(a) => a.raw().to_string(),
            LineValue::Text(s) => (*s).to_string(),
        }
    }
}

fn line_value<'a>(field: &FieldSpec, fact: &'a FactRecord) -> Option<LineValue<'a>> {
    match &field.source {
        SourceExpr::Field(name) => {
            let value = if field.is_order_level {
                fact.order_field(name)
            } else {
                fact.item_field(name)
            };
            value.map(LineValue::Amount)
        }
        SourceExpr::Constant(amount) => Some(LineValue::Amount(*amount)),
        SourceExpr::OrderId => Some(LineValue::Text(&fact.order_id)),
        SourceExpr::RecordId => Some(LineValue::Text(&fact.record_id)),
    }
}

/// 单个订单在某字段上的部分结果
#[derive(Debug, Clone)]
enum OrderPartial {
    /// SUM/MAX/MIN，以及订单级 FIRST (按 MAX 归约)
    Amount(Option<Amount>),
    Count(u64),
    Distinct(BTreeSet<String>),
    /// 行级 FIRST: record_id 最小的行
    First(Option<(String, Option<Amount>)>),
}

impl OrderPartial {
    fn empty(field: &FieldSpec) -> Self {
        match field.agg {
            AggFunc::Count => OrderPartial::Count(0),
            AggFunc::CountDistinct => OrderPartial::Distinct(BTreeSet::new()),
            AggFunc::First if !field.is_order_level => OrderPartial::First(None),
            _ => OrderPartial::Amount(None),
        }
    }

    fn accumulate(&mut self, field: &FieldSpec, fact: &FactRecord) -> Result<(), AggregationError> {
        let value = line_value(field, fact);
        match self {
            OrderPartial::Count(n) => {
                if value.is_some() {
                    // 订单级计数每单最多记 1
                    *n = if field.is_order_level { 1 } else { *n + 1 };
                }
            }
            OrderPartial::Distinct(set) => {
                if let Some(v) = value {
                    set.insert(v.distinct_key());
                }
            }
            OrderPartial::First(slot) => {
                let replace = match slot {
                    Some((record_id, _)) => fact.record_id < *record_id,
                    None => true,
                };
                if replace {
                    *slot = Some((
                        fact.record_id.clone(),
                        value.and_then(|v| v.amount()),
                    ));
                }
            }
            OrderPartial::Amount(acc) => {
                let Some(amount) = value.and_then(|v| v.amount()) else {
                    return Ok(());
                };
                let reduce = if field.is_order_level {
                    AggFunc::Max
                } else {
                    field.agg
                };
                *acc = Some(match (*acc, reduce) {
                    (None, _) => amount,
                    (Some(current), AggFunc::Sum) => current
                        .checked_add(amount)
                        .ok_or_else(|| overflow(field))?,
                    (Some(current), AggFunc::Min) => current.min(amount),
                    (Some(current), _) => current.max(amount),
                });
            }
        }
        Ok(())
    }

    fn amount(&self) -> Option<Amount> {
        match self {
            OrderPartial::Amount(a) => *a,
            OrderPartial::First(slot) => slot.as_ref().and_then(|(_, v)| *v),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 阶段二：分组聚合
// ═══════════════════════════════════════════════════════════════════════════

enum GroupAcc {
    Sum(Amount),
    Count(u64),
    Distinct(BTreeSet<String>),
    Extreme(Option<Amount>),
    /// 外层 Option 表示是否已取到第一个订单
    First(Option<Option<Amount>>),
}

impl GroupAcc {
    fn empty(field: &FieldSpec) -> Self {
        match field.agg {
            AggFunc::Sum => GroupAcc::Sum(Amount::ZERO),
            AggFunc::Count => GroupAcc::Count(0),
            AggFunc::CountDistinct => GroupAcc::Distinct(BTreeSet::new()),
            AggFunc::Max | AggFunc::Min => GroupAcc::Extreme(None),
            AggFunc::First => GroupAcc::First(None),
        }
    }

    /// 按 order_id 升序调用
    fn absorb(&mut self, field: &FieldSpec, partial: OrderPartial) -> Result<(), AggregationError> {
        match self {
            GroupAcc::Sum(total) => {
                if let Some(amount) = partial.amount() {
                    *total = total.checked_add(amount).ok_or_else(|| overflow(field))?;
                }
            }
            GroupAcc::Count(total) => {
                if let OrderPartial::Count(n) = partial {
                    *total = total.checked_add(n).ok_or_else(|| overflow(field))?;
                }
            }
            GroupAcc::Distinct(set) => {
                if let OrderPartial::Distinct(values) = partial {
                    set.extend(values);
                }
            }
            GroupAcc::Extreme(current) => {
                if let Some(amount) = partial.amount() {
                    *current = Some(match (*current, field.agg) {
                        (None, _) => amount,
                        (Some(c), AggFunc::Min) => c.min(amount),
                        (Some(c), _) => c.max(amount),
                    });
                }
            }
            GroupAcc::First(slot) => {
                if slot.is_none() {
                    *slot = Some(partial.amount());
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> MetricValue {
        match self {
            GroupAcc::Sum(total) => MetricValue::Amount(total),
            GroupAcc::Count(n) => MetricValue::Count(n),
            GroupAcc::Distinct(set) => MetricValue::Count(set.len() as u64),
            GroupAcc::Extreme(Some(a)) | GroupAcc::First(Some(Some(a))) => MetricValue::Amount(a),
            GroupAcc::Extreme(None) | GroupAcc::First(_) => MetricValue::Null,
        }
    }
}

fn overflow(field: &FieldSpec) -> AggregationError {
    AggregationError::Overflow {
        field: field.name.clone(),
    }
}

/// 计算事实记录的分组键
pub fn group_key(dimensions: &[Dimension], fact: &FactRecord) -> GroupKey {
    GroupKey(dimensions.iter().map(|d| d.extract(fact)).collect())
}

/// 对事实记录执行两阶段聚合 (不含派生字段)
///
/// `keys` 非空时只输出这些分组键。输出按分组键升序。
pub fn aggregate<'a, I>(
    dimensions: &[Dimension],
    fields: &[FieldSpec],
    facts: I,
    keys: Option<&BTreeSet<GroupKey>>,
) -> Result<Vec<AggregateRow>, AggregationError>
where
    I: IntoIterator<Item = &'a FactRecord>,
{
    // 分组键 -> order_id -> 每字段部分结果
    let mut orders: BTreeMap<GroupKey, BTreeMap<&'a str, Vec<OrderPartial>>> = BTreeMap::new();

    for fact in facts {
        let key = group_key(dimensions, fact);
        if let Some(keys) = keys {
            if !keys.contains(&key) {
                continue;
            }
        }

        let partials = orders
            .entry(key)
            .or_default()
            .entry(fact.order_id.as_str())
            .or_insert_with(|| fields.iter().map(OrderPartial::empty).collect());

        for (field, partial) in fields.iter().zip(partials.iter_mut()) {
            partial.accumulate(field, fact)?;
        }
    }

    let mut rows = Vec::with_capacity(orders.len());
    for (key, by_order) in orders {
        let mut accs: Vec<GroupAcc> = fields.iter().map(GroupAcc::empty).collect();
        for (_, partials) in by_order {
            for ((field, acc), partial) in fields.iter().zip(accs.iter_mut()).zip(partials) {
                acc.absorb(field, partial)?;
            }
        }

        let values = fields
            .iter()
            .zip(accs)
            .map(|(field, acc)| (field.name.clone(), acc.finish()))
            .collect();
        rows.push(AggregateRow { key, values });
    }

    Ok(rows)
}

// ═══════════════════════════════════════════════════════════════════════════
// 上卷：在已汇总行上重新分组
// ═══════════════════════════════════════════════════════════════════════════

/// 将按 `source_dims` 汇总的行重新分组到 `target_dims`
///
/// 目标维度集合与源相同时只做键重排；否则只能合并 SUM/COUNT/MAX/MIN 字段，
/// `required` 中包含不可合并字段时返回 `NotMergeable`。
/// 返回值只含基础字段，派生字段由调用方重新计算。
pub fn regroup<'a, I>(
    fields: &[FieldSpec],
    source_dims: &[Dimension],
    target_dims: &[Dimension],
    rows: I,
    required: &BTreeSet<String>,
) -> Result<Vec<AggregateRow>, AggregationError>
where
    I: IntoIterator<Item = (&'a GroupKey, &'a BTreeMap<String, MetricValue>)>,
{
    let indices = target_dims
        .iter()
        .map(|dim| {
            source_dims
                .iter()
                .position(|d| d == dim)
                .ok_or(AggregationError::UnsupportedDimension(*dim))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let identity = {
        let target: BTreeSet<_> = target_dims.iter().collect();
        let source: BTreeSet<_> = source_dims.iter().collect();
        target == source
    };

    let carried: Vec<&FieldSpec> = if identity {
        fields.iter().collect()
    } else {
        for field in fields {
            if !field.agg.is_mergeable() && required.contains(&field.name) {
                return Err(AggregationError::NotMergeable {
                    field: field.name.clone(),
                    agg: field.agg,
                });
            }
        }
        fields.iter().filter(|f| f.agg.is_mergeable()).collect()
    };

    let mut merged: BTreeMap<GroupKey, BTreeMap<String, MetricValue>> = BTreeMap::new();
    for (key, values) in rows {
        let target_key = key.project(&indices);
        match merged.get_mut(&target_key) {
            Some(acc) => {
                for field in &carried {
                    let next = values.get(&field.name).unwrap_or(&MetricValue::Null);
                    let current = acc
                        .entry(field.name.clone())
                        .or_insert(MetricValue::Null);
                    *current = merge_value(field, current, next)?;
                }
            }
            None => {
                let initial = carried
                    .iter()
                    .map(|field| {
                        let value = values.get(&field.name).cloned().unwrap_or(MetricValue::Null);
                        (field.name.clone(), value)
                    })
                    .collect();
                merged.insert(target_key, initial);
            }
        }
    }

    Ok(merged
        .into_iter()
        .map(|(key, values)| AggregateRow { key, values })
        .collect())
}

fn merge_value(
    field: &FieldSpec,
    current: &MetricValue,
    next: &MetricValue,
) -> Result<MetricValue, AggregationError> {
    let merged = match field.agg {
        AggFunc::Sum => match (current.as_amount(), next.as_amount()) {
            (Some(a), Some(b)) => MetricValue::Amount(a.checked_add(b).ok_or_else(|| overflow(field))?),
            (Some(a), None) | (None, Some(a)) => MetricValue::Amount(a),
            (None, None) => MetricValue::Null,
        },
        AggFunc::Count | AggFunc::CountDistinct => {
            let a = current.as_count().unwrap_or(0);
            let b = next.as_count().unwrap_or(0);
            MetricValue::Count(a.checked_add(b).ok_or_else(|| overflow(field))?)
        }
        AggFunc::Max | AggFunc::Min => match (current.as_amount(), next.as_amount()) {
            (Some(a), Some(b)) if field.agg == AggFunc::Min => MetricValue::Amount(a.min(b)),
            (Some(a), Some(b)) => MetricValue::Amount(a.max(b)),
            (Some(a), None) | (None, Some(a)) => MetricValue::Amount(a),
            (None, None) => MetricValue::Null,
        },
        AggFunc::First => current.clone(),
    };
    Ok(merged)
}
