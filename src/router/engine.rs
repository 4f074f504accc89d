// 查询引擎
//
// - RollupEngine: 读取物化汇总切片 (经防护缓存)，按请求维度上卷
// - PartitionEngine: 扫描日期分区，在事实记录上执行两阶段聚合
//
// 两个引擎共用同一套请求校验，同一请求在两边的合法性一致。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{AggregateResult, Engine, MetricRequest};
use crate::cache::ProtectedCache;
use crate::partition::{PartitionError, PartitionStore};
use crate::rollup::{
    slice_key, AggregationError, Dimension, RebuildPlan, RollupRow, RollupStore, GLOBAL_SCOPE,
};

/// schema 名称 -> 重建计划
pub type PlanMap = HashMap<String, Arc<RebuildPlan>>;

/// 汇总切片缓存
pub type SliceCache = ProtectedCache<Arc<Vec<RollupRow>>>;

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Partition engine error: {0}")]
    Partition(PartitionError),

    #[error("Aggregation error: {0}")]
    Aggregation(AggregationError),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// 请求本身有误，换引擎也无济于事
    pub fn is_request_error(&self) -> bool {
        matches!(self, EngineError::UnknownSchema(_) | EngineError::InvalidRequest(_))
    }
}

impl From<PartitionError> for EngineError {
    fn from(e: PartitionError) -> Self {
        match e {
            PartitionError::Cancelled => EngineError::Cancelled,
            PartitionError::Aggregation(inner) => EngineError::from(inner),
            other => EngineError::Partition(other),
        }
    }
}

impl From<AggregationError> for EngineError {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::NotMergeable { .. } | AggregationError::UnsupportedDimension(_) => {
                EngineError::InvalidRequest(e.to_string())
            }
            other => EngineError::Aggregation(other),
        }
    }
}

/// 查询引擎接口
pub trait QueryEngine: Send + Sync {
    fn engine(&self) -> Engine;

    fn execute(
        &self,
        request: &MetricRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<AggregateResult, EngineError>;

    fn is_healthy(&self) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════════
// 请求校验
// ═══════════════════════════════════════════════════════════════════════════

fn lookup_plan<'a>(plans: &'a PlanMap, request: &MetricRequest) -> Result<&'a Arc<RebuildPlan>, EngineError> {
    plans
        .get(&request.schema)
        .ok_or_else(|| EngineError::UnknownSchema(request.schema.clone()))
}

/// 请求维度、过滤条件、输出列都必须能由汇总表回答
pub fn validate_request(plan: &RebuildPlan, request: &MetricRequest) -> Result<(), EngineError> {
    let group_by = plan.group_by();

    for (i, dimension) in request.dimensions.iter().enumerate() {
        if !group_by.contains(dimension) {
            return Err(EngineError::InvalidRequest(format!(
                "dimension {} is not grouped by schema {}",
                dimension.name(),
                plan.name()
            )));
        }
        if request.dimensions[..i].contains(dimension) {
            return Err(EngineError::InvalidRequest(format!(
                "dimension {} requested twice",
                dimension.name()
            )));
        }
    }

    let filter = &request.filter;
    let filtered = [
        (filter.stores.is_some(), Dimension::StoreId),
        (filter.date_range.is_some(), Dimension::Date),
        (filter.channels.is_some(), Dimension::Channel),
    ];
    for (present, dimension) in filtered {
        if present && !group_by.contains(&dimension) {
            return Err(EngineError::InvalidRequest(format!(
                "schema {} cannot filter on {}",
                plan.name(),
                dimension.name()
            )));
        }
    }

    if let Some((start, end)) = filter.date_range {
        if start > end {
            return Err(EngineError::InvalidRequest(format!(
                "empty date range {} .. {}",
                start, end
            )));
        }
    }

    if let Some(unknown) = request.fields.iter().find(|f| !plan.has_output(f)) {
        return Err(EngineError::InvalidRequest(format!(
            "schema {} has no field {}",
            plan.name(),
            unknown
        )));
    }

    // 上卷到更粗粒度时，两个引擎都只能回答可合并字段
    if request.dimensions.len() < group_by.len() {
        let required = plan.required_fields(&request.fields);
        if let Some(field) = plan
            .fields()
            .iter()
            .find(|f| !f.agg.is_mergeable() && required.contains(&f.name))
        {
            return Err(EngineError::InvalidRequest(format!(
                "field {} ({:?}) cannot be rolled up from schema {}",
                field.name,
                field.agg,
                plan.name()
            )));
        }
    }
    Ok(())
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<(), EngineError> {
    if cancel.map_or(false, |c| c.load(Ordering::Relaxed)) {
        return Err(EngineError::Cancelled);
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// 汇总引擎
// ═══════════════════════════════════════════════════════════════════════════

/// 汇总表引擎
pub struct RollupEngine {
    store: Arc<RollupStore>,
    plans: Arc<PlanMap>,
    cache: Arc<SliceCache>,
}

impl RollupEngine {
    pub fn new(store: Arc<RollupStore>, plans: Arc<PlanMap>, cache: Arc<SliceCache>) -> Self {
        Self { store, plans, cache }
    }

    /// 读取一个切片 (经缓存)
    fn slice(&self, schema: &str, scope: &str) -> Result<Option<Arc<Vec<RollupRow>>>, EngineError> {
        let store = &self.store;
        self.cache.get_or_compute(
            &slice_key(schema, scope),
            || Ok(store.get(schema, scope)),
            self.cache.config().ttl(),
        )
    }

    fn scopes(&self, plan: &RebuildPlan, request: &MetricRequest) -> Vec<String> {
        if !plan.is_store_scoped() {
            return vec![GLOBAL_SCOPE.to_string()];
        }
        match &request.filter.stores {
            Some(stores) => stores.iter().cloned().collect(),
            None => self.store.scopes(plan.name()),
        }
    }
}

/// 按过滤条件筛选汇总行
struct RowFilter<'a> {
    request: &'a MetricRequest,
    store_pos: Option<usize>,
    date_pos: Option<usize>,
    channel_pos: Option<usize>,
    date_range: Option<(String, String)>,
}

impl<'a> RowFilter<'a> {
    fn new(plan: &RebuildPlan, request: &'a MetricRequest) -> Self {
        let position = |d: Dimension| plan.group_by().iter().position(|g| *g == d);
        Self {
            request,
            store_pos: position(Dimension::StoreId),
            date_pos: position(Dimension::Date),
            channel_pos: position(Dimension::Channel),
            date_range: request.filter.date_range.map(|(start, end)| {
                (start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string())
            }),
        }
    }

    fn matches(&self, row: &RollupRow) -> bool {
        let filter = &self.request.filter;
        if let (Some(pos), Some(_)) = (self.store_pos, &filter.stores) {
            if !row.key.get(pos).map_or(false, |s| filter.matches_store(s)) {
                return false;
            }
        }
        if let (Some(pos), Some(_)) = (self.channel_pos, &filter.channels) {
            if !row.key.get(pos).map_or(false, |c| filter.matches_channel(c)) {
                return false;
            }
        }
        if let (Some(pos), Some((start, end))) = (self.date_pos, &self.date_range) {
            // YYYY-MM-DD 字典序即日期序
            match row.key.get(pos) {
                Some(date) if date >= start.as_str() && date <= end.as_str() => {}
                _ => return false,
            }
        }
        true
    }
}

impl QueryEngine for RollupEngine {
    fn engine(&self) -> Engine {
        Engine::Rollup
    }

    fn execute(
        &self,
        request: &MetricRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<AggregateResult, EngineError> {
        let plan = lookup_plan(&self.plans, request)?;
        validate_request(plan, request)?;

        let filter = RowFilter::new(plan, request);
        let mut slices = Vec::new();
        for scope in self.scopes(plan, request) {
            check_cancel(cancel)?;
            if let Some(rows) = self.slice(plan.name(), &scope)? {
                slices.push(rows);
            }
        }

        let matched = slices.iter().flat_map(|s| s.iter()).filter(|row| filter.matches(row));
        let mut rows = plan.regroup(matched, &request.dimensions, &request.fields)?;
        for row in &mut rows {
            plan.project(&mut row.values, &request.fields);
        }

        log::debug!(
            "Request {}: rollup {} over {} slices -> {} rows",
            request.request_id,
            plan.name(),
            slices.len(),
            rows.len()
        );
        Ok(AggregateResult::new(rows, Engine::Rollup))
    }

    fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 分区引擎
// ═══════════════════════════════════════════════════════════════════════════

/// 分区扫描引擎
pub struct PartitionEngine {
    store: Arc<PartitionStore>,
    plans: Arc<PlanMap>,
}

impl PartitionEngine {
    pub fn new(store: Arc<PartitionStore>, plans: Arc<PlanMap>) -> Self {
        Self { store, plans }
    }
}

impl QueryEngine for PartitionEngine {
    fn engine(&self) -> Engine {
        Engine::Partition
    }

    fn execute(
        &self,
        request: &MetricRequest,
        cancel: Option<&AtomicBool>,
    ) -> Result<AggregateResult, EngineError> {
        let plan = lookup_plan(&self.plans, request)?;
        validate_request(plan, request)?;
        if !self.store.is_healthy() {
            return Err(EngineError::Unavailable("partition store unhealthy".to_string()));
        }
        Ok(self.store.query(request, plan, cancel)?)
    }

    fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::fact::{Amount, FactCatalog};
    use crate::rollup::{compile, FieldSpec, FormulaRegistry, GroupKey, MetricValue, RollupBatch, RollupSchema};
    use crate::rollup::{AggFunc, DerivedField, SourceExpr};
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn plan() -> Arc<RebuildPlan> {
        let schema = RollupSchema::new(
            "store_daily",
            vec![Dimension::StoreId, Dimension::Date, Dimension::Channel],
        )
        .with_field(FieldSpec::sum("revenue", "revenue"))
        .with_field(FieldSpec::sum("cost", "cost"))
        .with_derived(DerivedField::new("margin", "difference", ["revenue", "cost"]));
        Arc::new(
            compile(
                &schema,
                &FactCatalog::new(["revenue", "cost"], Vec::<String>::new()),
                Arc::new(FormulaRegistry::with_builtins()),
            )
            .unwrap(),
        )
    }

    fn row(store: &str, date: &str, channel: &str, revenue: i64, cost: i64) -> RollupRow {
        let mut values = BTreeMap::new();
        values.insert("revenue".to_string(), MetricValue::Amount(Amount::from_units(revenue)));
        values.insert("cost".to_string(), MetricValue::Amount(Amount::from_units(cost)));
        values.insert("margin".to_string(), MetricValue::Amount(Amount::from_units(revenue - cost)));
        RollupRow {
            schema: "store_daily".to_string(),
            key: GroupKey::new([store, date, channel]),
            values,
        }
    }

    fn engine() -> (RollupEngine, Arc<SliceCache>) {
        let plan = plan();
        let store = Arc::new(RollupStore::new());
        let cache = Arc::new(SliceCache::new(CacheConfig::default()));

        let mut batch = RollupBatch::new();
        batch.replace(
            "store_daily",
            "S1",
            vec![row("S1", "2025-01-01", "meituan", 30, 10), row("S1", "2025-01-02", "eleme", 20, 5)],
        );
        batch.replace("store_daily", "S2", vec![row("S2", "2025-01-01", "meituan", 7, 2)]);
        cache.register_keys(batch.slice_ids().iter().map(|(s, k)| slice_key(s, k)));
        store.commit(batch);

        let plans: PlanMap = [(plan.name().to_string(), plan)].into_iter().collect();
        (RollupEngine::new(store, Arc::new(plans), cache.clone()), cache)
    }

    fn amount(result: &AggregateResult, index: usize, field: &str) -> Option<Amount> {
        result.rows[index].get(field).and_then(MetricValue::as_amount)
    }

    #[test]
    fn test_rollup_regroup_with_filters() {
        let (engine, cache) = engine();

        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]);
        let result = engine.execute(&request, None).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(amount(&result, 0, "revenue"), Some(Amount::from_units(50)));
        assert_eq!(amount(&result, 0, "margin"), Some(Amount::from_units(35)));

        let request = MetricRequest::new("store_daily", vec![Dimension::Channel])
            .with_date_range(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            )
            .with_fields(["margin"]);
        let result = engine.execute(&request, None).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].key, GroupKey::new(["meituan"]));
        assert_eq!(result.rows[0].values.len(), 1);
        assert_eq!(amount(&result, 0, "margin"), Some(Amount::from_units(25)));

        assert!(cache.stats().hits >= 2);
    }

    #[test]
    fn test_unknown_store_is_empty() {
        let (engine, cache) = engine();
        let request = MetricRequest::new("store_daily", vec![Dimension::StoreId]).with_stores(["S9"]);
        let result = engine.execute(&request, None).unwrap();
        assert!(result.is_empty());
        assert_eq!(cache.stats().bloom_rejects, 1);
    }

    #[test]
    fn test_invalid_requests() {
        let (engine, _) = engine();

        let err = engine
            .execute(&MetricRequest::new("missing", vec![]), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSchema(_)));

        let err = engine
            .execute(&MetricRequest::new("store_daily", vec![Dimension::Hour]), None)
            .unwrap_err();
        assert!(err.is_request_error());

        let err = engine
            .execute(
                &MetricRequest::new("store_daily", vec![]).with_fields(["profit"]),
                None,
            )
            .unwrap_err();
        assert!(err.is_request_error());
    }

    #[test]
    fn test_distinct_count_only_at_full_grain() {
        let schema = RollupSchema::new("orders", vec![Dimension::StoreId, Dimension::Date])
            .with_field(FieldSpec::sum("revenue", "revenue"))
            .with_field(FieldSpec::new("orders", SourceExpr::OrderId, AggFunc::CountDistinct));
        let plan = compile(
            &schema,
            &FactCatalog::new(["revenue"], Vec::<String>::new()),
            Arc::new(FormulaRegistry::with_builtins()),
        )
        .unwrap();

        let full = MetricRequest::new("orders", vec![Dimension::Date, Dimension::StoreId]);
        assert!(validate_request(&plan, &full).is_ok());

        let coarse = MetricRequest::new("orders", vec![Dimension::StoreId]);
        assert!(validate_request(&plan, &coarse).unwrap_err().is_request_error());

        let projected = coarse.with_fields(["revenue"]);
        assert!(validate_request(&plan, &projected).is_ok());
    }

    #[test]
    fn test_cancelled() {
        let (engine, _) = engine();
        let cancel = AtomicBool::new(true);
        let err = engine
            .execute(&MetricRequest::new("store_daily", vec![]), Some(&cancel))
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
