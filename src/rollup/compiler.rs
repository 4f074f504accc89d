//! Schema 编译器
//!
//! 校验声明式汇总表定义，生成纯函数式的重建计划 `RebuildPlan`。
//! 派生字段按依赖关系拓扑排序 (Kahn 算法)，循环依赖在编译期拒绝。

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::aggregate::{self, AggregationError};
use super::formula::{FormulaError, FormulaRegistry};
use super::row::{AggregateRow, GroupKey, MetricValue, RollupRow};
use super::schema::{AggFunc, DerivedField, Dimension, FieldSpec, RollupSchema, SourceExpr};
use crate::fact::{FactCatalog, FactRecord, FieldLevel};

// ═══════════════════════════════════════════════════════════════════════════
// 编译错误
// ═══════════════════════════════════════════════════════════════════════════

/// Schema 定义错误 (启动时致命)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema {schema}: group_by must not be empty")]
    EmptyGroupBy { schema: String },

    #[error("Schema {schema}: dimension {dimension:?} listed twice")]
    DuplicateDimension { schema: String, dimension: Dimension },

    #[error("Schema {schema}: duplicate field name {name}")]
    DuplicateName { schema: String, name: String },

    #[error("Schema {0} registered twice")]
    DuplicateSchema(String),

    #[error("Schema {schema}: field {field} references unknown fact field {source_field}")]
    UnknownSource {
        schema: String,
        field: String,
        source_field: String,
    },

    #[error("Schema {schema}: field {field} {reason}")]
    OrderLevelMismatch {
        schema: String,
        field: String,
        reason: String,
    },

    #[error("Schema {schema}: field {field} cannot apply {agg:?} to a textual source")]
    TypeMismatch {
        schema: String,
        field: String,
        agg: AggFunc,
    },

    #[error("Schema {schema}: derived field {field} uses unknown formula {formula}")]
    UnknownFormula {
        schema: String,
        field: String,
        formula: String,
    },

    #[error("Schema {schema}: derived field {field} expects {expected} inputs, got {got}")]
    ArityMismatch {
        schema: String,
        field: String,
        expected: usize,
        got: usize,
    },

    #[error("Schema {schema}: derived field {field} references undefined name {reference}")]
    UndefinedReference {
        schema: String,
        field: String,
        reference: String,
    },

    #[error("Schema {schema}: cyclic dependency among derived fields {cycle:?}")]
    CyclicDependency { schema: String, cycle: Vec<String> },
}

// ═══════════════════════════════════════════════════════════════════════════
// 编译
// ═══════════════════════════════════════════════════════════════════════════

/// 编译汇总表定义
pub fn compile(
    schema: &RollupSchema,
    catalog: &FactCatalog,
    formulas: Arc<FormulaRegistry>,
) -> Result<RebuildPlan, SchemaError> {
    let name = schema.name.clone();

    if schema.group_by.is_empty() {
        return Err(SchemaError::EmptyGroupBy { schema: name });
    }
    let mut seen_dims = HashSet::new();
    for dimension in &schema.group_by {
        if !seen_dims.insert(*dimension) {
            return Err(SchemaError::DuplicateDimension {
                schema: name,
                dimension: *dimension,
            });
        }
    }

    let mut names = HashSet::new();
    for field in &schema.fields {
        if !names.insert(field.name.as_str()) {
            return Err(SchemaError::DuplicateName {
                schema: name,
                name: field.name.clone(),
            });
        }
        check_field(&name, field, catalog)?;
    }

    for derived in &schema.derived_fields {
        if !names.insert(derived.name.as_str()) {
            return Err(SchemaError::DuplicateName {
                schema: name,
                name: derived.name.clone(),
            });
        }
        let formula = formulas
            .get(&derived.formula)
            .ok_or_else(|| SchemaError::UnknownFormula {
                schema: name.clone(),
                field: derived.name.clone(),
                formula: derived.formula.clone(),
            })?;
        if let Some(expected) = formula.arity {
            if expected != derived.inputs.len() {
                return Err(SchemaError::ArityMismatch {
                    schema: name,
                    field: derived.name.clone(),
                    expected,
                    got: derived.inputs.len(),
                });
            }
        }
    }

    for derived in &schema.derived_fields {
        for input in &derived.inputs {
            if !names.contains(input.as_str()) {
                return Err(SchemaError::UndefinedReference {
                    schema: name,
                    field: derived.name.clone(),
                    reference: input.clone(),
                });
            }
        }
    }

    let derived = topological_order(&name, &schema.derived_fields)?;

    log::debug!(
        "Compiled rollup schema {} v{}: {} fields, {} derived",
        schema.name,
        schema.version,
        schema.fields.len(),
        derived.len()
    );

    Ok(RebuildPlan {
        schema: Arc::new(schema.clone()),
        dimensions: schema.group_by.clone(),
        derived,
        formulas,
    })
}

fn check_field(schema: &str, field: &FieldSpec, catalog: &FactCatalog) -> Result<(), SchemaError> {
    let mismatch = |reason: &str| SchemaError::OrderLevelMismatch {
        schema: schema.to_string(),
        field: field.name.clone(),
        reason: reason.to_string(),
    };

    if field.source.is_textual() && !matches!(field.agg, AggFunc::Count | AggFunc::CountDistinct) {
        return Err(SchemaError::TypeMismatch {
            schema: schema.to_string(),
            field: field.name.clone(),
            agg: field.agg,
        });
    }

    match &field.source {
        SourceExpr::Field(source) => match (catalog.level_of(source), field.is_order_level) {
            (None, _) => Err(SchemaError::UnknownSource {
                schema: schema.to_string(),
                field: field.name.clone(),
                source_field: source.clone(),
            }),
            (Some(FieldLevel::Item), true) => {
                Err(mismatch("is order-level but references an item-level fact field"))
            }
            (Some(FieldLevel::Order), false) => Err(mismatch(
                "references an order-level fact field and must be declared order-level",
            )),
            _ => Ok(()),
        },
        SourceExpr::RecordId if field.is_order_level => {
            Err(mismatch("is order-level but counts line record ids"))
        }
        _ => Ok(()),
    }
}

/// 派生字段拓扑排序 (Kahn's Algorithm)
///
/// 只有派生字段之间存在依赖边；同层按声明顺序输出。
fn topological_order(
    schema: &str,
    derived: &[DerivedField],
) -> Result<Vec<DerivedField>, SchemaError> {
    let index: HashMap<&str, usize> = derived
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; derived.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); derived.len()];

    for (i, node) in derived.iter().enumerate() {
        let deps: BTreeSet<usize> = node
            .inputs
            .iter()
            .filter_map(|input| index.get(input.as_str()).copied())
            .collect();
        for dep in deps {
            in_degree[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..derived.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(derived.len());

    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    // 拓扑序未覆盖全部节点，说明存在环
    if order.len() != derived.len() {
        let placed: HashSet<usize> = order.into_iter().collect();
        let cycle = derived
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed.contains(i))
            .map(|(_, d)| d.name.clone())
            .collect();
        return Err(SchemaError::CyclicDependency {
            schema: schema.to_string(),
            cycle,
        });
    }

    Ok(order.into_iter().map(|i| derived[i].clone()).collect())
}

// ═══════════════════════════════════════════════════════════════════════════
// 重建计划
// ═══════════════════════════════════════════════════════════════════════════

/// 编译后的重建计划 (纯函数，无副作用)
#[derive(Debug, Clone)]
pub struct RebuildPlan {
    schema: Arc<RollupSchema>,
    /// 聚合维度，默认为 schema.group_by
    dimensions: Vec<Dimension>,
    /// 拓扑序
    derived: Vec<DerivedField>,
    formulas: Arc<FormulaRegistry>,
}

impl RebuildPlan {
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &RollupSchema {
        &self.schema
    }

    pub fn group_by(&self) -> &[Dimension] {
        &self.schema.group_by
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.schema.fields
    }

    /// 按求值顺序排列的派生字段
    pub fn derived_fields(&self) -> &[DerivedField] {
        &self.derived
    }

    pub fn is_store_scoped(&self) -> bool {
        self.schema.is_store_scoped()
    }

    /// 全部输出列名 (基础字段 + 派生字段)
    pub fn output_names(&self) -> Vec<String> {
        self.schema
            .fields
            .iter()
            .map(|f| f.name.clone())
            .chain(self.derived.iter().map(|d| d.name.clone()))
            .collect()
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.schema.fields.iter().any(|f| f.name == name)
            || self.derived.iter().any(|d| d.name == name)
    }

    /// 以不同维度复用同一计划 (分区引擎按请求维度聚合)
    pub fn with_dimensions(&self, dimensions: Vec<Dimension>) -> Self {
        Self {
            dimensions,
            ..self.clone()
        }
    }

    /// 在事实记录上执行两阶段聚合并计算派生字段
    pub fn aggregate<'a, I>(
        &self,
        facts: I,
        keys: Option<&BTreeSet<GroupKey>>,
    ) -> Result<Vec<AggregateRow>, AggregationError>
    where
        I: IntoIterator<Item = &'a FactRecord>,
    {
        let mut rows = aggregate::aggregate(&self.dimensions, &self.schema.fields, facts, keys)?;
        for row in &mut rows {
            self.finalize(&mut row.values)?;
        }
        Ok(rows)
    }

    /// 生成汇总表行
    pub fn execute(
        &self,
        facts: &[FactRecord],
        keys: Option<&BTreeSet<GroupKey>>,
    ) -> Result<Vec<RollupRow>, AggregationError> {
        Ok(self
            .aggregate(facts, keys)?
            .into_iter()
            .map(|row| RollupRow {
                schema: self.schema.name.clone(),
                key: row.key,
                values: row.values,
            })
            .collect())
    }

    /// 计算派生字段 (必须在阶段二完成后调用)
    pub fn finalize(&self, values: &mut BTreeMap<String, MetricValue>) -> Result<(), AggregationError> {
        for derived in &self.derived {
            let inputs: Vec<MetricValue> = derived
                .inputs
                .iter()
                .map(|name| values.get(name).cloned().unwrap_or(MetricValue::Null))
                .collect();

            let formula = self.formulas.get(&derived.formula).ok_or_else(|| {
                AggregationError::Formula {
                    field: derived.name.clone(),
                    formula: derived.formula.clone(),
                    source: FormulaError::Custom("formula not registered".into()),
                }
            })?;

            let value = formula
                .evaluate(&inputs)
                .map_err(|source| AggregationError::Formula {
                    field: derived.name.clone(),
                    formula: derived.formula.clone(),
                    source,
                })?;
            values.insert(derived.name.clone(), value);
        }
        Ok(())
    }

    /// 将汇总表行上卷到 `dimensions`，并重新计算派生字段
    pub fn regroup<'a, I>(
        &self,
        rows: I,
        dimensions: &[Dimension],
        projection: &[String],
    ) -> Result<Vec<AggregateRow>, AggregationError>
    where
        I: IntoIterator<Item = &'a RollupRow>,
    {
        let required = self.required_fields(projection);
        let mut merged = aggregate::regroup(
            &self.schema.fields,
            &self.schema.group_by,
            dimensions,
            rows.into_iter().map(|r| (&r.key, &r.values)),
            &required,
        )?;
        for row in &mut merged {
            self.finalize(&mut row.values)?;
        }
        Ok(merged)
    }

    /// 投影所需的基础字段 (含派生字段的传递依赖)；空投影表示全部
    pub fn required_fields(&self, projection: &[String]) -> BTreeSet<String> {
        if projection.is_empty() {
            return self.schema.fields.iter().map(|f| f.name.clone()).collect();
        }

        let derived: HashMap<&str, &DerivedField> =
            self.derived.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut required = BTreeSet::new();
        let mut stack: Vec<&str> = projection.iter().map(String::as_str).collect();
        let mut visited = HashSet::new();

        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            match derived.get(name) {
                Some(d) => stack.extend(d.inputs.iter().map(String::as_str)),
                None => {
                    required.insert(name.to_string());
                }
            }
        }
        required
    }

    /// 只保留投影列
    pub fn project(&self, values: &mut BTreeMap<String, MetricValue>, projection: &[String]) {
        if projection.is_empty() {
            return;
        }
        values.retain(|name, _| projection.iter().any(|p| p == name));
    }
}
