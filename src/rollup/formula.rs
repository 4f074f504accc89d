//! 派生字段公式表
//!
//! 业务公式 (利润、费率等) 由外部指标模块以纯函数注入，
//! 核心只负责依赖排序与参数个数校验，不理解业务语义。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::row::MetricValue;
use crate::fact::Amount;

/// 公式错误
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("division by zero")]
    DivisionByZero,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("expected {expected} inputs, got {got}")]
    Arity { expected: usize, got: usize },

    #[error("{0}")]
    Custom(String),
}

/// 公式函数签名
pub type FormulaFn = dyn Fn(&[MetricValue]) -> Result<MetricValue, FormulaError> + Send + Sync;

/// 已注册的公式
#[derive(Clone)]
pub struct Formula {
    /// 固定参数个数，None 表示可变参数
    pub arity: Option<usize>,
    func: Arc<FormulaFn>,
}

impl Formula {
    pub fn evaluate(&self, inputs: &[MetricValue]) -> Result<MetricValue, FormulaError> {
        if let Some(expected) = self.arity {
            if inputs.len() != expected {
                return Err(FormulaError::Arity {
                    expected,
                    got: inputs.len(),
                });
            }
        }
        (self.func)(inputs)
    }
}

/// 公式表 (按名称索引)
#[derive(Clone, Default)]
pub struct FormulaRegistry {
    formulas: HashMap<String, Formula>,
}

impl fmt::Debug for FormulaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.formulas.keys().collect();
        names.sort();
        f.debug_struct("FormulaRegistry").field("formulas", &names).finish()
    }
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带内置算术公式的公式表
    ///
    /// - `ratio(a, b)`: a / b，分母为 0 时报错
    /// - `safe_ratio(a, b)`: a / b，分母为 0 时返回 Null
    /// - `percent(a, b)`: a / b * 100，分母为 0 时返回 Null
    /// - `sum(..)`: 求和 (同为金额时保持定点精度)
    /// - `difference(a, b)`: a - b
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ratio", Some(2), |inputs| divide(&inputs[0], &inputs[1], false));
        registry.register("safe_ratio", Some(2), |inputs| divide(&inputs[0], &inputs[1], true));
        registry.register("percent", Some(2), |inputs| {
            match divide(&inputs[0], &inputs[1], true)? {
                MetricValue::Ratio(r) => Ok(MetricValue::Ratio(r * 100.0)),
                other => Ok(other),
            }
        });
        registry.register("sum", None, sum_values);
        registry.register("difference", Some(2), |inputs| {
            match (&inputs[0], &inputs[1]) {
                (MetricValue::Null, _) | (_, MetricValue::Null) => Ok(MetricValue::Null),
                (MetricValue::Amount(a), MetricValue::Amount(b)) => a
                    .checked_sub(*b)
                    .map(MetricValue::Amount)
                    .ok_or(FormulaError::Overflow),
                (a, b) => Ok(MetricValue::Ratio(
                    a.as_f64().unwrap_or_default() - b.as_f64().unwrap_or_default(),
                )),
            }
        });
        registry
    }

    /// 注册公式，同名覆盖
    pub fn register<F>(&mut self, name: impl Into<String>, arity: Option<usize>, func: F)
    where
        F: Fn(&[MetricValue]) -> Result<MetricValue, FormulaError> + Send + Sync + 'static,
    {
        self.formulas.insert(
            name.into(),
            Formula {
                arity,
                func: Arc::new(func),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

fn divide(
    numerator: &MetricValue,
    denominator: &MetricValue,
    null_on_zero: bool,
) -> Result<MetricValue, FormulaError> {
    let (Some(n), Some(d)) = (numerator.as_f64(), denominator.as_f64()) else {
        return Ok(MetricValue::Null);
    };
    if d == 0.0 {
        return if null_on_zero {
            Ok(MetricValue::Null)
        } else {
            Err(FormulaError::DivisionByZero)
        };
    }
    Ok(MetricValue::Ratio(n / d))
}

fn sum_values(inputs: &[MetricValue]) -> Result<MetricValue, FormulaError> {
    if inputs.iter().any(MetricValue::is_null) {
        return Ok(MetricValue::Null);
    }
    if inputs.iter().all(|v| matches!(v, MetricValue::Amount(_))) {
        let mut total = Amount::ZERO;
        for value in inputs {
            if let MetricValue::Amount(a) = value {
                total = total.checked_add(*a).ok_or(FormulaError::Overflow)?;
            }
        }
        return Ok(MetricValue::Amount(total));
    }
    if inputs.iter().all(|v| matches!(v, MetricValue::Count(_))) {
        let mut total: u64 = 0;
        for value in inputs {
            if let MetricValue::Count(c) = value {
                total = total.checked_add(*c).ok_or(FormulaError::Overflow)?;
            }
        }
        return Ok(MetricValue::Count(total));
    }
    Ok(MetricValue::Ratio(
        inputs.iter().filter_map(MetricValue::as_f64).sum(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(units: i64) -> MetricValue {
        MetricValue::Amount(Amount::from_units(units))
    }

    #[test]
    fn test_ratio_and_safe_ratio() {
        let registry = FormulaRegistry::with_builtins();
        let ratio = registry.get("ratio").unwrap();
        assert_eq!(
            ratio.evaluate(&[amount(44), MetricValue::Count(4)]).unwrap(),
            MetricValue::Ratio(11.0)
        );
        assert_eq!(
            ratio.evaluate(&[amount(1), MetricValue::Count(0)]),
            Err(FormulaError::DivisionByZero)
        );

        let safe = registry.get("safe_ratio").unwrap();
        assert_eq!(
            safe.evaluate(&[amount(1), MetricValue::Count(0)]).unwrap(),
            MetricValue::Null
        );
    }

    #[test]
    fn test_arity_checked() {
        let registry = FormulaRegistry::with_builtins();
        let err = registry.get("ratio").unwrap().evaluate(&[amount(1)]).unwrap_err();
        assert_eq!(err, FormulaError::Arity { expected: 2, got: 1 });
    }

    #[test]
    fn test_sum_keeps_fixed_point() {
        let registry = FormulaRegistry::with_builtins();
        let sum = registry.get("sum").unwrap();
        assert_eq!(sum.evaluate(&[amount(1), amount(2), amount(3)]).unwrap(), amount(6));
        assert_eq!(
            registry
                .get("difference")
                .unwrap()
                .evaluate(&[amount(10), amount(4)])
                .unwrap(),
            amount(6)
        );
    }

    #[test]
    fn test_custom_formula() {
        let mut registry = FormulaRegistry::new();
        registry.register("double", Some(1), |inputs| {
            Ok(MetricValue::Ratio(inputs[0].as_f64().unwrap_or_default() * 2.0))
        });
        assert!(registry.contains("double"));
        assert_eq!(
            registry.get("double").unwrap().evaluate(&[MetricValue::Count(3)]).unwrap(),
            MetricValue::Ratio(6.0)
        );
    }
}
