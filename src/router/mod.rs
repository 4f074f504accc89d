// 查询路由
//
// 两个引擎，一个开关：
//
//   MetricRequest
//        │
//        ▼
//   ┌──────────────┐  record_count >= switch_threshold
//   │ QueryRouter  │  且分区引擎健康 → PARTITION，否则 ROLLUP
//   └──────┬───────┘
//          │  PARTITION 出错时本次降级到 ROLLUP
//   ┌──────┴───────┐
//   ▼              ▼
//   RollupEngine   PartitionEngine
//   (汇总切片+缓存)  (日期分区扫描)

pub mod engine;
pub mod request;
pub mod state;

pub use engine::{EngineError, PartitionEngine, PlanMap, QueryEngine, RollupEngine, SliceCache};
pub use request::{AggregateResult, EmptyReason, MetricRequest, QueryFilter};
pub use state::{QueryRouter, RoutedResult, RouterConfig, RouterSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 查询引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Engine {
    Rollup,
    Partition,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Rollup => "ROLLUP",
            Engine::Partition => "PARTITION",
        }
    }

    /// 指标取值
    pub fn gauge_value(&self) -> i64 {
        match self {
            Engine::Rollup => 0,
            Engine::Partition => 1,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ROLLUP" => Ok(Engine::Rollup),
            "PARTITION" => Ok(Engine::Partition),
            other => Err(format!("Unknown engine: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_parse() {
        assert_eq!("rollup".parse::<Engine>(), Ok(Engine::Rollup));
        assert_eq!("PARTITION".parse::<Engine>(), Ok(Engine::Partition));
        assert!("olap".parse::<Engine>().is_err());
        assert_eq!(Engine::Partition.to_string(), "PARTITION");
        assert_eq!(serde_json::to_string(&Engine::Rollup).unwrap(), "\"ROLLUP\"");
    }
}
