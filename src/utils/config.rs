//! 配置管理模块
//!
//! 所有配置集中在 `config/report.toml`，包括汇总表 Schema 声明。
//! 每个字段都有 serde 默认值，缺省的段落按默认配置运行。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::fact::FactCatalog;
use crate::partition::{MigratorConfig, PartitionStoreConfig};
use crate::rollup::RollupSchema;
use crate::router::RouterConfig;
use crate::sync::SyncWorkerConfig;

/// 配置错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 服务总配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub partition: PartitionStoreConfig,
    #[serde(default)]
    pub migrator: MigratorConfig,
    /// 事实表字段目录
    #[serde(default)]
    pub catalog: FactCatalog,
    /// 汇总表定义
    #[serde(default)]
    pub schemas: Vec<RollupSchema>,
}

impl ReportConfig {
    /// 从文件加载配置
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 加载默认配置文件
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load_from_file("config/report.toml")
    }

    /// 加载配置文件，失败时回退到默认配置
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load_from_file(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.as_ref().display(),
                    e
                );
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.worker_count == 0 {
            return Err(ConfigError::Invalid("sync.worker_count must be > 0".to_string()));
        }
        if self.sync.queue_capacity == 0 {
            return Err(ConfigError::Invalid("sync.queue_capacity must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.cache.jitter_ratio) {
            return Err(ConfigError::Invalid("cache.jitter_ratio must be in [0, 1)".to_string()));
        }
        if let Some(summary) = &self.partition.summary_schema {
            if !self.schemas.iter().any(|s| &s.name == summary) {
                return Err(ConfigError::Invalid(format!(
                    "partition.summary_schema {} is not declared",
                    summary
                )));
            }
        }
        Ok(())
    }
}

/// HTTP 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            enabled: true,
        }
    }
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl SyncConfig {
    pub fn worker_config(&self) -> SyncWorkerConfig {
        SyncWorkerConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            max_retries: self.max_retries,
            retry_base: Duration::from_millis(self.retry_base_ms),
            retry_max: Duration::from_millis(self.retry_max_ms),
            ..SyncWorkerConfig::default()
        }
    }
}

// 默认值函数
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8090
}
fn default_true() -> bool {
    true
}
fn default_worker_count() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_max_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::{AggFunc, Dimension, SourceExpr};

    const SAMPLE: &str = r#"
[http]
port = 9000

[router]
switch_threshold = 5000

[cache]
ttl_ms = 1000

[sync]
worker_count = 4
retry_base_ms = 50

[partition]
root = "/tmp/qareport/partitions"
summary_schema = "store_daily"

[catalog]
item_fields = ["revenue", "cost"]
order_fields = ["delivery_fee"]

[[schemas]]
name = "store_daily"
group_by = ["STORE_ID", "DATE"]

[[schemas.fields]]
name = "revenue"
source = { field = "revenue" }
agg = "SUM"

[[schemas.fields]]
name = "delivery_fee"
source = { field = "delivery_fee" }
agg = "SUM"
is_order_level = true

[[schemas.fields]]
name = "orders"
source = "order_id"
agg = "COUNT_DISTINCT"

[[schemas.derived_fields]]
name = "avg_ticket"
formula = "safe_ratio"
inputs = ["revenue", "orders"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = ReportConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.http.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.router.switch_threshold, 5000);
        assert_eq!(config.cache.ttl_ms, 1000);
        assert_eq!(config.cache.lock_wait_ms, 200);
        assert_eq!(config.sync.worker_config().retry_base, Duration::from_millis(50));
        assert_eq!(config.sync.max_retries, 5);
        assert!(!config.migrator.include_open);

        let schema = &config.schemas[0];
        assert_eq!(schema.group_by, vec![Dimension::StoreId, Dimension::Date]);
        assert_eq!(schema.fields[1].source, SourceExpr::Field("delivery_fee".into()));
        assert!(schema.fields[1].is_order_level);
        assert_eq!(schema.fields[2].source, SourceExpr::OrderId);
        assert_eq!(schema.fields[2].agg, AggFunc::CountDistinct);
        assert_eq!(schema.derived_fields[0].inputs, vec!["revenue", "orders"]);
    }

    #[test]
    fn test_defaults() {
        let config = ReportConfig::from_toml("").unwrap();
        assert_eq!(config.http.port, 8090);
        assert_eq!(config.router.switch_threshold, 1_000_000);
        assert!(config.schemas.is_empty());
    }

    #[test]
    fn test_invalid_summary_schema() {
        let err = ReportConfig::from_toml("[partition]\nsummary_schema = \"nope\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = ReportConfig::load_or_default("/nonexistent/report.toml");
        assert_eq!(config.sync.worker_count, 2);
    }
}
