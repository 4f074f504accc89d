//! 防护缓存
//!
//! 在汇总表读取前加一层保护：
//! - 穿透：布隆过滤器拦截从未登记的键，空结果以短 TTL 缓存
//! - 击穿：每个键一把互斥锁，同一时刻只有一个加载者；
//!   加载期间持有过期值的调用方直接拿到旧值
//! - 雪崩：TTL 加随机抖动
//!
//! 失效会推进键的纪元号，失效前开始的加载结果不会写回缓存。

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::bloom::BloomFilter;
use crate::observability::metrics;
use crate::rollup::{slice_key, RollupBatch};
use crate::sync::SyncListener;

// ═══════════════════════════════════════════════════════════════════════════
// 配置
// ═══════════════════════════════════════════════════════════════════════════

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 正常值 TTL（毫秒）
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// 空值 TTL（毫秒）
    #[serde(default = "default_null_ttl_ms")]
    pub null_ttl_ms: u64,

    /// 等待其他加载者的最长时间（毫秒）
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    /// TTL 抖动比例，0.1 表示 ±10%
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    #[serde(default = "default_true")]
    pub bloom_enabled: bool,

    /// 布隆过滤器设计容量
    #[serde(default = "default_bloom_capacity")]
    pub bloom_capacity: usize,

    #[serde(default = "default_bloom_fpp")]
    pub bloom_fpp: f64,
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_null_ttl_ms() -> u64 {
    2_000
}

fn default_lock_wait_ms() -> u64 {
    200
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_bloom_capacity() -> usize {
    100_000
}

fn default_bloom_fpp() -> f64 {
    0.01
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            null_ttl_ms: default_null_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            jitter_ratio: default_jitter_ratio(),
            bloom_enabled: true,
            bloom_capacity: default_bloom_capacity(),
            bloom_fpp: default_bloom_fpp(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn null_ttl(&self) -> Duration {
        Duration::from_millis(self.null_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 统计
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    null_hits: AtomicU64,
    bloom_rejects: AtomicU64,
    loads: AtomicU64,
    stale_served: AtomicU64,
    lock_timeouts: AtomicU64,
}

/// 缓存统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub null_hits: u64,
    pub bloom_rejects: u64,
    pub loads: u64,
    pub stale_served: u64,
    pub lock_timeouts: u64,
    pub entries: usize,
    pub bloom_keys: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.null_hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits + self.null_hits) as f64 / total as f64
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// 缓存
// ═══════════════════════════════════════════════════════════════════════════

struct CacheEntry<V> {
    /// None 为空值缓存
    value: Option<V>,
    expires_at: Instant,
}

/// 防护缓存
pub struct ProtectedCache<V> {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry<V>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    bloom: RwLock<BloomFilter>,
    /// 键级失效纪元
    epochs: DashMap<String, u64>,
    /// 全局纪元 (clear 时推进)
    generation: AtomicU64,
    stats: CacheStats,
}

enum Lookup<V> {
    Fresh(Option<V>),
    Expired(Option<V>),
    Absent,
}

impl<V: Clone + Send + Sync> ProtectedCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let bloom = BloomFilter::new(config.bloom_capacity, config.bloom_fpp);
        Self {
            config,
            entries: DashMap::new(),
            locks: DashMap::new(),
            bloom: RwLock::new(bloom),
            epochs: DashMap::new(),
            generation: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 读取缓存，未命中时调用 `loader`
    ///
    /// `loader` 返回 `Ok(None)` 表示数据不存在，以 `null_ttl` 缓存。
    pub fn get_or_compute<E, F>(&self, key: &str, loader: F, ttl: Duration) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        if self.config.bloom_enabled && !self.bloom.read().contains(key) {
            self.stats.bloom_rejects.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REQUESTS.with_label_values(&["bloom_reject"]).inc();
            return Ok(None);
        }

        let stale = match self.lookup(key) {
            Lookup::Fresh(value) => return Ok(self.record_hit(value)),
            Lookup::Expired(value) => value,
            Lookup::Absent => None,
        };
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::CACHE_REQUESTS.with_label_values(&["miss"]).inc();

        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = self.compute_locked(key, &lock, stale, loader, ttl);
        drop(lock);
        self.release_lock(key);
        result
    }

    fn compute_locked<E, F>(
        &self,
        key: &str,
        lock: &Mutex<()>,
        stale: Option<V>,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        // 无人加载：成为加载者；上一个加载者可能刚写回并释放锁
        if let Some(_guard) = lock.try_lock() {
            if let Lookup::Fresh(value) = self.lookup(key) {
                return Ok(self.record_hit(value));
            }
            return self.load(key, loader, ttl);
        }

        // 有人正在加载：持有旧值的调用方不等待
        if let Some(value) = stale {
            self.stats.stale_served.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REQUESTS.with_label_values(&["stale"]).inc();
            return Ok(Some(value));
        }

        let waited = match lock.try_lock_for(self.config.lock_wait()) {
            Some(_guard) => {
                // 等待期间其他加载者可能已写回
                if let Lookup::Fresh(value) = self.lookup(key) {
                    return Ok(self.record_hit(value));
                }
                self.load(key, loader, ttl)
            }
            None => {
                self.stats.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_REQUESTS.with_label_values(&["lock_timeout"]).inc();
                log::warn!(
                    "Cache lock wait for {} exceeded {:?}, bypassing cache",
                    key,
                    self.config.lock_wait()
                );
                self.stats.loads.fetch_add(1, Ordering::Relaxed);
                loader()
            }
        };
        waited
    }

    /// 没有其他调用方持有时移除键锁
    fn release_lock(&self, key: &str) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// 调用方持有键锁
    fn load<E, F>(&self, key: &str, loader: F, ttl: Duration) -> Result<Option<V>, E>
    where
        F: FnOnce() -> Result<Option<V>, E>,
    {
        let epoch = self.epoch_of(key);
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let value = loader()?;

        let ttl = match value {
            Some(_) => self.jittered(ttl),
            None => self.config.null_ttl(),
        };
        // 持有条目分片锁比较纪元：失效要么已推进纪元 (不写回)，
        // 要么在写回之后才删除条目
        let entry = self.entries.entry(key.to_string());
        if self.epoch_of(key) == epoch {
            entry.insert(CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            });
        } else {
            drop(entry);
            log::debug!("Cache key {} invalidated during load, result not stored", key);
        }
        Ok(value)
    }

    fn lookup(&self, key: &str) -> Lookup<V> {
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Lookup::Fresh(entry.value.clone()),
            Some(entry) => Lookup::Expired(entry.value.clone()),
            None => Lookup::Absent,
        }
    }

    fn record_hit(&self, value: Option<V>) -> Option<V> {
        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REQUESTS.with_label_values(&["hit"]).inc();
        } else {
            self.stats.null_hits.fetch_add(1, Ordering::Relaxed);
            metrics::CACHE_REQUESTS.with_label_values(&["null_hit"]).inc();
        }
        value
    }

    fn epoch_of(&self, key: &str) -> (u64, u64) {
        (
            self.generation.load(Ordering::SeqCst),
            self.epochs.get(key).map(|e| *e).unwrap_or(0),
        )
    }

    /// ttl × (1 ± ratio)
    fn jittered(&self, ttl: Duration) -> Duration {
        let ratio = self.config.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return ttl;
        }
        let factor = rand::thread_rng().gen_range(1.0 - ratio..=1.0 + ratio);
        ttl.mul_f64(factor)
    }

    // ───────────────────────────────────────────────────────────────────────
    // 失效与登记
    // ───────────────────────────────────────────────────────────────────────

    /// 登记存在的键
    pub fn register_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.config.bloom_enabled {
            return;
        }
        let mut bloom = self.bloom.write();
        for key in keys {
            bloom.insert(key.as_ref());
        }
        if bloom.is_saturated() {
            log::warn!(
                "Cache bloom filter over capacity ({} keys), estimated fpp {:.4}",
                bloom.inserted(),
                bloom.estimated_fpp()
            );
        }
    }

    /// 用当前全部键重建过滤器
    pub fn reset_bloom<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bloom = BloomFilter::new(self.config.bloom_capacity, self.config.bloom_fpp);
        for key in keys {
            bloom.insert(key.as_ref());
        }
        *self.bloom.write() = bloom;
    }

    pub fn invalidate(&self, key: &str) {
        *self.epochs.entry(key.to_string()).or_insert(0) += 1;
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        log::info!("Cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            null_hits: self.stats.null_hits.load(Ordering::Relaxed),
            bloom_rejects: self.stats.bloom_rejects.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            stale_served: self.stats.stale_served.load(Ordering::Relaxed),
            lock_timeouts: self.stats.lock_timeouts.load(Ordering::Relaxed),
            entries: self.entries.len(),
            bloom_keys: self.bloom.read().inserted(),
        }
    }
}

/// 汇总表提交后失效对应切片
impl<V: Clone + Send + Sync> SyncListener for ProtectedCache<V> {
    fn before_commit(&self, batch: &RollupBatch) {
        self.register_keys(
            batch
                .slice_ids()
                .iter()
                .map(|(schema, scope)| slice_key(schema, scope)),
        );
    }

    fn on_committed(&self, key: &str, slices: &[(String, String)]) {
        for (schema, scope) in slices {
            self.invalidate(&slice_key(schema, scope));
        }
        log::debug!("Invalidated {} cache slices for key {}", slices.len(), key);
    }
}
