// 同步工作线程
//
// 职责：
// 1. 接收变更通知，折叠已在队列中的 key
// 2. 从有界队列消费同步任务
// 3. 失败 key 按指数退避重试 (base → 2×base → ... 封顶 max)
// 4. 超过最大重试次数记录错误并计数

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{SyncError, Synchronizer};
use crate::observability::metrics;

/// Worker 配置
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// Worker 数量
    pub worker_count: usize,

    /// 队列容量
    pub queue_capacity: usize,

    /// 最大重试次数
    pub max_retries: u32,

    /// 首次重试延迟
    pub retry_base: Duration,

    /// 重试延迟上限
    pub retry_max: Duration,

    /// 队列轮询间隔
    pub poll_interval: Duration,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 1024,
            max_retries: 5,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SyncWorkerConfig {
    /// 第 `attempt` 次重试前的延迟 (attempt 从 1 开始)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

/// 同步任务
#[derive(Debug, Clone)]
struct SyncJob {
    keys: BTreeSet<String>,
    /// 已重试次数
    attempt: u32,
}

#[derive(Debug)]
struct RetryEntry {
    key: String,
    attempt: u32,
    due: Instant,
}

/// Worker 间共享状态
struct Shared {
    synchronizer: Arc<Synchronizer>,
    config: SyncWorkerConfig,
    /// 已入队但尚未开始处理的 key
    pending: Mutex<HashSet<String>>,
    retries: Mutex<Vec<RetryEntry>>,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl Shared {
    fn run_job(&self, job: SyncJob) {
        {
            let mut pending = self.pending.lock();
            for key in &job.keys {
                pending.remove(key);
            }
        }

        let report = self.synchronizer.sync(&job.keys);
        if report.failures.is_empty() {
            return;
        }

        let attempt = job.attempt + 1;
        let stats = self.synchronizer.stats_ref();
        let mut retries = self.retries.lock();
        for failure in report.failures {
            if attempt > self.config.max_retries {
                stats.exhausted.fetch_add(1, Ordering::Relaxed);
                metrics::SYNC_RETRY_TOTAL.with_label_values(&["exhausted"]).inc();
                log::error!(
                    "Giving up on key {} after {} retries: {}",
                    failure.key,
                    self.config.max_retries,
                    failure.cause
                );
                continue;
            }

            let delay = self.config.backoff(attempt);
            stats.retries.fetch_add(1, Ordering::Relaxed);
            metrics::SYNC_RETRY_TOTAL.with_label_values(&["scheduled"]).inc();
            log::warn!(
                "Retrying key {} in {:?} (attempt {}/{})",
                failure.key,
                delay,
                attempt,
                self.config.max_retries
            );
            retries.push(RetryEntry {
                key: failure.key,
                attempt,
                due: Instant::now() + delay,
            });
        }
    }

    /// 取出已到期的重试
    fn take_due_retries(&self) -> Vec<SyncJob> {
        let now = Instant::now();
        let mut retries = self.retries.lock();
        let (due, waiting): (Vec<_>, Vec<_>) = retries.drain(..).partition(|r| r.due <= now);
        *retries = waiting;
        due.into_iter()
            .map(|r| SyncJob {
                keys: [r.key].into_iter().collect(),
                attempt: r.attempt,
            })
            .collect()
    }
}

/// 同步 Worker 线程池
pub struct SyncWorkerPool {
    shared: Arc<Shared>,
    sender: Sender<SyncJob>,
    receiver: Receiver<SyncJob>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl SyncWorkerPool {
    pub fn new(synchronizer: Arc<Synchronizer>, config: SyncWorkerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                synchronizer,
                config,
                pending: Mutex::new(HashSet::new()),
                retries: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            sender,
            receiver,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 启动所有 Worker
    pub fn start(&self) -> std::io::Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return Ok(());
        }

        log::info!("Starting {} sync workers...", self.shared.config.worker_count);
        for worker_id in 0..self.shared.config.worker_count.max(1) {
            let shared = self.shared.clone();
            let receiver = self.receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sync-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, shared, receiver))?;
            handles.push(handle);
        }
        Ok(())
    }

    /// 通知变更 (fire-and-forget)
    ///
    /// 已在队列中的 key 被折叠；队列满时返回 `QueueFull`，调用方可稍后重试。
    pub fn notify_mutation(&self, keys: &BTreeSet<String>) -> Result<(), SyncError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }

        self.shared.synchronizer.record_mutation(keys);

        let fresh: BTreeSet<String> = {
            let mut pending = self.shared.pending.lock();
            keys.iter()
                .filter(|key| pending.insert((*key).clone()))
                .cloned()
                .collect()
        };
        if fresh.is_empty() {
            log::debug!("All {} keys already queued, folded", keys.len());
            return Ok(());
        }

        match self.sender.try_send(SyncJob {
            keys: fresh.clone(),
            attempt: 0,
        }) {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut pending = self.shared.pending.lock();
                for key in &fresh {
                    pending.remove(key);
                }
                match e {
                    TrySendError::Full(_) => {
                        self.shared
                            .synchronizer
                            .stats_ref()
                            .queue_rejected
                            .fetch_add(1, Ordering::Relaxed);
                        let capacity = self.shared.config.queue_capacity;
                        log::warn!("Sync queue full (capacity {}), {} keys rejected", capacity, fresh.len());
                        Err(SyncError::QueueFull { capacity })
                    }
                    TrySendError::Disconnected(_) => Err(SyncError::ShutDown),
                }
            }
        }
    }

    /// 队列中的任务数
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// 等待的重试数
    pub fn pending_retries(&self) -> usize {
        self.shared.retries.lock().len()
    }

    /// 等待所有任务和重试处理完毕，超时返回 false
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let idle = self.sender.is_empty()
                && self.shared.active.load(Ordering::SeqCst) == 0
                && self.shared.pending.lock().is_empty()
                && self.shared.retries.lock().is_empty();
            if idle {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// 停止所有 Worker（阻塞直到所有线程退出）
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping sync workers...");

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.join() {
                log::error!("Sync worker thread panicked: {:?}", e);
            }
        }

        log::info!("Sync workers stopped");
    }
}

impl Drop for SyncWorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(worker_id: usize, shared: Arc<Shared>, receiver: Receiver<SyncJob>) {
    log::info!("Sync worker {} started", worker_id);

    while !shared.shutdown.load(Ordering::Relaxed) {
        // 先标记忙碌再取重试，wait_idle 不会在取出与执行之间误判空闲
        shared.active.fetch_add(1, Ordering::SeqCst);
        for job in shared.take_due_retries() {
            shared.run_job(job);
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);

        match receiver.recv_timeout(shared.config.poll_interval) {
            Ok(job) => {
                shared.active.fetch_add(1, Ordering::SeqCst);
                shared.run_job(job);
                shared.active.fetch_sub(1, Ordering::SeqCst);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                log::info!("Sync worker {} channel disconnected, exiting", worker_id);
                break;
            }
        }
    }

    log::info!("Sync worker {} stopped", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::{Amount, FactCatalog, FactRecord, MemoryFactStore};
    use crate::rollup::{compile, Dimension, FieldSpec, FormulaRegistry, RollupSchema, RollupStore};
    use chrono::NaiveDateTime;

    fn fact(record: &str, store: &str, revenue: i64) -> FactRecord {
        FactRecord::new(
            record,
            record,
            store,
            NaiveDateTime::parse_from_str("2025-01-01 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            "meituan",
        )
        .with_item("revenue", Amount::from_units(revenue))
    }

    fn synchronizer(facts: Arc<MemoryFactStore>, rollups: Arc<RollupStore>) -> Arc<Synchronizer> {
        let catalog = FactCatalog::new(["revenue"], Vec::<String>::new());
        let schema = RollupSchema::new("by_store", vec![Dimension::StoreId])
            .with_field(FieldSpec::sum("revenue", "revenue"));
        let plan = compile(&schema, &catalog, Arc::new(FormulaRegistry::with_builtins())).unwrap();
        Arc::new(Synchronizer::new(facts, rollups, vec![Arc::new(plan)]))
    }

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SyncWorkerConfig {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(500),
            ..SyncWorkerConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_notify_processed_by_workers() {
        let facts = Arc::new(MemoryFactStore::new());
        let rollups = Arc::new(RollupStore::new());
        let pool = SyncWorkerPool::new(
            synchronizer(facts.clone(), rollups.clone()),
            SyncWorkerConfig::default(),
        );
        pool.start().unwrap();

        let affected = facts.append(vec![fact("r1", "S1", 10), fact("r2", "S2", 5)]).unwrap();
        pool.notify_mutation(&affected).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        assert_eq!(
            rollups.get("by_store", "S1").unwrap()[0].amount("revenue"),
            Some(Amount::from_units(10))
        );
        assert!(rollups.get("by_store", "S2").is_some());
        pool.stop();
    }

    #[test]
    fn test_queue_full_and_folding() {
        let facts = Arc::new(MemoryFactStore::new());
        let rollups = Arc::new(RollupStore::new());
        let pool = SyncWorkerPool::new(
            synchronizer(facts, rollups),
            SyncWorkerConfig {
                queue_capacity: 1,
                ..SyncWorkerConfig::default()
            },
        );
        // 未启动 worker，队列不会被消费

        pool.notify_mutation(&keys(&["S1"])).unwrap();
        // 已在队列中的 key 被折叠
        pool.notify_mutation(&keys(&["S1"])).unwrap();
        assert_eq!(pool.queued(), 1);

        let err = pool.notify_mutation(&keys(&["S2"])).unwrap_err();
        assert_eq!(err, SyncError::QueueFull { capacity: 1 });

        pool.stop();
        assert_eq!(pool.notify_mutation(&keys(&["S3"])), Err(SyncError::ShutDown));
    }

    #[test]
    fn test_failed_key_retried_until_exhausted() {
        let facts = Arc::new(MemoryFactStore::new());
        let rollups = Arc::new(RollupStore::new());
        let sync = synchronizer(facts.clone(), rollups);
        let pool = SyncWorkerPool::new(
            sync.clone(),
            SyncWorkerConfig {
                max_retries: 2,
                retry_base: Duration::from_millis(1),
                retry_max: Duration::from_millis(5),
                ..SyncWorkerConfig::default()
            },
        );
        pool.start().unwrap();

        facts.set_available(false);
        pool.notify_mutation(&keys(&["S1"])).unwrap();
        assert!(pool.wait_idle(Duration::from_secs(5)));

        let stats = sync.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.failures, 3);
        pool.stop();
    }
}
