// Bloom Filter - 汇总切片存在性过滤
//
// 用途：
// - 拦截从未提交过的 (schema, scope) 缓存键，避免穿透到汇总表
// - 只增不删：切片被清空后仍可能返回"存在"，由空值缓存兜底
//
// 参数：m = -n*ln(p) / ln(2)^2, k = (m/n) * ln(2)
// 位索引使用双重哈希 h_i(x) = h1(x) + i * h2(x)

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// 布隆过滤器
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    /// 位数
    m: u64,
    /// 哈希函数数量
    k: u32,
    /// 已插入次数
    inserted: u64,
    capacity: usize,
}

impl BloomFilter {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let n = capacity.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;

        let m = ((-n * p.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as u32;

        Self {
            words: vec![0; ((m + 63) / 64) as usize],
            m,
            k,
            inserted: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: &str) {
        let (h1, h2) = Self::hashes(key);
        for i in 0..self.k {
            let bit = self.index(h1, h2, i);
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    /// false 表示一定不存在
    pub fn contains(&self, key: &str) -> bool {
        let (h1, h2) = Self::hashes(key);
        (0..self.k).all(|i| {
            let bit = self.index(h1, h2, i);
            self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0
        })
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.inserted = 0;
    }

    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// 插入次数超过设计容量
    pub fn is_saturated(&self) -> bool {
        self.inserted > self.capacity as u64
    }

    /// 当前假阳性率估计 (1 - e^(-kn/m))^k
    pub fn estimated_fpp(&self) -> f64 {
        if self.inserted == 0 {
            return 0.0;
        }
        let exponent = -(self.k as f64) * (self.inserted as f64) / (self.m as f64);
        (1.0 - exponent.exp()).powi(self.k as i32)
    }

    fn hashes(key: &str) -> (u64, u64) {
        let mut first = DefaultHasher::new();
        key.hash(&mut first);
        let h1 = first.finish();

        let mut second = DefaultHasher::new();
        h1.hash(&mut second);
        key.hash(&mut second);
        // 奇数步长，避免 h2 = 0 时所有探测落在同一位
        let h2 = second.finish() | 1;
        (h1, h2)
    }

    fn index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.m
    }
}
