// 分区清单
//
// 设计原则：
// 1. 记录每个 (store_id, date) 当前生效的文件与内容哈希
// 2. 可选保存写入时预计算的日汇总行
// 3. 原子性保存：临时文件 + rename

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::{PartitionError, PartitionId};
use crate::rollup::AggregateRow;

/// 清单条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub store_id: String,
    pub date: NaiveDate,
    /// 相对于存储根目录的文件名
    pub file: String,
    pub content_hash: String,
    pub row_count: usize,
    pub file_size: u64,
    /// 写入时间（Unix 时间戳，秒）
    pub written_at: i64,
    /// 预计算的日汇总行
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<AggregateRow>>,
}

impl PartitionEntry {
    pub fn id(&self) -> PartitionId {
        PartitionId::new(self.store_id.clone(), self.date)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    entries: Vec<PartitionEntry>,
}

/// 分区清单管理器
#[derive(Debug)]
pub struct PartitionManifest {
    entries: BTreeMap<PartitionId, PartitionEntry>,
    path: PathBuf,
}

impl PartitionManifest {
    const FORMAT_VERSION: u32 = 1;

    pub fn new(path: PathBuf) -> Self {
        Self {
            entries: BTreeMap::new(),
            path,
        }
    }

    /// 从磁盘加载清单，不存在时创建空清单
    pub fn load(path: PathBuf) -> Result<Self, PartitionError> {
        if !path.exists() {
            return Ok(Self::new(path));
        }

        let mut content = String::new();
        File::open(&path)?.read_to_string(&mut content)?;
        let file: ManifestFile = serde_json::from_str(&content)?;

        let entries = file
            .entries
            .into_iter()
            .map(|entry| (entry.id(), entry))
            .collect();
        Ok(Self { entries, path })
    }

    /// 保存清单到磁盘（原子性）
    pub fn save(&self) -> Result<(), PartitionError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&ManifestFile {
            version: Self::FORMAT_VERSION,
            entries: self.entries.values().cloned().collect(),
        })?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &PartitionId) -> Option<&PartitionEntry> {
        self.entries.get(id)
    }

    /// 插入或替换条目，返回被替换的条目
    pub fn upsert(&mut self, entry: PartitionEntry) -> Option<PartitionEntry> {
        self.entries.insert(entry.id(), entry)
    }

    pub fn remove(&mut self, id: &PartitionId) -> Option<PartitionEntry> {
        self.entries.remove(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.entries.values().map(|e| e.row_count).sum()
    }
}

/// 新条目的写入时间
pub(crate) fn now_secs() -> i64 {
    Utc::now().timestamp()
}
