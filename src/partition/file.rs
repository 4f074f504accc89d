// 分区文件 - Parquet 列式存储
//
// 设计理念:
// - 每个分区一个不可变文件，单 row group
// - Snappy 压缩，写入统计信息
// - 先写临时文件再 rename，读者永远看不到半个文件

use arrow2::array::Array;
use arrow2::chunk::Chunk;
use arrow2::datatypes::Schema;
use arrow2::io::parquet::read::{infer_schema, read_metadata, FileReader};
use arrow2::io::parquet::write::{
    CompressionOptions, Encoding, FileWriter, RowGroupIterator, Version, WriteOptions,
};
use std::fs::File;
use std::path::{Path, PathBuf};

use super::codec;
use super::PartitionError;
use crate::fact::FactRecord;

fn write_options() -> WriteOptions {
    WriteOptions {
        write_statistics: true,
        compression: CompressionOptions::Snappy,
        version: Version::V2,
        data_pagesize_limit: None,
    }
}

/// 临时文件路径
pub fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// 写入分区文件 (facts 需已规范排序)
///
/// 返回文件大小
pub fn write_partition_file(path: &Path, facts: &[FactRecord]) -> Result<u64, PartitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let schema = codec::schema_for(facts);
    let chunk = codec::encode(&schema, facts)?;

    let tmp = temp_path(path);
    if let Err(e) = write_chunk(&tmp, &schema, chunk) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }

    // 原子提交
    std::fs::rename(&tmp, path)?;
    Ok(std::fs::metadata(path)?.len())
}

fn write_chunk(path: &Path, schema: &Schema, chunk: Chunk<Box<dyn Array>>) -> Result<(), PartitionError> {
    let file = File::create(path)?;
    let mut writer = FileWriter::try_new(file, schema.clone(), write_options())?;

    if !chunk.is_empty() {
        let row_groups = RowGroupIterator::try_new(
            vec![Ok(chunk)].into_iter(),
            schema,
            write_options(),
            vec![vec![Encoding::Plain]; schema.fields.len()],
        )?;
        for group in row_groups {
            writer.write(group?)?;
        }
    }

    writer.end(None)?;
    Ok(())
}

/// 读取分区文件中的全部事实记录
pub fn read_partition_file(path: &Path) -> Result<Vec<FactRecord>, PartitionError> {
    let mut file = File::open(path)?;
    let metadata = read_metadata(&mut file)?;
    let schema = infer_schema(&metadata)?;

    let reader = FileReader::new(file, metadata.row_groups, schema.clone(), None, None, None);

    let mut facts = Vec::new();
    for chunk in reader {
        facts.extend(codec::decode(&schema, &chunk?)?);
    }
    Ok(facts)
}
