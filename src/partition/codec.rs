// 事实记录 <-> Arrow2 列式编码
//
// 列布局:
// - record_id / order_id / store_id / channel: Utf8
// - timestamp: Int64 (纳秒，与内存中的 NaiveDateTime 精度一致)
// - item:<name> / order:<name>: Int64 可空，定点金额原始值
//
// 数值列按字段名排序，同样内容总是得到同样的列顺序。

use arrow2::array::{Array, MutablePrimitiveArray, MutableUtf8Array, PrimitiveArray, Utf8Array};
use arrow2::chunk::Chunk;
use arrow2::datatypes::{DataType, Field, Schema};
use std::collections::BTreeSet;

use super::PartitionError;
use crate::fact::{Amount, FactRecord};

const ITEM_PREFIX: &str = "item:";
const ORDER_PREFIX: &str = "order:";
const BASE_COLUMNS: usize = 5;

/// 规范排序：按 record_id
pub fn canonical_sort(facts: &mut [FactRecord]) {
    facts.sort_by(|a, b| a.record_id.cmp(&b.record_id));
}

/// 内容哈希：规范排序后的 JSON 编码的 crc32 加行数
///
/// 调用方需先 `canonical_sort`
pub fn content_hash(facts: &[FactRecord]) -> Result<String, PartitionError> {
    let mut hasher = crc32fast::Hasher::new();
    for fact in facts {
        hasher.update(&serde_json::to_vec(fact)?);
        hasher.update(b"\n");
    }
    Ok(format!("{:08x}-{}", hasher.finalize(), facts.len()))
}

/// 根据记录中出现的字段生成 Schema
pub fn schema_for(facts: &[FactRecord]) -> Schema {
    let mut item_fields = BTreeSet::new();
    let mut order_fields = BTreeSet::new();
    for fact in facts {
        item_fields.extend(fact.item_fields.keys().cloned());
        order_fields.extend(fact.order_fields.keys().cloned());
    }

    let mut fields = vec![
        Field::new("record_id", DataType::Utf8, false),
        Field::new("order_id", DataType::Utf8, false),
        Field::new("store_id", DataType::Utf8, false),
        Field::new("channel", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
    ];
    for name in item_fields {
        fields.push(Field::new(format!("{}{}", ITEM_PREFIX, name), DataType::Int64, true));
    }
    for name in order_fields {
        fields.push(Field::new(format!("{}{}", ORDER_PREFIX, name), DataType::Int64, true));
    }
    Schema::from(fields)
}

/// 编码为 Chunk
pub fn encode(schema: &Schema, facts: &[FactRecord]) -> Result<Chunk<Box<dyn Array>>, PartitionError> {
    let len = facts.len();

    let mut record_id_builder = MutableUtf8Array::<i32>::with_capacity(len);
    let mut order_id_builder = MutableUtf8Array::<i32>::with_capacity(len);
    let mut store_id_builder = MutableUtf8Array::<i32>::with_capacity(len);
    let mut channel_builder = MutableUtf8Array::<i32>::with_capacity(len);
    let mut timestamp_builder = MutablePrimitiveArray::<i64>::with_capacity(len);

    for fact in facts {
        record_id_builder.push(Some(fact.record_id.as_str()));
        order_id_builder.push(Some(fact.order_id.as_str()));
        store_id_builder.push(Some(fact.store_id.as_str()));
        channel_builder.push(Some(fact.channel.as_str()));
        let nanos = fact.timestamp.and_utc().timestamp_nanos_opt().ok_or_else(|| {
            PartitionError::Parquet(format!(
                "Timestamp {} of {} out of range",
                fact.timestamp, fact.record_id
            ))
        })?;
        timestamp_builder.push(Some(nanos));
    }

    let record_id_array: Utf8Array<i32> = record_id_builder.into();
    let order_id_array: Utf8Array<i32> = order_id_builder.into();
    let store_id_array: Utf8Array<i32> = store_id_builder.into();
    let channel_array: Utf8Array<i32> = channel_builder.into();
    let timestamp_array: PrimitiveArray<i64> = timestamp_builder.into();

    let mut arrays: Vec<Box<dyn Array>> = vec![
        Box::new(record_id_array),
        Box::new(order_id_array),
        Box::new(store_id_array),
        Box::new(channel_array),
        Box::new(timestamp_array),
    ];

    for field in schema.fields.iter().skip(BASE_COLUMNS) {
        let mut builder = MutablePrimitiveArray::<i64>::with_capacity(len);
        for fact in facts {
            let value = if let Some(name) = field.name.strip_prefix(ITEM_PREFIX) {
                fact.item_field(name)
            } else if let Some(name) = field.name.strip_prefix(ORDER_PREFIX) {
                fact.order_field(name)
            } else {
                None
            };
            builder.push(value.map(Amount::raw));
        }
        let array: PrimitiveArray<i64> = builder.into();
        arrays.push(Box::new(array));
    }

    Ok(Chunk::new(arrays))
}

/// 从 Chunk 解码事实记录
pub fn decode(schema: &Schema, chunk: &Chunk<Box<dyn Array>>) -> Result<Vec<FactRecord>, PartitionError> {
    let arrays = chunk.arrays();
    if arrays.len() != schema.fields.len() || arrays.len() < BASE_COLUMNS {
        return Err(PartitionError::Parquet(format!(
            "Column count mismatch: schema {}, chunk {}",
            schema.fields.len(),
            arrays.len()
        )));
    }

    let record_ids = strings(arrays[0].as_ref(), "record_id")?;
    let order_ids = strings(arrays[1].as_ref(), "order_id")?;
    let store_ids = strings(arrays[2].as_ref(), "store_id")?;
    let channels = strings(arrays[3].as_ref(), "channel")?;
    let timestamps = int64(arrays[4].as_ref(), "timestamp")?;

    let mut facts = Vec::with_capacity(chunk.len());
    for row in 0..chunk.len() {
        let timestamp = chrono::DateTime::from_timestamp_nanos(timestamps.value(row)).naive_utc();
        facts.push(FactRecord::new(
            record_ids[row].clone(),
            order_ids[row].clone(),
            store_ids[row].clone(),
            timestamp,
            channels[row].clone(),
        ));
    }

    for (field, array) in schema.fields.iter().zip(arrays.iter()).skip(BASE_COLUMNS) {
        let values = int64(array.as_ref(), &field.name)?;
        let (is_item, name) = if let Some(name) = field.name.strip_prefix(ITEM_PREFIX) {
            (true, name)
        } else if let Some(name) = field.name.strip_prefix(ORDER_PREFIX) {
            (false, name)
        } else {
            continue;
        };

        for (row, fact) in facts.iter_mut().enumerate() {
            if !values.is_valid(row) {
                continue;
            }
            let amount = Amount::from_raw(values.value(row));
            if is_item {
                fact.item_fields.insert(name.to_string(), amount);
            } else {
                fact.order_fields.insert(name.to_string(), amount);
            }
        }
    }

    Ok(facts)
}

fn strings(array: &dyn Array, column: &str) -> Result<Vec<String>, PartitionError> {
    if let Some(utf8) = array.as_any().downcast_ref::<Utf8Array<i32>>() {
        return Ok(utf8.values_iter().map(str::to_string).collect());
    }
    if let Some(utf8) = array.as_any().downcast_ref::<Utf8Array<i64>>() {
        return Ok(utf8.values_iter().map(str::to_string).collect());
    }
    Err(PartitionError::Parquet(format!("Column {} is not utf8", column)))
}

fn int64<'a>(array: &'a dyn Array, column: &str) -> Result<&'a PrimitiveArray<i64>, PartitionError> {
    array
        .as_any()
        .downcast_ref::<PrimitiveArray<i64>>()
        .ok_or_else(|| PartitionError::Parquet(format!("Column {} is not int64", column)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn facts() -> Vec<FactRecord> {
        let ts = NaiveDateTime::parse_from_str("2025-01-01 10:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        vec![
            FactRecord::new("r2", "o1", "S1", ts, "eleme")
                .with_item("revenue", Amount::from_cents(1050))
                .with_order("delivery_fee", Amount::from_units(5)),
            FactRecord::new("r1", "o1", "S1", ts, "eleme").with_item("cost", Amount::from_units(3)),
        ]
    }

    #[test]
    fn test_encode_decode() {
        let mut facts = facts();
        canonical_sort(&mut facts);
        let schema = schema_for(&facts);
        assert_eq!(schema.fields.len(), 8);
        assert_eq!(schema.fields[5].name, "item:cost");

        let chunk = encode(&schema, &facts).unwrap();
        let decoded = decode(&schema, &chunk).unwrap();
        assert_eq!(decoded, facts);
    }

    #[test]
    fn test_sub_millisecond_timestamps_survive() {
        let ts = NaiveDateTime::parse_from_str("2025-01-01 10:30:00.123456789", "%Y-%m-%d %H:%M:%S%.f").unwrap();
        let mut facts = vec![FactRecord::new("r1", "o1", "S1", ts, "eleme").with_item("cost", Amount::from_units(3))];
        canonical_sort(&mut facts);
        let schema = schema_for(&facts);

        let decoded = decode(&schema, &encode(&schema, &facts).unwrap()).unwrap();
        assert_eq!(decoded[0].timestamp, ts);
        assert_eq!(content_hash(&decoded).unwrap(), content_hash(&facts).unwrap());
    }

    #[test]
    fn test_content_hash_ignores_input_order() {
        let mut a = facts();
        let mut b = facts();
        b.reverse();
        canonical_sort(&mut a);
        canonical_sort(&mut b);
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());

        let mut c = facts();
        c[0].item_fields.insert("revenue".into(), Amount::from_units(11));
        canonical_sort(&mut c);
        assert_ne!(content_hash(&a).unwrap(), content_hash(&c).unwrap());
        assert!(content_hash(&a).unwrap().ends_with("-2"));
    }
}
