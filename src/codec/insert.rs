use crate::codec::field_data::FieldData;
use crate::codec::ByteReader;
use crate::constants::BINLOG_MAGIC;
use crate::errors::{NodeError, NodeResult};
use crate::schema::DataType;
use crate::types::{CollectionId, FieldId, PartitionId, SegmentId};

// insert binlog: a descriptor naming the field, then the raw columnar
// payload; fixed-width values are little-endian, strings length-prefixed,
// vectors packed element-wise
#[derive(Clone, Debug, PartialEq)]
pub struct BinlogDescriptor {
  pub collection_id: CollectionId,
  pub partition_id: PartitionId,
  pub segment_id: SegmentId,
  pub field_id: FieldId,
  pub data_type: DataType,
  pub row_count: u64,
}

pub fn encode_insert_binlog(desc: &BinlogDescriptor, data: &FieldData) -> NodeResult<Vec<u8>> {
  if data.len() as u64 != desc.row_count {
    return Err(NodeError::assertion(format!(
      "binlog descriptor row count {} does not match field data rows {}",
      desc.row_count,
      data.len(),
    )));
  }
  let dim = match desc.data_type {
    DataType::FloatVector { dim } | DataType::BinaryVector { dim } => dim,
    _ => 0,
  };

  let mut out = Vec::with_capacity(data.byte_size() + 64);
  out.extend_from_slice(&BINLOG_MAGIC.to_le_bytes());
  out.extend_from_slice(&desc.collection_id.to_le_bytes());
  out.extend_from_slice(&desc.partition_id.to_le_bytes());
  out.extend_from_slice(&desc.segment_id.to_le_bytes());
  out.extend_from_slice(&desc.field_id.to_le_bytes());
  out.push(desc.data_type.code());
  out.extend_from_slice(&(dim as u32).to_le_bytes());
  out.extend_from_slice(&desc.row_count.to_le_bytes());
  data.encode_payload(&mut out);
  Ok(out)
}

pub fn decode_insert_binlog(bytes: &[u8]) -> NodeResult<(BinlogDescriptor, FieldData)> {
  let mut r = ByteReader::new(bytes);
  let magic = r.read_u32()?;
  if magic != BINLOG_MAGIC {
    return Err(NodeError::invalid(format!(
      "insert binlog has bad magic {:#x}",
      magic,
    )));
  }
  let collection_id = r.read_i64()?;
  let partition_id = r.read_i64()?;
  let segment_id = r.read_i64()?;
  let field_id = r.read_i64()?;
  let dtype_code = r.read_u8()?;
  let dim = r.read_u32()? as usize;
  let row_count = r.read_u64()?;
  let data_type = DataType::from_code(dtype_code, dim)?;

  let desc = BinlogDescriptor {
    collection_id,
    partition_id,
    segment_id,
    field_id,
    data_type,
    row_count,
  };
  let data = FieldData::decode_payload(data_type, row_count as usize, &mut r)?;
  if !r.complete() {
    return Err(NodeError::invalid(format!(
      "insert binlog for field {} has {} trailing bytes",
      field_id,
      r.remaining(),
    )));
  }
  Ok((desc, data))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_vector_binlog_roundtrip() {
    let data = FieldData::FloatVector {
      dim: 4,
      data: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
    };
    let desc = BinlogDescriptor {
      collection_id: 1,
      partition_id: 2,
      segment_id: 3,
      field_id: 101,
      data_type: DataType::FloatVector { dim: 4 },
      row_count: 2,
    };
    let bytes = encode_insert_binlog(&desc, &data).unwrap();
    let (decoded_desc, decoded) = decode_insert_binlog(&bytes).unwrap();
    assert_eq!(decoded_desc, desc);
    assert_eq!(decoded, data);
  }

  #[test]
  fn test_string_binlog_roundtrip() {
    let data = FieldData::String(vec!["a".to_string(), "longer value".to_string()]);
    let desc = BinlogDescriptor {
      collection_id: 1,
      partition_id: 2,
      segment_id: 3,
      field_id: 102,
      data_type: DataType::VarChar,
      row_count: 2,
    };
    let bytes = encode_insert_binlog(&desc, &data).unwrap();
    let (_, decoded) = decode_insert_binlog(&bytes).unwrap();
    assert_eq!(decoded, data);
  }

  #[test]
  fn test_descriptor_row_count_must_match() {
    let data = FieldData::Int64(vec![1, 2, 3]);
    let desc = BinlogDescriptor {
      collection_id: 1,
      partition_id: 2,
      segment_id: 3,
      field_id: 100,
      data_type: DataType::Int64,
      row_count: 2,
    };
    assert!(encode_insert_binlog(&desc, &data).is_err());
  }
}
