use std::collections::HashMap;

use crate::codec::field_data::FieldData;
use crate::codec::ByteReader;
use crate::constants::{ROW_ID_FIELD_ID, TIMESTAMP_FIELD_ID};
use crate::errors::{NodeError, NodeResult};
use crate::msg::InsertMsg;
use crate::schema::CollectionSchema;
use crate::types::{FieldId, PkValue};

// in-memory batch of insert data for one segment; rows accumulate until the
// row limit derived from the flush byte budget is hit
pub struct BufferData {
  pub fields: HashMap<FieldId, FieldData>,
  pub size: usize,
  pub limit: usize,
}

impl BufferData {
  pub fn new(schema: &CollectionSchema, budget_bytes: u64) -> NodeResult<BufferData> {
    let limit = schema.buffer_row_limit(budget_bytes)?;
    let mut fields = HashMap::new();
    for field in &schema.fields {
      fields.insert(field.field_id, FieldData::new(field.data_type));
    }
    Ok(BufferData {
      fields,
      size: 0,
      limit,
    })
  }

  pub fn effective_cap(&self) -> i64 {
    self.limit as i64 - self.size as i64
  }

  pub fn is_full(&self) -> bool {
    self.effective_cap() <= 0
  }

  // decode and append every row of the message; returns the primary-key
  // values seen so the caller can feed the segment's filter. Rows decode into
  // scratch accumulators first so a bad row leaves the buffer untouched.
  pub fn buffer_insert_msg(
    &mut self,
    schema: &CollectionSchema,
    msg: &InsertMsg,
  ) -> NodeResult<Vec<PkValue>> {
    msg.check_aligned()?;
    let pk_field_id = schema.pk_field()?.field_id;

    let mut scratch: HashMap<FieldId, FieldData> = schema
      .payload_fields()
      .map(|f| (f.field_id, FieldData::new(f.data_type)))
      .collect();
    for (i, row) in msg.rows.iter().enumerate() {
      let mut reader = ByteReader::new(row);
      for field in schema.payload_fields() {
        scratch
          .get_mut(&field.field_id)
          .ok_or_else(|| NodeError::assertion(format!(
            "buffer has no accumulator for field {}",
            field.field_id,
          )))?
          .read_one(&mut reader)?;
      }
      if !reader.complete() {
        return Err(NodeError::invalid(format!(
          "row {} for segment {} has {} undecoded trailing bytes",
          i,
          msg.segment_id,
          reader.remaining(),
        )));
      }
    }
    let pks = scratch
      .get(&pk_field_id)
      .ok_or_else(|| NodeError::assertion("schema primary key has no accumulator"))?
      .pk_values()?;

    for (field_id, data) in &scratch {
      self.fields
        .get_mut(field_id)
        .ok_or_else(|| NodeError::assertion(format!(
          "buffer has no accumulator for field {}",
          field_id,
        )))?
        .append(data)?;
    }

    // reserved fields take the envelope values; timestamps are reinterpreted
    // as signed 64-bit on the way in
    if let Some(row_id_data) = self.fields.get_mut(&ROW_ID_FIELD_ID) {
      row_id_data.append(&FieldData::Int64(msg.row_ids.clone()))?;
    }
    if let Some(ts_data) = self.fields.get_mut(&TIMESTAMP_FIELD_ID) {
      let signed: Vec<i64> = msg.timestamps.iter().map(|ts| *ts as i64).collect();
      ts_data.append(&FieldData::Int64(signed))?;
    }

    self.size += msg.rows.len();
    Ok(pks)
  }
}

#[cfg(test)]
pub mod tests {
  use super::*;
  use crate::schema::{DataType, FieldSchema};

  pub fn test_schema(dim: usize) -> CollectionSchema {
    CollectionSchema {
      name: "docs".to_string(),
      fields: vec![
        FieldSchema {
          field_id: ROW_ID_FIELD_ID,
          name: "row_id".to_string(),
          data_type: DataType::Int64,
          is_primary_key: false,
        },
        FieldSchema {
          field_id: TIMESTAMP_FIELD_ID,
          name: "timestamp".to_string(),
          data_type: DataType::Int64,
          is_primary_key: false,
        },
        FieldSchema {
          field_id: 100,
          name: "pk".to_string(),
          data_type: DataType::Int64,
          is_primary_key: true,
        },
        FieldSchema {
          field_id: 101,
          name: "embedding".to_string(),
          data_type: DataType::FloatVector { dim },
          is_primary_key: false,
        },
      ],
    }
  }

  pub fn row_payload(pk: i64, vector: &[f32]) -> Vec<u8> {
    let mut row = Vec::new();
    row.extend_from_slice(&pk.to_le_bytes());
    for x in vector {
      row.extend_from_slice(&x.to_bits().to_le_bytes());
    }
    row
  }

  pub fn insert_msg(segment_id: i64, pks: &[i64]) -> InsertMsg {
    InsertMsg {
      collection_id: 1,
      partition_id: 10,
      segment_id,
      channel: "ch-1".to_string(),
      row_ids: pks.to_vec(),
      timestamps: pks.iter().map(|pk| *pk as u64 * 100).collect(),
      rows: pks
        .iter()
        .map(|pk| row_payload(*pk, &[*pk as f32; 4]))
        .collect(),
    }
  }

  #[test]
  fn test_buffer_fills_and_reports_pks() {
    let schema = test_schema(4);
    // 16 bytes per row, so a 256-byte budget holds 16 rows
    let mut buffer = BufferData::new(&schema, 256).unwrap();
    assert_eq!(buffer.limit, 16);

    let pks: Vec<i64> = (1..=10).collect();
    let seen = buffer.buffer_insert_msg(&schema, &insert_msg(5, &pks)).unwrap();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[0], PkValue::Int(1));
    assert_eq!(buffer.size, 10);
    assert!(!buffer.is_full());
    assert_eq!(buffer.effective_cap(), 6);

    let more: Vec<i64> = (11..=16).collect();
    buffer.buffer_insert_msg(&schema, &insert_msg(5, &more)).unwrap();
    assert!(buffer.is_full());

    // reserved fields picked up envelope values
    assert_eq!(buffer.fields[&ROW_ID_FIELD_ID].len(), 16);
    assert_eq!(buffer.fields[&TIMESTAMP_FIELD_ID].len(), 16);
  }

  #[test]
  fn test_misaligned_message_fails() {
    let schema = test_schema(4);
    let mut buffer = BufferData::new(&schema, 256).unwrap();
    let mut msg = insert_msg(5, &[1, 2, 3]);
    msg.timestamps.pop();
    assert!(buffer.buffer_insert_msg(&schema, &msg).is_err());
  }

  #[test]
  fn test_trailing_bytes_fail() {
    let schema = test_schema(4);
    let mut buffer = BufferData::new(&schema, 256).unwrap();
    let mut msg = insert_msg(5, &[1]);
    msg.rows[0].push(0xff);
    assert!(buffer.buffer_insert_msg(&schema, &msg).is_err());
  }
}
