use crate::codec::{write_string, ByteReader};
use crate::constants::DELTA_MAGIC;
use crate::errors::{NodeError, NodeResult};
use crate::types::{PkValue, Timestamp};

const PK_INT_TAG: u8 = 0;
const PK_STR_TAG: u8 = 1;

// parallel (pk, ts) vectors; the unit every delete travels in
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteData {
  pub pks: Vec<PkValue>,
  pub tss: Vec<Timestamp>,
}

impl DeleteData {
  pub fn row_count(&self) -> usize {
    debug_assert_eq!(self.pks.len(), self.tss.len());
    self.pks.len()
  }

  pub fn append(&mut self, pk: PkValue, ts: Timestamp) {
    self.pks.push(pk);
    self.tss.push(ts);
  }

  pub fn iter(&self) -> impl Iterator<Item = (&PkValue, Timestamp)> {
    self.pks.iter().zip(self.tss.iter().copied())
  }
}

// delta blob: framing header then (pk, ts) tuples
pub fn encode_delta_log(data: &DeleteData) -> NodeResult<Vec<u8>> {
  if data.pks.len() != data.tss.len() {
    return Err(NodeError::assertion(format!(
      "delete data is misaligned: {} pks vs {} timestamps",
      data.pks.len(),
      data.tss.len(),
    )));
  }
  let mut out = Vec::new();
  out.extend_from_slice(&DELTA_MAGIC.to_le_bytes());
  out.extend_from_slice(&(data.row_count() as u64).to_le_bytes());
  for (pk, ts) in data.iter() {
    match pk {
      PkValue::Int(v) => {
        out.push(PK_INT_TAG);
        out.extend_from_slice(&v.to_le_bytes());
      }
      PkValue::Str(v) => {
        out.push(PK_STR_TAG);
        write_string(&mut out, v);
      }
    }
    out.extend_from_slice(&ts.to_le_bytes());
  }
  Ok(out)
}

pub fn decode_delta_log(bytes: &[u8]) -> NodeResult<DeleteData> {
  let mut r = ByteReader::new(bytes);
  let magic = r.read_u32()?;
  if magic != DELTA_MAGIC {
    return Err(NodeError::invalid(format!(
      "delta log has bad magic {:#x}",
      magic,
    )));
  }
  let count = r.read_u64()? as usize;
  let mut res = DeleteData::default();
  for _ in 0..count {
    let tag = r.read_u8()?;
    let pk = match tag {
      PK_INT_TAG => PkValue::Int(r.read_i64()?),
      PK_STR_TAG => PkValue::Str(r.read_string()?),
      other => {
        return Err(NodeError::invalid(format!(
          "delta log has unknown primary key tag {}",
          other,
        )))
      }
    };
    let ts = r.read_u64()?;
    res.append(pk, ts);
  }
  if !r.complete() {
    return Err(NodeError::invalid(format!(
      "delta log has {} trailing bytes",
      r.remaining(),
    )));
  }
  Ok(res)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delta_roundtrip_mixed_keys() {
    let mut data = DeleteData::default();
    data.append(PkValue::Int(42), 1000);
    data.append(PkValue::Str("doc-9".to_string()), 1001);
    let bytes = encode_delta_log(&data).unwrap();
    assert_eq!(decode_delta_log(&bytes).unwrap(), data);
  }

  #[test]
  fn test_misaligned_delete_data_rejected() {
    let data = DeleteData {
      pks: vec![PkValue::Int(1)],
      tss: vec![],
    };
    assert!(encode_delta_log(&data).is_err());
  }
}
