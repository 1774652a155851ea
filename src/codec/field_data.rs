use crate::codec::{write_string, ByteReader};
use crate::errors::{NodeError, NodeResult};
use crate::schema::DataType;
use crate::types::PkValue;

// columnar accumulator for one field; the variant is fixed by the schema when
// the accumulator is created and every row appended must match it
#[derive(Clone, Debug, PartialEq)]
pub enum FieldData {
  Bool(Vec<bool>),
  Int8(Vec<i8>),
  Int16(Vec<i16>),
  Int32(Vec<i32>),
  Int64(Vec<i64>),
  Float(Vec<f32>),
  Double(Vec<f64>),
  String(Vec<String>),
  FloatVector { dim: usize, data: Vec<f32> },
  BinaryVector { dim: usize, data: Vec<u8> },
}

impl FieldData {
  pub fn new(dtype: DataType) -> FieldData {
    match dtype {
      DataType::Bool => FieldData::Bool(Vec::new()),
      DataType::Int8 => FieldData::Int8(Vec::new()),
      DataType::Int16 => FieldData::Int16(Vec::new()),
      DataType::Int32 => FieldData::Int32(Vec::new()),
      DataType::Int64 => FieldData::Int64(Vec::new()),
      DataType::Float => FieldData::Float(Vec::new()),
      DataType::Double => FieldData::Double(Vec::new()),
      DataType::String | DataType::VarChar => FieldData::String(Vec::new()),
      DataType::FloatVector { dim } => FieldData::FloatVector { dim, data: Vec::new() },
      DataType::BinaryVector { dim } => FieldData::BinaryVector { dim, data: Vec::new() },
    }
  }

  pub fn data_type(&self) -> DataType {
    match self {
      FieldData::Bool(_) => DataType::Bool,
      FieldData::Int8(_) => DataType::Int8,
      FieldData::Int16(_) => DataType::Int16,
      FieldData::Int32(_) => DataType::Int32,
      FieldData::Int64(_) => DataType::Int64,
      FieldData::Float(_) => DataType::Float,
      FieldData::Double(_) => DataType::Double,
      FieldData::String(_) => DataType::String,
      FieldData::FloatVector { dim, .. } => DataType::FloatVector { dim: *dim },
      FieldData::BinaryVector { dim, .. } => DataType::BinaryVector { dim: *dim },
    }
  }

  pub fn len(&self) -> usize {
    match self {
      FieldData::Bool(v) => v.len(),
      FieldData::Int8(v) => v.len(),
      FieldData::Int16(v) => v.len(),
      FieldData::Int32(v) => v.len(),
      FieldData::Int64(v) => v.len(),
      FieldData::Float(v) => v.len(),
      FieldData::Double(v) => v.len(),
      FieldData::String(v) => v.len(),
      FieldData::FloatVector { dim, data } => data.len() / (*dim).max(1),
      FieldData::BinaryVector { dim, data } => data.len() / ((*dim + 7) / 8).max(1),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn byte_size(&self) -> usize {
    match self {
      FieldData::Bool(v) => v.len(),
      FieldData::Int8(v) => v.len(),
      FieldData::Int16(v) => v.len() * 2,
      FieldData::Int32(v) => v.len() * 4,
      FieldData::Int64(v) => v.len() * 8,
      FieldData::Float(v) => v.len() * 4,
      FieldData::Double(v) => v.len() * 8,
      FieldData::String(v) => v.iter().map(|s| s.len() + 4).sum(),
      FieldData::FloatVector { data, .. } => data.len() * 4,
      FieldData::BinaryVector { data, .. } => data.len(),
    }
  }

  // decode one value off a row-payload cursor and append it
  pub fn read_one(&mut self, r: &mut ByteReader) -> NodeResult<()> {
    match self {
      FieldData::Bool(v) => v.push(r.read_u8()? != 0),
      FieldData::Int8(v) => v.push(r.read_u8()? as i8),
      FieldData::Int16(v) => {
        let bytes = r.read_n(2)?;
        v.push(i16::from_le_bytes([bytes[0], bytes[1]]));
      }
      FieldData::Int32(v) => v.push(r.read_u32()? as i32),
      FieldData::Int64(v) => v.push(r.read_i64()?),
      FieldData::Float(v) => v.push(f32::from_bits(r.read_u32()?)),
      FieldData::Double(v) => v.push(f64::from_bits(r.read_u64()?)),
      FieldData::String(v) => v.push(r.read_string()?),
      FieldData::FloatVector { dim, data } => {
        for _ in 0..*dim {
          data.push(f32::from_bits(r.read_u32()?));
        }
      }
      FieldData::BinaryVector { dim, data } => {
        let n_bytes = (*dim + 7) / 8;
        data.extend_from_slice(r.read_n(n_bytes)?);
      }
    }
    Ok(())
  }

  // append every value of `other`; variants must match
  pub fn append(&mut self, other: &FieldData) -> NodeResult<()> {
    match (self, other) {
      (FieldData::Bool(a), FieldData::Bool(b)) => a.extend_from_slice(b),
      (FieldData::Int8(a), FieldData::Int8(b)) => a.extend_from_slice(b),
      (FieldData::Int16(a), FieldData::Int16(b)) => a.extend_from_slice(b),
      (FieldData::Int32(a), FieldData::Int32(b)) => a.extend_from_slice(b),
      (FieldData::Int64(a), FieldData::Int64(b)) => a.extend_from_slice(b),
      (FieldData::Float(a), FieldData::Float(b)) => a.extend_from_slice(b),
      (FieldData::Double(a), FieldData::Double(b)) => a.extend_from_slice(b),
      (FieldData::String(a), FieldData::String(b)) => a.extend_from_slice(b),
      (
        FieldData::FloatVector { dim: da, data: a },
        FieldData::FloatVector { dim: db, data: b },
      ) if *da == *db => a.extend_from_slice(b),
      (
        FieldData::BinaryVector { dim: da, data: a },
        FieldData::BinaryVector { dim: db, data: b },
      ) if *da == *db => a.extend_from_slice(b),
      (a, b) => {
        return Err(NodeError::assertion(format!(
          "field data variant mismatch on append: {:?} vs {:?}",
          a.data_type(),
          b.data_type(),
        )))
      }
    }
    Ok(())
  }

  // copy row `i` of `other` onto the end of `self`; used by the compaction
  // merge which keeps rows one at a time
  pub fn append_row(&mut self, other: &FieldData, i: usize) -> NodeResult<()> {
    match (self, other) {
      (FieldData::Bool(a), FieldData::Bool(b)) => a.push(b[i]),
      (FieldData::Int8(a), FieldData::Int8(b)) => a.push(b[i]),
      (FieldData::Int16(a), FieldData::Int16(b)) => a.push(b[i]),
      (FieldData::Int32(a), FieldData::Int32(b)) => a.push(b[i]),
      (FieldData::Int64(a), FieldData::Int64(b)) => a.push(b[i]),
      (FieldData::Float(a), FieldData::Float(b)) => a.push(b[i]),
      (FieldData::Double(a), FieldData::Double(b)) => a.push(b[i]),
      (FieldData::String(a), FieldData::String(b)) => a.push(b[i].clone()),
      (
        FieldData::FloatVector { dim: da, data: a },
        FieldData::FloatVector { dim: db, data: b },
      ) if *da == *db => a.extend_from_slice(&b[i * *da..(i + 1) * *da]),
      (
        FieldData::BinaryVector { dim: da, data: a },
        FieldData::BinaryVector { dim: db, data: b },
      ) if *da == *db => {
        let w = (*da + 7) / 8;
        a.extend_from_slice(&b[i * w..(i + 1) * w]);
      }
      (a, b) => {
        return Err(NodeError::assertion(format!(
          "field data variant mismatch on append_row: {:?} vs {:?}",
          a.data_type(),
          b.data_type(),
        )))
      }
    }
    Ok(())
  }

  pub fn pk_at(&self, i: usize) -> NodeResult<PkValue> {
    match self {
      FieldData::Int64(v) => Ok(PkValue::Int(v[i])),
      FieldData::String(v) => Ok(PkValue::Str(v[i].clone())),
      other => Err(NodeError::assertion(format!(
        "primary key field holds non-key data type {:?}",
        other.data_type(),
      ))),
    }
  }

  pub fn pk_values(&self) -> NodeResult<Vec<PkValue>> {
    (0..self.len()).map(|i| self.pk_at(i)).collect()
  }

  // raw columnar payload, the binlog wire form
  pub fn encode_payload(&self, out: &mut Vec<u8>) {
    match self {
      FieldData::Bool(v) => {
        for x in v {
          out.push(*x as u8);
        }
      }
      FieldData::Int8(v) => {
        for x in v {
          out.push(*x as u8);
        }
      }
      FieldData::Int16(v) => {
        for x in v {
          out.extend_from_slice(&x.to_le_bytes());
        }
      }
      FieldData::Int32(v) => {
        for x in v {
          out.extend_from_slice(&x.to_le_bytes());
        }
      }
      FieldData::Int64(v) => {
        for x in v {
          out.extend_from_slice(&x.to_le_bytes());
        }
      }
      FieldData::Float(v) => {
        for x in v {
          out.extend_from_slice(&x.to_bits().to_le_bytes());
        }
      }
      FieldData::Double(v) => {
        for x in v {
          out.extend_from_slice(&x.to_bits().to_le_bytes());
        }
      }
      FieldData::String(v) => {
        for x in v {
          write_string(out, x);
        }
      }
      FieldData::FloatVector { data, .. } => {
        for x in data {
          out.extend_from_slice(&x.to_bits().to_le_bytes());
        }
      }
      FieldData::BinaryVector { data, .. } => out.extend_from_slice(data),
    }
  }

  pub fn decode_payload(
    dtype: DataType,
    row_count: usize,
    r: &mut ByteReader,
  ) -> NodeResult<FieldData> {
    let mut res = FieldData::new(dtype);
    for _ in 0..row_count {
      res.read_one(r)?;
    }
    Ok(res)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_row_decode_little_endian() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&7i64.to_le_bytes());
    payload.extend_from_slice(&1.5f32.to_bits().to_le_bytes());
    payload.extend_from_slice(&2.5f32.to_bits().to_le_bytes());

    let mut pk = FieldData::new(DataType::Int64);
    let mut vec = FieldData::new(DataType::FloatVector { dim: 2 });
    let mut r = ByteReader::new(&payload);
    pk.read_one(&mut r).unwrap();
    vec.read_one(&mut r).unwrap();

    assert!(r.complete());
    assert_eq!(pk, FieldData::Int64(vec![7]));
    assert_eq!(vec.len(), 1);
    assert_eq!(vec.byte_size(), 8);
  }

  #[test]
  fn test_append_rejects_mismatch() {
    let mut a = FieldData::new(DataType::Int64);
    let b = FieldData::new(DataType::Double);
    assert!(a.append(&b).is_err());
  }

  #[test]
  fn test_append_row_slices_vectors() {
    let src = FieldData::FloatVector {
      dim: 2,
      data: vec![1.0, 2.0, 3.0, 4.0],
    };
    let mut dst = FieldData::new(DataType::FloatVector { dim: 2 });
    dst.append_row(&src, 1).unwrap();
    assert_eq!(
      dst,
      FieldData::FloatVector { dim: 2, data: vec![3.0, 4.0] },
    );
  }
}
