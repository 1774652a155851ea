use serde::{Deserialize, Serialize};

use crate::constants::{ROW_ID_FIELD_ID, START_USER_FIELD_ID, TIMESTAMP_FIELD_ID};
use crate::errors::{NodeError, NodeResult};
use crate::types::FieldId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
  Bool,
  Int8,
  Int16,
  Int32,
  Int64,
  Float,
  Double,
  String,
  VarChar,
  FloatVector { dim: usize },
  BinaryVector { dim: usize },
}

impl DataType {
  // byte width of one value in row payloads and binlogs; None for
  // length-prefixed string types
  pub fn fixed_width(&self) -> Option<usize> {
    match self {
      DataType::Bool | DataType::Int8 => Some(1),
      DataType::Int16 => Some(2),
      DataType::Int32 | DataType::Float => Some(4),
      DataType::Int64 | DataType::Double => Some(8),
      DataType::String | DataType::VarChar => None,
      DataType::FloatVector { dim } => Some(dim * 4),
      DataType::BinaryVector { dim } => Some((dim + 7) / 8),
    }
  }

  pub fn is_vector(&self) -> bool {
    matches!(self, DataType::FloatVector { .. } | DataType::BinaryVector { .. })
  }

  pub fn is_string_like(&self) -> bool {
    matches!(self, DataType::String | DataType::VarChar)
  }

  pub fn code(&self) -> u8 {
    match self {
      DataType::Bool => 0,
      DataType::Int8 => 1,
      DataType::Int16 => 2,
      DataType::Int32 => 3,
      DataType::Int64 => 4,
      DataType::Float => 5,
      DataType::Double => 6,
      DataType::String => 7,
      DataType::VarChar => 8,
      DataType::FloatVector { .. } => 100,
      DataType::BinaryVector { .. } => 101,
    }
  }

  pub fn from_code(code: u8, dim: usize) -> NodeResult<DataType> {
    match code {
      0 => Ok(DataType::Bool),
      1 => Ok(DataType::Int8),
      2 => Ok(DataType::Int16),
      3 => Ok(DataType::Int32),
      4 => Ok(DataType::Int64),
      5 => Ok(DataType::Float),
      6 => Ok(DataType::Double),
      7 => Ok(DataType::String),
      8 => Ok(DataType::VarChar),
      100 => Ok(DataType::FloatVector { dim }),
      101 => Ok(DataType::BinaryVector { dim }),
      other => Err(NodeError::invalid(format!("unknown data type code {}", other))),
    }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldSchema {
  pub field_id: FieldId,
  pub name: String,
  pub data_type: DataType,
  pub is_primary_key: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionSchema {
  pub name: String,
  pub fields: Vec<FieldSchema>,
}

impl CollectionSchema {
  pub fn field(&self, field_id: FieldId) -> Option<&FieldSchema> {
    self.fields.iter().find(|f| f.field_id == field_id)
  }

  pub fn pk_field(&self) -> NodeResult<&FieldSchema> {
    self.fields
      .iter()
      .find(|f| f.is_primary_key)
      .ok_or_else(|| NodeError::invalid(format!(
        "collection schema {} declares no primary key field",
        self.name,
      )))
  }

  // user fields only; the reserved row-id and timestamp fields are appended
  // by the node, never carried in row payloads
  pub fn payload_fields(&self) -> impl Iterator<Item = &FieldSchema> {
    self.fields
      .iter()
      .filter(|f| f.field_id != ROW_ID_FIELD_ID && f.field_id != TIMESTAMP_FIELD_ID)
  }

  pub fn validate(&self) -> NodeResult<()> {
    for field in self.payload_fields() {
      if field.field_id < START_USER_FIELD_ID {
        return Err(NodeError::invalid(format!(
          "field {} uses reserved field id {}",
          field.name, field.field_id,
        )));
      }
    }
    let n_pk = self.fields.iter().filter(|f| f.is_primary_key).count();
    if n_pk > 1 {
      return Err(NodeError::invalid(format!(
        "collection schema {} declares {} primary key fields",
        self.name, n_pk,
      )));
    }
    if let Some(pk) = self.fields.iter().find(|f| f.is_primary_key) {
      let ok = matches!(pk.data_type, DataType::Int64) || pk.data_type.is_string_like();
      if !ok {
        return Err(NodeError::invalid(format!(
          "primary key field {} must be Int64 or string-typed",
          pk.name,
        )));
      }
    }
    Ok(())
  }

  // rows an insert buffer may hold within the byte budget; sized so that the
  // widest vector field fits, considering float and binary widths separately
  pub fn buffer_row_limit(&self, budget_bytes: u64) -> NodeResult<usize> {
    let mut limit = usize::MAX;
    for field in &self.fields {
      let width = match field.data_type {
        DataType::FloatVector { dim } => dim * 4,
        DataType::BinaryVector { dim } => (dim + 7) / 8,
        _ => continue,
      };
      if width == 0 {
        return Err(NodeError::invalid(format!(
          "vector field {} has zero dimension",
          field.name,
        )));
      }
      limit = limit.min((budget_bytes / width as u64) as usize);
    }
    if limit == usize::MAX {
      // scalar-only collection: fall back to the summed fixed widths
      let row_width: usize = self.fields
        .iter()
        .map(|f| f.data_type.fixed_width().unwrap_or(16))
        .sum();
      limit = (budget_bytes / row_width.max(1) as u64) as usize;
    }
    if limit == 0 {
      return Err(NodeError::invalid(
        "flush insert buffer size cannot hold a single row",
      ));
    }
    Ok(limit)
  }
}
