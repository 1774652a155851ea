pub mod delete;
pub mod field_data;
pub mod insert;
pub mod stats;

use std::convert::TryInto;

use crate::errors::{NodeError, NodeResult};

// little-endian cursor shared by the row-payload and binlog decoders
pub struct ByteReader<'a> {
  bytes: &'a [u8],
  i: usize,
}

impl<'a> ByteReader<'a> {
  pub fn new(bytes: &'a [u8]) -> Self {
    ByteReader { bytes, i: 0 }
  }

  pub fn complete(&self) -> bool {
    self.i >= self.bytes.len()
  }

  pub fn remaining(&self) -> usize {
    self.bytes.len() - self.i
  }

  pub fn read_n(&mut self, n: usize) -> NodeResult<&'a [u8]> {
    if self.i + n > self.bytes.len() {
      return Err(NodeError::invalid(format!(
        "unexpected end of payload; wanted {} bytes, {} remain",
        n,
        self.bytes.len() - self.i,
      )));
    }
    let res = &self.bytes[self.i..self.i + n];
    self.i += n;
    Ok(res)
  }

  pub fn read_u8(&mut self) -> NodeResult<u8> {
    Ok(self.read_n(1)?[0])
  }

  pub fn read_u32(&mut self) -> NodeResult<u32> {
    Ok(u32::from_le_bytes(self.read_n(4)?.try_into().unwrap()))
  }

  pub fn read_u64(&mut self) -> NodeResult<u64> {
    Ok(u64::from_le_bytes(self.read_n(8)?.try_into().unwrap()))
  }

  pub fn read_i64(&mut self) -> NodeResult<i64> {
    Ok(i64::from_le_bytes(self.read_n(8)?.try_into().unwrap()))
  }

  pub fn read_string(&mut self) -> NodeResult<String> {
    let len = self.read_u32()? as usize;
    let bytes = self.read_n(len)?;
    String::from_utf8(bytes.to_vec())
      .map_err(|e| NodeError::invalid(format!("string value is not utf-8: {}", e)))
  }
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
  out.extend_from_slice(&(s.len() as u32).to_le_bytes());
  out.extend_from_slice(s.as_bytes());
}
