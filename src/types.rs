use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::constants::{TS_LOGICAL_BITS, TS_LOGICAL_MASK};

pub type CollectionId = i64;
pub type PartitionId = i64;
pub type SegmentId = i64;
pub type FieldId = i64;
pub type PlanId = i64;

// 64-bit hybrid timestamp; physical millis << TS_LOGICAL_BITS | logical
pub type Timestamp = u64;

pub fn compose_ts(physical_ms: i64, logical: u64) -> Timestamp {
  ((physical_ms as u64) << TS_LOGICAL_BITS) | (logical & TS_LOGICAL_MASK)
}

pub fn parse_ts(ts: Timestamp) -> (i64, u64) {
  ((ts >> TS_LOGICAL_BITS) as i64, ts & TS_LOGICAL_MASK)
}

pub fn physical_ts(ts: Timestamp) -> i64 {
  parse_ts(ts).0
}

// a position on one virtual channel's message stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
  pub channel: String,
  pub msg_id: Vec<u8>,
  pub timestamp: Timestamp,
}

impl StreamPosition {
  pub fn new(channel: impl Into<String>, msg_id: Vec<u8>, timestamp: Timestamp) -> Self {
    StreamPosition {
      channel: channel.into(),
      msg_id,
      timestamp,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
  New,
  Growing,
  Flushed,
  Dropped,
}

impl Display for SegmentState {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let s = match self {
      SegmentState::New => "new",
      SegmentState::Growing => "growing",
      SegmentState::Flushed => "flushed",
      SegmentState::Dropped => "dropped",
    };
    write!(f, "{}", s)
  }
}

// primary keys are either Int64 or string-typed; everything that routes or
// dedupes rows goes through this value
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PkValue {
  Int(i64),
  Str(String),
}

impl PkValue {
  // stable byte view for hashing into the bloom filter
  pub fn as_bytes(&self) -> Vec<u8> {
    match self {
      PkValue::Int(v) => v.to_le_bytes().to_vec(),
      PkValue::Str(v) => v.as_bytes().to_vec(),
    }
  }
}

impl Display for PkValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      PkValue::Int(v) => write!(f, "{}", v),
      PkValue::Str(v) => write!(f, "{}", v),
    }
  }
}
