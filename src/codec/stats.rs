use bloomfilter::Bloom;
use serde::{Deserialize, Serialize};

use crate::constants::{BLOOM_EXPECTED_ITEMS, BLOOM_FP_RATE};
use crate::errors::{NodeError, NodeResult};
use crate::types::{FieldId, PkValue};

// every filter the node builds uses this seed, so filters written at
// different times share SIP keys and stay unionable
const BLOOM_SEED: [u8; 32] = *b"siltdb-datanode-pk-bloom-seed-01";

// conservative primary-key membership filter; no false negatives
pub struct PkFilter {
  bloom: Bloom<[u8]>,
}

impl PkFilter {
  pub fn new() -> PkFilter {
    let bitmap_size = Bloom::<[u8]>::compute_bitmap_size(BLOOM_EXPECTED_ITEMS, BLOOM_FP_RATE);
    PkFilter {
      bloom: Bloom::new_with_seed(bitmap_size, BLOOM_EXPECTED_ITEMS, &BLOOM_SEED),
    }
  }

  pub fn insert(&mut self, pk: &PkValue) {
    self.bloom.set(&pk.as_bytes());
  }

  pub fn contains(&self, pk: &PkValue) -> bool {
    self.bloom.check(&pk.as_bytes())
  }

  // pure union; filters built with different parameters must fail loudly
  // rather than be approximated
  pub fn union(&mut self, other: &PkFilter) -> NodeResult<()> {
    if self.bloom.number_of_bits() != other.bloom.number_of_bits()
      || self.bloom.number_of_hash_functions() != other.bloom.number_of_hash_functions()
      || self.bloom.sip_keys() != other.bloom.sip_keys()
    {
      return Err(NodeError::invalid(format!(
        "cannot union bloom filters with mismatched parameters ({} bits/{} hashes vs {} bits/{} hashes)",
        self.bloom.number_of_bits(),
        self.bloom.number_of_hash_functions(),
        other.bloom.number_of_bits(),
        other.bloom.number_of_hash_functions(),
      )));
    }
    let mut bitmap = self.bloom.bitmap();
    let other_bitmap = other.bloom.bitmap();
    for (byte, other_byte) in bitmap.iter_mut().zip(other_bitmap.iter()) {
      *byte |= other_byte;
    }
    self.bloom = Bloom::from_existing(
      &bitmap,
      self.bloom.number_of_bits(),
      self.bloom.number_of_hash_functions(),
      self.bloom.sip_keys(),
    );
    Ok(())
  }
}

impl Default for PkFilter {
  fn default() -> Self {
    Self::new()
  }
}

impl Clone for PkFilter {
  fn clone(&self) -> Self {
    PkFilter {
      bloom: Bloom::from_existing(
        &self.bloom.bitmap(),
        self.bloom.number_of_bits(),
        self.bloom.number_of_hash_functions(),
        self.bloom.sip_keys(),
      ),
    }
  }
}

// min/max primary key range plus the membership filter; one per segment
pub struct PkStatistics {
  pub field_id: FieldId,
  pub min: Option<PkValue>,
  pub max: Option<PkValue>,
  pub filter: PkFilter,
}

impl PkStatistics {
  pub fn new(field_id: FieldId) -> PkStatistics {
    PkStatistics {
      field_id,
      min: None,
      max: None,
      filter: PkFilter::new(),
    }
  }

  pub fn update(&mut self, pk: &PkValue) {
    self.filter.insert(pk);
    match &self.min {
      Some(min) if min <= pk => {}
      _ => self.min = Some(pk.clone()),
    }
    match &self.max {
      Some(max) if max >= pk => {}
      _ => self.max = Some(pk.clone()),
    }
  }

  pub fn update_batch(&mut self, pks: &[PkValue]) {
    for pk in pks {
      self.update(pk);
    }
  }

  pub fn merge(&mut self, other: &PkStatistics) -> NodeResult<()> {
    if self.field_id != other.field_id {
      return Err(NodeError::invalid(format!(
        "cannot merge statistics of field {} into field {}",
        other.field_id, self.field_id,
      )));
    }
    self.filter.union(&other.filter)?;
    if let Some(min) = &other.min {
      match &self.min {
        Some(cur) if cur <= min => {}
        _ => self.min = Some(min.clone()),
      }
    }
    if let Some(max) = &other.max {
      match &self.max {
        Some(cur) if cur >= max => {}
        _ => self.max = Some(max.clone()),
      }
    }
    Ok(())
  }
}

impl Clone for PkStatistics {
  fn clone(&self) -> Self {
    PkStatistics {
      field_id: self.field_id,
      min: self.min.clone(),
      max: self.max.clone(),
      filter: self.filter.clone(),
    }
  }
}

// wire envelope; filter parameters are explicit so a decoder can reconstruct
// the exact same filter
#[derive(Serialize, Deserialize)]
struct StatsEnvelope {
  field_id: FieldId,
  min: Option<PkValue>,
  max: Option<PkValue>,
  bloom_bitmap: String,
  bloom_bits: u64,
  bloom_hashes: u32,
  bloom_sip_keys: [(u64, u64); 2],
}

pub fn encode_stats_log(stats: &PkStatistics) -> NodeResult<Vec<u8>> {
  let envelope = StatsEnvelope {
    field_id: stats.field_id,
    min: stats.min.clone(),
    max: stats.max.clone(),
    bloom_bitmap: base64::encode(stats.filter.bloom.bitmap()),
    bloom_bits: stats.filter.bloom.number_of_bits(),
    bloom_hashes: stats.filter.bloom.number_of_hash_functions(),
    bloom_sip_keys: stats.filter.bloom.sip_keys(),
  };
  Ok(serde_json::to_vec(&envelope)?)
}

pub fn decode_stats_log(bytes: &[u8]) -> NodeResult<PkStatistics> {
  let envelope: StatsEnvelope = serde_json::from_slice(bytes)?;
  let bitmap = base64::decode(&envelope.bloom_bitmap)
    .map_err(|e| NodeError::invalid(format!("stats log bitmap is not base64: {}", e)))?;
  let bloom = Bloom::from_existing(
    &bitmap,
    envelope.bloom_bits,
    envelope.bloom_hashes,
    envelope.bloom_sip_keys,
  );
  Ok(PkStatistics {
    field_id: envelope.field_id,
    min: envelope.min,
    max: envelope.max,
    filter: PkFilter { bloom },
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_no_false_negatives() {
    let mut stats = PkStatistics::new(100);
    for i in 0..1000 {
      stats.update(&PkValue::Int(i));
    }
    for i in 0..1000 {
      assert!(stats.filter.contains(&PkValue::Int(i)));
    }
    assert_eq!(stats.min, Some(PkValue::Int(0)));
    assert_eq!(stats.max, Some(PkValue::Int(999)));
  }

  #[test]
  fn test_stats_log_roundtrip_preserves_membership() {
    let mut stats = PkStatistics::new(100);
    stats.update(&PkValue::Int(3));
    stats.update(&PkValue::Int(16));

    let bytes = encode_stats_log(&stats).unwrap();
    let decoded = decode_stats_log(&bytes).unwrap();
    assert_eq!(decoded.field_id, 100);
    assert_eq!(decoded.min, Some(PkValue::Int(3)));
    assert_eq!(decoded.max, Some(PkValue::Int(16)));
    assert!(decoded.filter.contains(&PkValue::Int(3)));
    assert!(decoded.filter.contains(&PkValue::Int(16)));
  }

  #[test]
  fn test_merge_unions_membership_and_range() {
    let mut a = PkStatistics::new(100);
    a.update(&PkValue::Int(1));
    let mut b = PkStatistics::new(100);
    b.update(&PkValue::Int(50));

    a.merge(&b).unwrap();
    assert!(a.filter.contains(&PkValue::Int(1)));
    assert!(a.filter.contains(&PkValue::Int(50)));
    assert_eq!(a.min, Some(PkValue::Int(1)));
    assert_eq!(a.max, Some(PkValue::Int(50)));
  }

  #[test]
  fn test_union_rejects_mismatched_parameters() {
    let a = PkFilter::new();
    let mismatched = Bloom::from_existing(
      &vec![0u8; 16],
      128,
      3,
      a.bloom.sip_keys(),
    );
    let mut target = PkFilter::new();
    assert!(target.union(&PkFilter { bloom: mismatched }).is_err());
  }
}
