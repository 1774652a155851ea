use crate::types::FieldId;

// reserved per-row fields present in every collection schema
pub const ROW_ID_FIELD_ID: FieldId = 0;
pub const TIMESTAMP_FIELD_ID: FieldId = 1;
// user-declared fields start here
pub const START_USER_FIELD_ID: FieldId = 100;

// primary-key bloom filter sizing; the false positive target is loose enough
// that a filter for a full segment stays well under a megabyte
pub const BLOOM_EXPECTED_ITEMS: usize = 100_000;
pub const BLOOM_FP_RATE: f64 = 0.005;

// hybrid timestamps: physical millis in the high bits, a rolling logical
// counter in the low bits
pub const TS_LOGICAL_BITS: u32 = 18;
pub const TS_LOGICAL_MASK: u64 = (1 << TS_LOGICAL_BITS) - 1;

pub const INSERT_LOG_PREFIX: &str = "files/insert_log";
pub const STATS_LOG_PREFIX: &str = "files/stats_log";
pub const DELTA_LOG_PREFIX: &str = "files/delta_log";

pub const BINLOG_MAGIC: u32 = 0x534c_4201; // "SLB" + version tag
pub const DELTA_MAGIC: u32 = 0x534c_4401; // "SLD" + version tag

// emit one interval-latency log line per this many merged time ticks
pub const TICK_LATENCY_LOG_EVERY: u64 = 100;
