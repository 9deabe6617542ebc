use chrono::{DateTime, Utc};

use crate::error::{PbfError, Result};
use crate::proto::osmformat::PrimitiveBlock;

pub(crate) const NANOS_PER_DEGREE: f64 = 1e9;

/// Per-block decoding state: the coordinate/date granularities and the
/// materialized string table. Decoded once per primitive block and shared by
/// every group in it.
pub struct FieldCodec {
    date_granularity: i32,
    granularity: i32,
    lat_offset: i64,
    lon_offset: i64,
    string_table: Vec<String>,
}

impl FieldCodec {
    /// Codec with the given granularities, zero offsets and an empty string
    /// table. This is the encode-side configuration.
    pub fn new(granularity: i32, date_granularity: i32) -> Self {
        Self {
            date_granularity,
            granularity,
            lat_offset: 0,
            lon_offset: 0,
            string_table: Vec::new(),
        }
    }

    pub fn new_with_block(block: &PrimitiveBlock) -> Self {
        let string_table = block
            .get_stringtable()
            .get_s()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect();
        Self {
            date_granularity: block.get_date_granularity(),
            granularity: block.get_granularity(),
            lat_offset: block.get_lat_offset(),
            lon_offset: block.get_lon_offset(),
            string_table,
        }
    }

    pub fn decode_latitude(&self, raw: i64) -> f64 {
        (self.lat_offset + self.granularity as i64 * raw) as f64 / NANOS_PER_DEGREE
    }

    pub fn encode_latitude(&self, degrees: f64) -> i64 {
        ((degrees * NANOS_PER_DEGREE).round() as i64 - self.lat_offset) / self.granularity as i64
    }

    pub fn decode_longitude(&self, raw: i64) -> f64 {
        (self.lon_offset + self.granularity as i64 * raw) as f64 / NANOS_PER_DEGREE
    }

    pub fn encode_longitude(&self, degrees: f64) -> i64 {
        ((degrees * NANOS_PER_DEGREE).round() as i64 - self.lon_offset) / self.granularity as i64
    }

    pub fn decode_timestamp(&self, raw: i64) -> Result<DateTime<Utc>> {
        let millis = (self.date_granularity as i64).checked_mul(raw).ok_or_else(|| {
            PbfError::MalformedBlock(format!("timestamp {} overflows the date granularity", raw))
        })?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| PbfError::MalformedBlock(format!("timestamp {} is out of range", millis)))
    }

    pub fn encode_timestamp(&self, time: DateTime<Utc>) -> i64 {
        time.timestamp_millis() / self.date_granularity as i64
    }

    /// Resolves a string table index. An index outside the table is a fatal
    /// block error.
    pub fn string_at(&self, index: usize) -> Result<&str> {
        self.string_table
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                PbfError::MalformedBlock(format!(
                    "string index {} outside table of {} entries",
                    index,
                    self.string_table.len()
                ))
            })
    }
}
