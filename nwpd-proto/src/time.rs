//! Conversions between protobuf well-known time types and chrono / std

use chrono::{DateTime, Utc};

pub fn to_timestamp(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

/// Out of range timestamps map to the epoch
pub fn from_timestamp(ts: &prost_types::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32).unwrap_or_default()
}

pub fn to_proto_duration(d: std::time::Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Negative durations clamp to zero
pub fn from_proto_duration(d: &prost_types::Duration) -> std::time::Duration {
    if d.seconds < 0 || (d.seconds == 0 && d.nanos < 0) {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::new(d.seconds as u64, d.nanos.max(0) as u32)
}
