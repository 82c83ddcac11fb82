// src/io/mod.rs
//
// I/O subsystems of the bridge: the serial side that produces readings
// and the database side that consumes them.

pub mod influx; // InfluxDB HTTP writer and batching forwarder
pub mod serial; // serial link manager and frame decoder
pub mod traits; // write seam between forwarder and database client

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared Types
// ============================================================================

/// One decoded sensor measurement, the unit of data flowing from the
/// decoder to the database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Which sensor produced the measurement.
    pub sensor_id: u8,
    /// Frame sequence counter carried on the wire.
    pub sequence: u32,
    /// Host arrival timestamp, microseconds since the UNIX epoch.
    pub timestamp_us: u64,
    /// Field values keyed by field name.
    pub fields: BTreeMap<String, f64>,
}

impl Reading {
    /// Build a reading holding a single `value` field, stamped with the
    /// current arrival time.
    pub fn with_value(sensor_id: u8, sequence: u32, value: f64) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), value);
        Reading {
            sensor_id,
            sequence,
            timestamp_us: now_us(),
            fields,
        }
    }
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
