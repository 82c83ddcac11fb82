// src/io/traits.rs
//
// Write seam between the forwarder and the database client.

use async_trait::async_trait;

use crate::errors::ForwardError;
use crate::io::Reading;

/// A destination for decoded readings.
///
/// The production implementation writes InfluxDB line protocol over HTTP;
/// tests substitute recording or failure-injecting sinks.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Transmit one batch of readings. The whole batch is either accepted
    /// or rejected; no partial acknowledgment is assumed.
    async fn write_points(&self, points: &[Reading]) -> Result<(), ForwardError>;
}
