// src/io/influx/writer.rs
//
// InfluxDB 1.x line-protocol client over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::errors::ForwardError;
use crate::io::traits::PointSink;
use crate::io::Reading;
use crate::settings::DatabaseSettings;

// ============================================================================
// Line Protocol
// ============================================================================

/// Escape a measurement name. Line protocol delimits the measurement with
/// `,` and space; `=` is literal in this position.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape a tag or field key, where `=` also delimits.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

/// Render one reading as a line-protocol line:
/// `<measurement>,sensor_id=<id> sequence=<n>i,<field>=<value>,... <timestamp_us>`
fn render_line(measurement: &str, reading: &Reading) -> String {
    let mut fields = format!("sequence={}i", reading.sequence);
    for (key, value) in &reading.fields {
        fields.push_str(&format!(",{}={}", escape_key(key), value));
    }
    format!(
        "{},sensor_id={} {} {}",
        escape_measurement(measurement),
        reading.sensor_id,
        fields,
        reading.timestamp_us
    )
}

// ============================================================================
// Writer
// ============================================================================

/// HTTP client for the InfluxDB 1.x write API. Stateless between calls;
/// connection reuse is the client pool's business.
pub struct InfluxWriter {
    client: Client,
    write_url: String,
    ping_url: String,
    settings: DatabaseSettings,
}

impl InfluxWriter {
    pub fn new(settings: DatabaseSettings) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.write_timeout_ms))
            .build()
            .map_err(|e| ForwardError::ConnectionRefused {
                detail: format!("failed to create HTTP client: {e}"),
            })?;
        let base = settings.url.trim_end_matches('/').to_string();
        Ok(InfluxWriter {
            client,
            write_url: format!("{base}/write"),
            ping_url: format!("{base}/ping"),
            settings,
        })
    }

    /// Startup reachability check. Logged, never fatal: the bridge starts
    /// and queues data even while the database is down.
    pub async fn ping(&self) {
        match self.client.get(&self.ping_url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("database reachable at {}", self.settings.url);
            }
            Ok(response) => {
                warn!(
                    "database ping returned HTTP {}",
                    response.status().as_u16()
                );
            }
            Err(e) => {
                warn!("database unreachable at {}: {e}", self.settings.url);
            }
        }
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write_points(&self, points: &[Reading]) -> Result<(), ForwardError> {
        if points.is_empty() {
            return Ok(());
        }

        let body = points
            .iter()
            .map(|r| render_line(&self.settings.measurement, r))
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.settings.database.as_str()), ("precision", "u")]);
        if !self.settings.username.is_empty() {
            request = request.query(&[
                ("u", self.settings.username.as_str()),
                ("p", self.settings.password.as_str()),
            ]);
        }

        let response = request.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::WriteTimeout {
                    timeout_ms: self.settings.write_timeout_ms,
                }
            } else {
                ForwardError::ConnectionRefused {
                    detail: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ForwardError::RemoteRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn reading(sensor_id: u8, sequence: u32, value: f64, timestamp_us: u64) -> Reading {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), value);
        Reading {
            sensor_id,
            sequence,
            timestamp_us,
            fields,
        }
    }

    #[test]
    fn test_render_line_basic() {
        let line = render_line("telemetry", &reading(1, 1, 36.6, 1_700_000_000_000_000));
        assert_eq!(
            line,
            "telemetry,sensor_id=1 sequence=1i,value=36.6 1700000000000000"
        );
    }

    #[test]
    fn test_render_line_integral_value() {
        let line = render_line("telemetry", &reading(2, 2, 98.0, 1_700_000_000_000_001));
        assert_eq!(
            line,
            "telemetry,sensor_id=2 sequence=2i,value=98 1700000000000001"
        );
    }

    #[test]
    fn test_render_line_sorts_fields_by_key() {
        let mut r = reading(7, 3, 36.6, 42);
        r.fields.insert("humidity".to_string(), 40.5);
        let line = render_line("telemetry", &r);
        assert_eq!(
            line,
            "telemetry,sensor_id=7 sequence=3i,humidity=40.5,value=36.6 42"
        );
    }

    #[test]
    fn test_render_line_escapes_measurement() {
        let line = render_line("door sensor,raw", &reading(1, 1, 1.0, 1));
        assert!(line.starts_with("door\\ sensor\\,raw,sensor_id=1 "));
    }

    #[test]
    fn test_measurement_equals_stays_literal() {
        // `=` only delimits keys from values; in the measurement position
        // it must pass through unescaped.
        let mut r = reading(1, 1, 1.0, 1);
        r.fields.insert("t=c".to_string(), 2.5);
        let line = render_line("temp=lab", &r);
        assert_eq!(line, "temp=lab,sensor_id=1 sequence=1i,t\\=c=2.5,value=1 1");
    }

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let settings = DatabaseSettings {
            url: "http://influx.example.net:8086/".to_string(),
            ..DatabaseSettings::default()
        };
        let writer = InfluxWriter::new(settings).unwrap();
        assert_eq!(writer.write_url, "http://influx.example.net:8086/write");
        assert_eq!(writer.ping_url, "http://influx.example.net:8086/ping");
    }
}
