// src/settings.rs
//
// TOML configuration with per-field defaults. A missing file means
// all-defaults; a malformed file is a startup error.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::io::serial::utils::Parity;

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SerialSettings {
    /// Explicit device path, tried before any discovered candidate
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_device_prefixes")]
    pub device_prefixes: Vec<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity, // "none" | "odd" | "even"
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Bytes that must arrive during the probe before a port is trusted
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Reopen attempts on the same path before falling back to a search
    #[serde(default = "default_degraded_retries")]
    pub degraded_retries: u32,
    #[serde(default = "default_degraded_delay_ms")]
    pub degraded_delay_ms: u64,
    #[serde(default = "default_search_backoff_min_ms")]
    pub search_backoff_min_ms: u64,
    #[serde(default = "default_search_backoff_max_ms")]
    pub search_backoff_max_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_age_ms")]
    pub batch_age_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_min_ms")]
    pub retry_backoff_min_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BridgeSettings {
    /// Ceiling on the final batch flush during shutdown
    #[serde(default = "default_shutdown_flush_timeout_ms")]
    pub shutdown_flush_timeout_ms: u64,
}

fn default_device_prefixes() -> Vec<String> {
    vec!["/dev/ttyUSB".to_string(), "/dev/ttyACM".to_string()]
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_probe_bytes() -> usize {
    4
}
fn default_probe_timeout_ms() -> u64 {
    4000
}
fn default_read_timeout_ms() -> u64 {
    200
}
fn default_degraded_retries() -> u32 {
    3
}
fn default_degraded_delay_ms() -> u64 {
    250
}
fn default_search_backoff_min_ms() -> u64 {
    500
}
fn default_search_backoff_max_ms() -> u64 {
    10_000
}
fn default_url() -> String {
    "http://localhost:8086".to_string()
}
fn default_database() -> String {
    "telemetry".to_string()
}
fn default_measurement() -> String {
    "telemetry".to_string()
}
fn default_queue_capacity() -> usize {
    100
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_age_ms() -> u64 {
    1000
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_backoff_min_ms() -> u64 {
    500
}
fn default_retry_backoff_max_ms() -> u64 {
    10_000
}
fn default_shutdown_flush_timeout_ms() -> u64 {
    5000
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: None,
            device_prefixes: default_device_prefixes(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            probe_bytes: default_probe_bytes(),
            probe_timeout_ms: default_probe_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            degraded_retries: default_degraded_retries(),
            degraded_delay_ms: default_degraded_delay_ms(),
            search_backoff_min_ms: default_search_backoff_min_ms(),
            search_backoff_max_ms: default_search_backoff_max_ms(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: default_database(),
            measurement: default_measurement(),
            username: String::new(),
            password: String::new(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            batch_age_ms: default_batch_age_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_min_ms: default_retry_backoff_min_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            shutdown_flush_timeout_ms: default_shutdown_flush_timeout_ms(),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from a TOML file. An absent file is not an error;
    /// the bridge runs on defaults.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        if !path.exists() {
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the invariants a running bridge depends on. Called once at
    /// startup, after CLI overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let no_device = self.serial.device.as_deref().unwrap_or("").is_empty();
        if no_device && self.serial.device_prefixes.is_empty() {
            return Err(ConfigError::NoCandidateDevices);
        }

        match reqwest::Url::parse(&self.database.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
            Ok(url) => Err(ConfigError::InvalidEndpoint {
                url: self.database.url.clone(),
                reason: format!("unsupported scheme {:?}", url.scheme()),
            }),
            Err(e) => Err(ConfigError::InvalidEndpoint {
                url: self.database.url.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.serial.data_bits, 8);
        assert_eq!(settings.serial.parity, Parity::None);
        assert_eq!(settings.serial.probe_bytes, 4);
        assert_eq!(
            settings.serial.device_prefixes,
            vec!["/dev/ttyUSB".to_string(), "/dev/ttyACM".to_string()]
        );
        assert_eq!(settings.database.url, "http://localhost:8086");
        assert_eq!(settings.database.queue_capacity, 100);
        assert_eq!(settings.database.batch_size, 100);
        assert_eq!(settings.database.retry_attempts, 5);
        assert_eq!(settings.bridge.shutdown_flush_timeout_ms, 5000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [serial]
            device = "/dev/ttyUSB3"
            baud_rate = 9600
            parity = "even"

            [database]
            url = "https://influx.example.net:8086"
            batch_age_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(settings.serial.device.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(settings.serial.baud_rate, 9600);
        assert_eq!(settings.serial.parity, Parity::Even);
        assert_eq!(settings.serial.stop_bits, 1);
        assert_eq!(settings.database.url, "https://influx.example.net:8086");
        assert_eq!(settings.database.batch_age_ms, 250);
        assert_eq!(settings.database.measurement, "telemetry");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_a_candidate_source() {
        let mut settings = Settings::default();
        settings.serial.device = None;
        settings.serial.device_prefixes.clear();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::NoCandidateDevices)
        ));

        // An explicit device alone is enough.
        settings.serial.device = Some("/dev/ttyACM0".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let mut settings = Settings::default();
        settings.database.url = "not a url".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        settings.database.url = "ftp://influx.example.net".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/telebridge.toml")).unwrap();
        assert_eq!(settings.serial.baud_rate, 115_200);
        assert_eq!(settings.database.database, "telemetry");
    }
}
