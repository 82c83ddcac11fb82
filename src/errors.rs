// src/errors.rs
//
// Error taxonomy for the bridge. Only ConfigError halts the process, and
// only at startup; every other kind is handled where it occurs, counted,
// and logged.

use std::path::PathBuf;

use thiserror::Error;

/// Frame-level decode failures. Always recoverable: the decoder resyncs and
/// keeps parsing, the caller counts and logs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Bytes had to be discarded before a start marker was found.
    #[error("no frame marker found, garbage bytes discarded")]
    BadMarker,

    /// Declared payload length exceeds the protocol maximum.
    #[error("declared payload length {length} exceeds maximum {max}")]
    LengthOutOfRange { length: usize, max: usize },

    /// CRC mismatch over the frame body.
    #[error("integrity check failed: calculated {calculated:#010X}, frame carried {received:#010X}")]
    IntegrityCheckFailed { calculated: u32, received: u32 },

    /// CRC verified but the payload length matches no known field layout.
    #[error("unknown field layout with {length}-byte payload")]
    UnknownFieldLayout { length: usize },
}

/// Serial link failures. Consumed entirely by the link state machine; none
/// of these ever propagates as fatal.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Enumeration produced no candidate device path.
    #[error("no candidate serial device present")]
    DeviceNotFound,

    /// The OS refused to open the device.
    #[error("failed to open {device}")]
    OpenFailed {
        device: String,
        #[source]
        source: serialport::Error,
    },

    /// The device opened but produced no bytes within the probe window.
    #[error("{device} produced no data within the probe window")]
    ReadTimeout { device: String },

    /// End-of-stream or a hard read error on an open device.
    #[error("{device} closed unexpectedly")]
    UnexpectedClose { device: String },
}

/// Database write failures. Retried with backoff up to the configured
/// bound; past the bound the batch is dropped and counted.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Could not reach the database endpoint.
    #[error("connection refused: {detail}")]
    ConnectionRefused { detail: String },

    /// The write request timed out.
    #[error("write timed out after {timeout_ms} ms")]
    WriteTimeout { timeout_ms: u64 },

    /// The database answered with a non-success status.
    #[error("database rejected write: HTTP {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    /// The submit queue is at capacity.
    #[error("submit queue full, reading dropped")]
    QueueOverflow,
}

/// Startup configuration failures. The only fatal error kind.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no serial device configured and no device prefixes to scan")]
    NoCandidateDevices,

    #[error("invalid database endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
