// src/io/serial/framer.rs
//
// Decoder for the sensor wire protocol: marker-delimited, length-declared,
// CRC-32-protected frames, each carrying one reading.

use tracing::debug;

use crate::checksums::crc32_ieee_checksum;
use crate::errors::FrameError;
use crate::io::Reading;

// =============================================================================
// Wire Protocol Constants
// =============================================================================

/// Start-of-frame marker, transmitted in this byte order.
pub const FRAME_MARKER: [u8; 2] = [0xAA, 0x55];

/// Bytes before the payload: marker (2) plus payload length (1).
pub const HEADER_LEN: usize = 3;

/// Trailing CRC-32, little-endian, computed over the length byte and payload.
pub const CRC_LEN: usize = 4;

/// Payload length of the reading layout: sensor id (1), sequence (4), value (8).
pub const READING_PAYLOAD_LEN: usize = 13;

/// Declared payload lengths above this are treated as corruption rather
/// than a large frame worth waiting for.
pub const MAX_PAYLOAD_LEN: usize = 64;

// =============================================================================
// Types
// =============================================================================

/// One decode outcome: a reading, or a recoverable frame-level error.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    Reading(Reading),
    Error(FrameError),
}

/// Stateful decoder for the sensor byte stream.
///
/// Bytes go in through `feed` in whatever chunking the serial link happens
/// to produce; readings and frame errors come out in stream order,
/// independent of chunk boundaries. The decoder owns all partial-frame
/// state, so the caller resets it whenever the underlying connection is
/// replaced.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// A run of garbage bytes is in progress; one BadMarker per run.
    garbage_run: bool,
    /// The current run trails an already-reported bad frame and is
    /// discarded without a second error.
    quiet_run: bool,
    /// Garbage bytes discarded since construction or reset.
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buffer: Vec::new(),
            garbage_run: false,
            quiet_run: false,
            discarded: 0,
        }
    }

    /// Drop buffered bytes and resynchronization state. Call on reconnect:
    /// a new device starts mid-stream and the old partial frame is void.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.garbage_run = false;
        self.quiet_run = false;
        self.discarded = 0;
    }

    /// Bytes currently buffered awaiting frame completion.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Garbage bytes discarded since construction or reset.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Consume a chunk of link bytes, returning all events it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            let pos = match self.find_marker() {
                Some(pos) => pos,
                None => {
                    // No marker anywhere. Discard everything scanned, but
                    // keep one trailing byte of lookback in case the buffer
                    // ends on the first half of a split marker.
                    let keep = usize::from(self.buffer.last() == Some(&FRAME_MARKER[0]));
                    let scanned = self.buffer.len() - keep;
                    if scanned > 0 {
                        self.discard_garbage(scanned, &mut events);
                    }
                    break;
                }
            };

            if pos > 0 {
                self.discard_garbage(pos, &mut events);
            }
            // Marker at the buffer head: any garbage run is over.
            self.garbage_run = false;
            self.quiet_run = false;

            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let payload_len = self.buffer[2] as usize;
            if payload_len > MAX_PAYLOAD_LEN {
                debug!(
                    "rejecting frame header {:02X?}, declared payload {payload_len}",
                    &self.buffer[..HEADER_LEN]
                );
                events.push(FrameEvent::Error(FrameError::LengthOutOfRange {
                    length: payload_len,
                    max: MAX_PAYLOAD_LEN,
                }));
                self.resync_past_marker();
                continue;
            }

            let total = HEADER_LEN + payload_len + CRC_LEN;
            if self.buffer.len() < total {
                // Frame still arriving. Marker-valued bytes inside the
                // declared extent are payload, not a new frame start, so
                // no rescan happens until the frame completes or is
                // rejected.
                break;
            }

            let body = &self.buffer[2..HEADER_LEN + payload_len];
            let calculated = crc32_ieee_checksum(body);
            let received = u32::from_le_bytes([
                self.buffer[total - 4],
                self.buffer[total - 3],
                self.buffer[total - 2],
                self.buffer[total - 1],
            ]);

            if calculated != received {
                debug!(
                    "rejecting corrupt {total} byte frame: {:02X?}",
                    &self.buffer[..total]
                );
                events.push(FrameEvent::Error(FrameError::IntegrityCheckFailed {
                    calculated,
                    received,
                }));
                self.resync_past_marker();
                continue;
            }

            if payload_len != READING_PAYLOAD_LEN {
                // Checksum verified, so the declared extent is trustworthy:
                // skip the whole frame, not just the marker.
                debug!(
                    "skipping {total} byte frame with unknown layout: {:02X?}",
                    &self.buffer[..total]
                );
                events.push(FrameEvent::Error(FrameError::UnknownFieldLayout {
                    length: payload_len,
                }));
                self.buffer.drain(..total);
                continue;
            }

            let payload = &self.buffer[HEADER_LEN..HEADER_LEN + READING_PAYLOAD_LEN];
            events.push(FrameEvent::Reading(decode_reading(payload)));
            self.buffer.drain(..total);
        }

        events
    }

    fn find_marker(&self) -> Option<usize> {
        self.buffer
            .windows(FRAME_MARKER.len())
            .position(|w| w == FRAME_MARKER)
    }

    /// Drop a rejected frame's marker and rescan from the byte after it.
    /// The bytes that follow belong to the frame just reported, so the
    /// garbage run they form stays quiet.
    fn resync_past_marker(&mut self) {
        self.buffer.drain(..FRAME_MARKER.len());
        self.garbage_run = false;
        self.quiet_run = true;
    }

    fn discard_garbage(&mut self, count: usize, events: &mut Vec<FrameEvent>) {
        // Garbage runs are unbounded; log a bounded prefix.
        const PREVIEW: usize = 16;
        if !self.garbage_run {
            self.garbage_run = true;
            if !self.quiet_run {
                events.push(FrameEvent::Error(FrameError::BadMarker));
            }
        }
        debug!(
            "discarding {count} unframed bytes, head {:02X?}",
            &self.buffer[..count.min(PREVIEW)]
        );
        self.discarded += count as u64;
        self.buffer.drain(..count);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

/// Decode the 13-byte reading payload. Caller guarantees the length.
fn decode_reading(payload: &[u8]) -> Reading {
    let sensor_id = payload[0];
    let mut sequence_bytes = [0u8; 4];
    sequence_bytes.copy_from_slice(&payload[1..5]);
    let mut value_bytes = [0u8; 8];
    value_bytes.copy_from_slice(&payload[5..13]);
    Reading::with_value(
        sensor_id,
        u32::from_le_bytes(sequence_bytes),
        f64::from_le_bytes(value_bytes),
    )
}

/// Encode a reading frame (for loopback tests and simulators)
#[allow(dead_code)]
pub fn encode_reading(sensor_id: u8, sequence: u32, value: f64) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + READING_PAYLOAD_LEN);
    body.push(READING_PAYLOAD_LEN as u8);
    body.push(sensor_id);
    body.extend_from_slice(&sequence.to_le_bytes());
    body.extend_from_slice(&value.to_le_bytes());
    let crc = crc32_ieee_checksum(&body);

    let mut frame = Vec::with_capacity(HEADER_LEN + READING_PAYLOAD_LEN + CRC_LEN);
    frame.extend_from_slice(&FRAME_MARKER);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

// =============================================================================
// Tests
// =============================================================================
