// src/bridge.rs
//
// Orchestration between the serial link, the frame decoder and the
// forwarder: every byte the link produces goes through the decoder once,
// decoded readings are queued for the database, and a reconnect restarts
// decoding from a clean buffer.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::io::influx::Forwarder;
use crate::io::serial::{FrameDecoder, FrameEvent, LinkEvent, SerialLinkManager};

pub struct Bridge {
    decoder: FrameDecoder,
    forwarder: Forwarder,
    frames_decoded: u64,
    frame_errors: u64,
    readings_dropped: u64,
}

impl Bridge {
    pub fn new(forwarder: Forwarder) -> Bridge {
        Bridge {
            decoder: FrameDecoder::new(),
            forwarder,
            frames_decoded: 0,
            frame_errors: 0,
            readings_dropped: 0,
        }
    }

    /// Drive the bridge until the link closes, then drain the forwarder.
    /// Returns the (written, dropped) totals from the forwarder.
    pub async fn run(mut self, mut link: SerialLinkManager, flush_timeout: Duration) -> (u64, u64) {
        while let Some(event) = link.next_event().await {
            self.handle_event(event);
        }
        info!("link closed, draining forwarder");
        self.finish(flush_timeout).await
    }

    /// Apply one link event to the decoder and forwarder.
    pub fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { device } => {
                let stale = self.decoder.pending();
                if stale > 0 {
                    debug!("discarding {stale} buffered bytes from the previous link");
                }
                self.decoder.reset();
                info!("decoding restarted for {device}");
            }
            LinkEvent::Data(bytes) => {
                for frame_event in self.decoder.feed(&bytes) {
                    match frame_event {
                        FrameEvent::Reading(reading) => {
                            self.frames_decoded += 1;
                            if let Err(err) = self.forwarder.submit(reading) {
                                self.readings_dropped += 1;
                                warn!("{err} ({} dropped so far)", self.readings_dropped);
                            }
                        }
                        FrameEvent::Error(err) => {
                            self.frame_errors += 1;
                            warn!("frame error #{}: {err}", self.frame_errors);
                        }
                    }
                }
            }
        }
    }

    /// Log the session summary and drain the forwarder.
    pub async fn finish(self, flush_timeout: Duration) -> (u64, u64) {
        info!(
            "bridge stopping: {} frames decoded, {} frame errors, {} readings dropped at submit, {} garbage bytes discarded",
            self.frames_decoded,
            self.frame_errors,
            self.readings_dropped,
            self.decoder.discarded_bytes()
        );
        let (written, dropped) = self.forwarder.shutdown(flush_timeout).await;
        info!("forwarder drained: {written} points written, {dropped} points dropped");
        (written, dropped)
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frame_errors(&self) -> u64 {
        self.frame_errors
    }

    pub fn readings_dropped(&self) -> u64 {
        self.readings_dropped
    }
}

// ============================================================================
// Tests
// ============================================================================
