// src/io/serial/mod.rs
//
// Serial subsystem: link lifecycle and wire-protocol decoding.
//
// Features:
// - Device discovery with probe-before-trust (link)
// - Marker/length/CRC frame decoding with resync (framer)

pub mod framer;
pub mod link;
pub(crate) mod utils;

// Re-export the types the orchestrator wires together
pub use framer::{FrameDecoder, FrameEvent};
pub use link::{LinkEvent, LinkState, SerialLinkManager};
pub use utils::Parity;
