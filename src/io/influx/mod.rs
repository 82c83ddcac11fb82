// src/io/influx/mod.rs
//
// InfluxDB output: line protocol rendering, the HTTP writer, and the
// batching forwarder that feeds it.

pub mod forwarder;
pub mod writer;

pub use forwarder::Forwarder;
pub use writer::InfluxWriter;
