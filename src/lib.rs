//! telebridge library entry point.
//!
//! Re-exports the bridge modules so that the binary in `main.rs` and the
//! tests share the same module tree.

pub mod bridge;
pub mod checksums;
pub mod errors;
pub mod io;
pub mod settings;

pub use bridge::Bridge;
pub use settings::Settings;
