//! Ambient stack shared by every crate in this workspace: structured
//! logging setup, cooperative shutdown signaling, recognized-key
//! configuration parsing, and per-stream metrics registration.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod shutdown;

pub use config::{ConfigError, SpoolConfig};
pub use shutdown::ShutdownFlag;
