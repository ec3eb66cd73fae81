//! Tracing setup shared by the unisearch service shell.
//!
//! The orchestrator library itself never installs a subscriber — it only emits
//! `tracing` events. This crate is what the service binary calls once at startup.

mod init;

pub use init::{init_tracing, TracingConfig};

pub use tracing::{debug, error, info, instrument, span, trace, warn, Level};
