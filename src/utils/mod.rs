//! # Utility Modules
//!
//! Supporting utilities shared by every layer of the transport.
//!
//! ## Components
//! - **Compression**: zstd payload compression with a decompression size limit
//! - **Logging**: `tracing-subscriber` setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: Thread-safe observability counters

pub mod compression;
pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
