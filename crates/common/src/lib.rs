//! Shared configuration, error types, identifiers, and observability primitives for tsdq crates.
//!
//! Architecture role:
//! - defines query/stream configuration passed across layers
//! - provides common [`TsdqError`] / [`Result`] contracts
//! - hosts the Prometheus metrics registry and its HTTP exporter
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]
//! - [`metrics_exporter`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod metrics_exporter;

pub use config::{QueryConfig, StreamConfig};
pub use error::{ErrorKind, Result, TsdqError};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
pub use metrics_exporter::{metrics_router, run_metrics_exporter};
