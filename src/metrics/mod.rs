//! Prometheus metrics for the Backup Restore Operator
//!
//! This module exposes metrics for monitoring operator health and performance,
//! and serves them next to the probes and the admission endpoint.

mod prometheus;

pub use prometheus::*;
