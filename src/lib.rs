//! Backup Restore Operator
//!
//! This operator drives RestoreSession resources in Kubernetes: it launches
//! restore jobs or init-container injections, tracks per-host results and
//! reports the session phase.

pub mod admission;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod rbac;
pub mod reconcilers;
pub mod resolve;
pub mod resources;
pub mod workload;

pub use error::{Error, Result};
