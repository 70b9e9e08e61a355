//! Reconcilers for RestoreSession
//!
//! This module contains the business logic behind the controller:
//! - Deriving the session phase from per-host results
//! - Launching the restore for the session's driver and target
//! - Updating status and retracting side effects on deletion

pub mod launch;
pub mod phase;
pub mod restore_session;
