//! QMP client for QEMU live migration
//!
//! Minimal implementation of the QEMU Machine Protocol: newline-delimited
//! JSON over a unix stream socket. On connect the greeting is consumed and
//! capabilities are negotiated; after that the crate speaks exactly the two
//! commands the migration driver needs, `migrate` and `query-migrate`, and
//! silently tolerates asynchronous event objects interleaved with replies.
//!
//! The `migrate` module drives a full live migration: issue `migrate`, then
//! poll `query-migrate` once a second until the status turns terminal.

pub mod client;
pub mod error;
pub mod migrate;

pub use client::{MigrationStatus, QmpClient, RamStats};
pub use error::QmpError;
