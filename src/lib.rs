//! Shoot Webhook - admission mutator for managed shoot clusters
//!
//! Adapts system components deployed into a shoot cluster to run inside the
//! managed environment, rewriting them before they are persisted.
//!
//! # Modules
//!
//! - [`shoot`] - Dispatcher and rewriters for shoot resources
//! - [`webhook`] - Admission webhook HTTP surface
//! - [`telemetry`] - Structured logging and trace export
//! - [`error`] - Error types for mutation

#![deny(missing_docs)]

pub mod error;
pub mod shoot;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
