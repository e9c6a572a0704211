//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `popmsg` crate.
//!
//! Error types live in [`error`]; [`logging`] installs the tracing subscriber
//! used by the binary and by tests that want readable output.

pub mod error;
pub mod logging;
