//! The `connection` module owns one link to the router: login, reconnection
//! with backoff, the bounded outbound queue and request/reply correlation.

#[allow(clippy::module_inception)]
pub mod connection;

pub use connection::{Backoff, Connection, ConnectionEvent, Lane, TransportState};

#[cfg(test)]
mod tests;
