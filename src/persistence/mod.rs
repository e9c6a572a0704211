//! The `persistence` module stores topic history for cache requests.
//!
//! It uses `sled` as an embedded key-value store; the router writes every
//! topic publish and reads matching history back when a session sends a
//! cache request.

pub mod sled_store;

pub use sled_store::{Persistence, StoredMessage};
