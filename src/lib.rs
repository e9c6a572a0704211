//! # PopMsg
//!
//! `popmsg` is a client-side messaging runtime: sessions that publish and
//! subscribe over a single connection, guaranteed-delivery flows with client
//! acknowledgement, transacted sessions, and asynchronous cache requests.
//! An in-process router implements the other side of the protocol so the
//! runtime can be exercised end to end, either directly in memory or behind a
//! WebSocket listener.
//!
//! ## Core Modules
//!
//! - `session`: publish/subscribe, local dispatch and the context task.
//! - `connection`: connect, reconnect with backoff, and the send queue.
//! - `flow`: guaranteed-delivery consumers bound to queues and topic endpoints.
//! - `transaction`: transacted sessions with atomic commit and rollback.
//! - `cache`: cache requests and live-data handling while they are pending.
//! - `request_reply`: guaranteed request/reply built on transacted sessions.
//! - `router`: the in-process router the sessions talk to.
//! - `transport`: the frame protocol and the WebSocket and in-memory links.
//! - `persistence`: the cache history store.
//! - `config`, `topic`, `message`, `utils`: settings, topic syntax, message
//!   model, errors and logging.

pub mod cache;
pub mod config;
pub mod connection;
pub mod flow;
pub mod message;
pub mod persistence;
pub mod request_reply;
pub mod router;
pub mod session;
pub mod topic;
pub mod transaction;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod tests;

pub use message::{DeliveryMode, Destination, Message};
pub use router::Router;
pub use session::Session;
