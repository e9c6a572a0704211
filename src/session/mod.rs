//! Sessions: publish/subscribe over one connection.
//!
//! A [`Session`] owns exactly one `Connection` and one context task. The
//! context task takes every inbound frame in order and runs the matching
//! handlers; see [`handler`] for the traits they implement.

pub mod dispatcher;
pub mod handler;
#[allow(clippy::module_inception)]
pub mod session;

pub use dispatcher::{DefaultHandlerPolicy, Dispatcher};
pub use handler::{CacheHandler, EventHandler, FlowHandler, MessageHandler};
pub use session::{ProvisionOptions, Session, SessionEvent, SessionStats, SubscribeOptions};
