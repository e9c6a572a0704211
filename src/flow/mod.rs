//! Guaranteed-delivery consumers.
//!
//! A [`Flow`] is bound to an [`Endpoint`] held by the router and receives the
//! messages spooled there, at most `window` of them unacknowledged at a time.
//! Messages are consumed either by a [`FlowHandler`](crate::session::FlowHandler)
//! running on the session context, or by calling [`Flow::receive`]; the two
//! modes are exclusive per flow.

pub mod endpoint;
#[allow(clippy::module_inception)]
pub mod flow;

pub use endpoint::Endpoint;
pub use flow::{AckMode, Flow, FlowOptions, FlowState};
