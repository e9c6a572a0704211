//! The `message` module defines what travels between sessions and the router:
//! [`Message`] with its [`Destination`] and [`DeliveryMode`], and the
//! structured payload containers.

pub mod container;
#[allow(clippy::module_inception)]
pub mod message;

pub use container::{Container, Field, MapContainer, StreamContainer, StreamReader};
pub use message::{DeliveryMode, Destination, Message};
