//! Message definitions
//!
//! `Message` is both the application-facing value and the wire
//! representation carried inside transport frames.
//!
//! Notes on fields:
//! - `destination`: topic or queue the message is published to
//! - `delivery_mode`: `Direct` is fire-and-forget, the guaranteed modes are
//!   acknowledged by the router
//! - `message_id`: assigned by the router once a guaranteed message is
//!   accepted; `None` until then
//! - `origin`: session id of the publisher, stamped by the router and used
//!   for no-local filtering
//! - `cached`: set on messages delivered as part of a cache response

use serde::{Deserialize, Serialize};

use crate::message::container::Container;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Topic(String),
    Queue(String),
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Topic(name) | Self::Queue(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Direct,
    NonPersistent,
    Persistent,
}

impl DeliveryMode {
    pub fn is_guaranteed(self) -> bool {
        !matches!(self, Self::Direct)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub destination: Destination,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default)]
    pub cached: bool,
}

impl Message {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            delivery_mode: DeliveryMode::Direct,
            payload: Vec::new(),
            container: None,
            reply_to: None,
            correlation_id: None,
            sender_id: None,
            sequence_number: None,
            timestamp: None,
            message_id: None,
            origin: None,
            redelivered: false,
            cached: false,
        }
    }

    pub fn to_topic(topic: impl Into<String>) -> Self {
        Self::new(Destination::topic(topic))
    }

    pub fn to_queue(queue: impl Into<String>) -> Self {
        Self::new(Destination::queue(queue))
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_container(mut self, container: impl Into<Container>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: Destination) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn topic(&self) -> Option<&str> {
        match &self.destination {
            Destination::Topic(t) => Some(t),
            Destination::Queue(_) => None,
        }
    }

    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
