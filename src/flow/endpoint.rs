use serde::{Deserialize, Serialize};

use crate::message::Destination;

/// Something a flow binds to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// A durable queue, provisioned up front.
    Queue { name: String },
    /// A queue created for (and removed with) one session.
    TemporaryQueue { name: String },
    /// A durable endpoint that spools guaranteed messages published on
    /// `topic`. Only one consuming flow may be bound at a time.
    TopicEndpoint { name: String, topic: String },
}

impl Endpoint {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { name: name.into() }
    }

    pub fn topic_endpoint(name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self::TopicEndpoint {
            name: name.into(),
            topic: topic.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Queue { name } | Self::TemporaryQueue { name } | Self::TopicEndpoint { name, .. } => {
                name
            }
        }
    }

    /// Where to publish so that this endpoint receives the message, e.g. as a
    /// reply-to address.
    pub fn destination(&self) -> Destination {
        match self {
            Self::Queue { name } | Self::TemporaryQueue { name } => Destination::queue(name.clone()),
            Self::TopicEndpoint { topic, .. } => Destination::topic(topic.clone()),
        }
    }
}
