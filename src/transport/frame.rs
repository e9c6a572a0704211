//! Wire frames exchanged between a session and the router.
//!
//! Frames are JSON objects tagged by `"type"`, sent as WebSocket text
//! messages (or passed by value over the in-memory transport). Requests that
//! expect an answer carry a `correlation` number which the router echoes in
//! a `reply` frame.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::flow::Endpoint;
use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login {
        session_id: String,
        username: String,
        password: String,
        vpn: String,
        client_name: String,
        compression_level: u8,
    },
    /// Orderly close. Temporary queues owned by the session are removed; a
    /// link that drops without one keeps them for a reconnect.
    Logout,
    Subscribe {
        correlation: Option<u64>,
        topic: String,
    },
    Unsubscribe {
        correlation: Option<u64>,
        topic: String,
    },
    Publish {
        correlation: Option<u64>,
        message: Message,
    },
    Provision {
        correlation: u64,
        endpoint: Endpoint,
        ignore_exists: bool,
    },
    Deprovision {
        correlation: u64,
        endpoint: Endpoint,
        ignore_missing: bool,
    },
    CreateTemporaryQueue {
        correlation: u64,
    },
    Bind {
        correlation: u64,
        flow_id: u64,
        endpoint: Endpoint,
        window: usize,
        browser: bool,
        started: bool,
        transaction: Option<u64>,
    },
    Unbind {
        correlation: Option<u64>,
        flow_id: u64,
    },
    Ack {
        flow_id: u64,
        message_id: u64,
    },
    Start {
        flow_id: u64,
    },
    Stop {
        flow_id: u64,
    },
    OpenTransaction {
        correlation: u64,
        transaction: u64,
    },
    Commit {
        correlation: u64,
        transaction: u64,
        sends: Vec<Message>,
        acks: Vec<FlowAck>,
    },
    Rollback {
        correlation: u64,
        transaction: u64,
    },
    CloseTransaction {
        transaction: u64,
    },
    CacheRequest {
        correlation: u64,
        topic: String,
        subscribe: bool,
        max_messages: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowAck {
    pub flow_id: u64,
    pub message_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    LoginResponse {
        session_id: String,
    },
    Error {
        message: String,
    },
    Reply {
        correlation: u64,
        outcome: Outcome,
    },
    Message {
        message: Message,
    },
    FlowMessage {
        flow_id: u64,
        message: Message,
    },
    FlowUnbound {
        flow_id: u64,
        reason: String,
    },
    /// Everything the flow held was handed back to its endpoint (rollback or
    /// failed commit). Redeliveries follow this frame.
    FlowReleased {
        flow_id: u64,
    },
    /// The flow is now the consumer of its exclusive endpoint.
    FlowActive {
        flow_id: u64,
    },
    /// The flow is bound on standby behind another consumer.
    FlowInactive {
        flow_id: u64,
    },
    CacheResponse {
        correlation: u64,
        messages: Vec<Message>,
        suspect: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Published { message_id: Option<u64> },
    TemporaryQueue { name: String },
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    NoMatchingEndpoint,
    UnknownEndpoint,
    EndpointExists,
    PermissionDenied,
    InvalidTopic,
    UnknownFlow,
    UnknownTransaction,
    InvalidAck,
}

/// A request the router refused. Application-level rejections are never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub reason: String,
}

impl Rejection {
    pub fn new(code: RejectCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.reason)
    }
}
