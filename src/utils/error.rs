//! Error types shared across `popmsg`.
//!
//! Each concern gets its own enum so callers can match on exactly the failures
//! an operation can produce. Transport-level failures are retried inside the
//! connection; everything that reaches these types has already been surfaced
//! to the caller.

use thiserror::Error;

use crate::transport::frame::Rejection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic must not be empty")]
    Empty,
    #[error("topic '{0}' contains an empty level")]
    EmptyLevel(String),
    #[error("topic '{0}' is longer than 250 bytes")]
    TooLong(String),
    #[error("'>' may only appear as the last level of '{0}'")]
    MisplacedWildcard(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("expected a {expected} field but found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("no more fields in stream")]
    EndOfStream,
    #[error("map already contains key '{0}'")]
    DuplicateKey(String),
    #[error("map has no key '{0}'")]
    MissingKey(String),
    #[error("message has no structured payload")]
    NoContainer,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused by {0}")]
    Refused(String),
    #[error("transport closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure to establish (or re-establish) a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connect failed after {attempts} attempt(s): {reason}")]
    ConnectFailed { attempts: u32, reason: String },
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("connection cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("send timed out waiting for queue space")]
    Timeout,
    #[error("send queue is full")]
    QueueFull,
    #[error("connection is closed")]
    Closed,
}

/// Outcome of a correlated request that did not succeed. Converted into the
/// operation-specific error by every public call site.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("no reply before the timeout elapsed")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("rejected: {0}")]
    Rejected(Rejection),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("'{0}' is already registered for this handler")]
    Duplicate(String),
    #[error("no subscription registered for '{0}'")]
    NotFound(String),
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl From<SendError> for PublishError {
    fn from(err: SendError) -> Self {
        Self::Request(RequestError::Send(err))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("bind failed: {0}")]
    Bind(Rejection),
    #[error("no message before the timeout elapsed")]
    Timeout,
    #[error("flow has an async handler; blocking receive is not available")]
    HandlerRegistered,
    #[error("flow is destroyed")]
    Destroyed,
    #[error("message {0} is not outstanding on this flow")]
    UnknownMessage(u64),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<RequestError> for FlowError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Send(e) => Self::Send(e),
            RequestError::Timeout => Self::Timeout,
            RequestError::Cancelled => Self::Cancelled,
            RequestError::Rejected(r) => Self::Bind(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("commit failed, every staged operation is discarded: {0}")]
    CommitFailed(Rejection),
    #[error("rollback failed: {0}")]
    RollbackFailed(Rejection),
    #[error("transacted sends must use a guaranteed delivery mode")]
    DirectSend,
    #[error("flow {0} is not enlisted in this transacted session")]
    NotEnlisted(u64),
    #[error("transacted session is closed")]
    Closed,
    #[error("no reply before the timeout elapsed; outcome is indeterminate")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl TransactionError {
    pub(crate) fn from_request(err: RequestError, on_reject: fn(Rejection) -> Self) -> Self {
        match err {
            RequestError::Send(e) => Self::Send(e),
            RequestError::Timeout => Self::Timeout,
            RequestError::Cancelled => Self::Cancelled,
            RequestError::Rejected(r) => on_reject(r),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("temporary queues cannot be provisioned explicitly")]
    Temporary,
    #[error(transparent)]
    Request(#[from] RequestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),
    #[error("cache request {0} is already outstanding")]
    Duplicate(u64),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("cache request cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history store error: {0}")]
    Store(#[from] sled::Error),
    #[error("history record could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestReplyError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("malformed arithmetic payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("no reply within {0:?}")]
    Timeout(std::time::Duration),
    #[error("request carries no reply-to destination")]
    NoReplyTo,
}

impl From<FlowError> for RequestReplyError {
    fn from(err: FlowError) -> Self {
        Self::Transaction(TransactionError::Flow(err))
    }
}
