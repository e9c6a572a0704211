//! Guaranteed request/reply over transacted sessions.
//!
//! A request is a stream of `int8 op, int32 left, int32 right`; the reply is
//! `bool ok` followed by a `double` result when `ok` is true. The replier
//! consumes requests from a queue or topic endpoint and answers each one in
//! its own transaction. The requester commits the request, waits (bounded)
//! on a temporary queue for the reply, then commits the consumed reply as a
//! second unit.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::flow::{AckMode, Endpoint, Flow};
use crate::message::{Destination, Message, StreamContainer};
use crate::session::{ProvisionOptions, Session};
use crate::transaction::{TransactedSession, TransactionState};
use crate::utils::error::{FlowError, PayloadError, RequestReplyError, TransactionError};

/// How long a requester waits for each reply.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Plus = 1,
    Minus = 2,
    Times = 3,
    Divide = 4,
}

impl Operation {
    pub const ALL: [Operation; 4] = [Self::Plus, Self::Minus, Self::Times, Self::Divide];

    pub fn code(self) -> i8 {
        self as i8
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Times => "*",
            Self::Divide => "/",
        }
    }

    /// `None` for a division by zero.
    pub fn apply(self, left: i32, right: i32) -> Option<f64> {
        let (left, right) = (f64::from(left), f64::from(right));
        match self {
            Self::Plus => Some(left + right),
            Self::Minus => Some(left - right),
            Self::Times => Some(left * right),
            Self::Divide if right == 0.0 => None,
            Self::Divide => Some(left / right),
        }
    }
}

/// A decoded arithmetic request. `op` is kept raw so unknown codes can be
/// sent and answered with a failed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: i8,
    pub left: i32,
    pub right: i32,
}

impl Request {
    pub fn new(op: Operation, left: i32, right: i32) -> Self {
        Self {
            op: op.code(),
            left,
            right,
        }
    }

    pub fn compute(&self) -> Option<f64> {
        Operation::from_code(self.op)?.apply(self.left, self.right)
    }

    pub fn encode(&self) -> StreamContainer {
        let mut stream = StreamContainer::new();
        stream
            .add_int8(self.op)
            .add_int32(self.left)
            .add_int32(self.right);
        stream
    }

    pub fn decode(message: &Message) -> Result<Self, PayloadError> {
        let stream = message
            .container
            .as_ref()
            .and_then(|c| c.as_stream())
            .ok_or(PayloadError::NoContainer)?;
        let mut reader = stream.reader();
        Ok(Self {
            op: reader.read_int8()?,
            left: reader.read_int32()?,
            right: reader.read_int32()?,
        })
    }
}

pub fn encode_reply(result: Option<f64>) -> StreamContainer {
    let mut stream = StreamContainer::new();
    match result {
        Some(value) => stream.add_bool(true).add_double(value),
        None => stream.add_bool(false),
    };
    stream
}

/// `Ok(None)` is a well-formed reply reporting that the operation failed.
pub fn decode_reply(message: &Message) -> Result<Option<f64>, PayloadError> {
    let stream = message
        .container
        .as_ref()
        .and_then(|c| c.as_stream())
        .ok_or(PayloadError::NoContainer)?;
    let mut reader = stream.reader();
    if reader.read_bool()? {
        Ok(Some(reader.read_double()?))
    } else {
        Ok(None)
    }
}

/// What a replier did before it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplierReport {
    /// Replies committed.
    pub served: u64,
    /// State of the replier's transaction when it stopped.
    pub state: TransactionState,
}

/// Answers requests arriving on `endpoint` until `shutdown` fires.
///
/// Durable endpoints are provisioned if missing and deprovisioned on the way
/// out, best effort.
pub async fn run_replier(
    session: &Session,
    endpoint: Endpoint,
    shutdown: CancellationToken,
) -> Result<ReplierReport, RequestReplyError> {
    let durable = !matches!(endpoint, Endpoint::TemporaryQueue { .. });
    if durable {
        session
            .provision(endpoint.clone(), ProvisionOptions { ignore_exists: true })
            .await?;
    }

    let tx = session.create_transacted_session().await?;
    let flow = tx
        .create_flow(
            endpoint.clone(),
            session.flow_options().ack_mode(AckMode::Client),
            None,
        )
        .await?;
    info!(endpoint = %endpoint.name(), "replier waiting for requests");

    let mut served = 0;
    let outcome = loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            received = tx.receive_msg(&flow, REPLY_TIMEOUT) => received,
        };
        let request = match received {
            Ok(request) => request,
            Err(TransactionError::Flow(FlowError::Timeout)) => continue,
            Err(err) => break Err(err),
        };
        match answer(&tx, &flow, request).await {
            Ok(()) => served += 1,
            Err(RequestReplyError::Transaction(err @ TransactionError::CommitFailed(_))) => {
                warn!(error = %err, "reply not committed; the request will be redelivered");
            }
            Err(err) => error!(error = %err, "failed to answer request"),
        }
    };

    let state = tx.state();
    if let Err(err) = tx.close().await {
        warn!(error = %err, "closing the replier transaction failed");
    }
    if durable {
        if let Err(err) = session.deprovision(endpoint, true).await {
            warn!(error = %err, "deprovisioning the request endpoint failed");
        }
    }
    outcome?;
    info!(served, ?state, "replier stopped");
    Ok(ReplierReport { served, state })
}

async fn answer(
    tx: &TransactedSession,
    flow: &Flow,
    request: Message,
) -> Result<(), RequestReplyError> {
    let message_id = request.message_id;
    let staged = stage_reply(tx, &request);
    if let Some(id) = message_id {
        flow.ack(id)?;
    }
    // A malformed request is still consumed so it is not redelivered forever.
    if let Err(err) = staged {
        tx.commit().await?;
        return Err(err);
    }
    tx.commit().await?;
    Ok(())
}

fn stage_reply(tx: &TransactedSession, request: &Message) -> Result<(), RequestReplyError> {
    let reply_to = request
        .reply_to
        .clone()
        .ok_or(RequestReplyError::NoReplyTo)?;
    let decoded = Request::decode(request)?;
    let result = decoded.compute();
    debug!(op = decoded.op, left = decoded.left, right = decoded.right, ?result, "answering");

    let mut reply = Message::new(reply_to).persistent().with_container(encode_reply(result));
    reply.correlation_id = request.correlation_id.clone();
    tx.send_msg(reply)?;
    Ok(())
}

/// The requesting side: a transacted session with a flow on its own
/// temporary reply queue.
pub struct Requester {
    tx: TransactedSession,
    flow: Flow,
    reply_queue: Endpoint,
    destination: Destination,
    timeout: Duration,
}

impl Requester {
    pub async fn open(session: &Session, destination: Destination) -> Result<Self, RequestReplyError> {
        let reply_queue = session.create_temporary_queue().await?;
        let tx = session.create_transacted_session().await?;
        let flow = tx
            .create_flow(
                reply_queue.clone(),
                session.flow_options().ack_mode(AckMode::Client),
                None,
            )
            .await?;
        Ok(Self {
            tx,
            flow,
            reply_queue,
            destination,
            timeout: REPLY_TIMEOUT,
        })
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn reply_queue(&self) -> &Endpoint {
        &self.reply_queue
    }

    pub fn transaction(&self) -> &TransactedSession {
        &self.tx
    }

    /// Sends one request and waits for its reply. The request and the
    /// consumed reply are committed as two separate units.
    ///
    /// Each request carries a fresh correlation id. Replies carrying any
    /// other id (late answers to requests that already timed out) are
    /// consumed and dropped.
    pub async fn request(&self, request: Request) -> Result<Option<f64>, RequestReplyError> {
        let correlation_id = Uuid::new_v4().to_string();
        let message = Message::new(self.destination.clone())
            .persistent()
            .with_reply_to(self.reply_queue.destination())
            .with_correlation_id(correlation_id.clone())
            .with_container(request.encode());
        self.tx.send_msg(message)?;
        self.tx.commit().await?;
        debug!(op = request.op, correlation = %correlation_id, "request committed");

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let reply = match self.tx.receive_msg(&self.flow, remaining).await {
                Ok(reply) => reply,
                Err(TransactionError::Flow(FlowError::Timeout)) => {
                    return Err(RequestReplyError::Timeout(self.timeout));
                }
                Err(err) => return Err(err.into()),
            };
            if let Some(id) = reply.message_id {
                self.flow.ack(id)?;
            }
            self.tx.commit().await?;

            if reply.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                return Ok(decode_reply(&reply)?);
            }
            warn!(
                expected = %correlation_id,
                got = ?reply.correlation_id,
                "discarding a reply to an earlier request"
            );
        }
    }

    pub async fn close(self) -> Result<(), RequestReplyError> {
        self.tx.close().await?;
        Ok(())
    }
}

/// Sends every operation on `left` and `right`, plus one unknown operation
/// code, logging each outcome. Timeouts are logged and the run continues.
pub async fn run_requester(
    session: &Session,
    destination: Destination,
    left: i32,
    right: i32,
) -> Result<Vec<(i8, Option<f64>)>, RequestReplyError> {
    let requester = Requester::open(session, destination).await?;
    let unknown = Operation::Divide.code() + 1;
    let codes = Operation::ALL.into_iter().map(Operation::code).chain([unknown]);

    let mut answered = Vec::new();
    for op in codes {
        let request = Request { op, left, right };
        let symbol = Operation::from_code(op).map_or("?", Operation::symbol);
        let outcome = requester.request(request).await;
        match outcome {
            Ok(Some(result)) => {
                info!("{left} {symbol} {right} = {result}");
                answered.push((op, Some(result)));
            }
            Ok(None) => {
                info!("{left} {symbol} {right} failed");
                answered.push((op, None));
            }
            Err(err @ RequestReplyError::Timeout(_)) => {
                error!(op, error = %err, "request was not answered");
            }
            Err(err) => {
                let _ = requester.close().await;
                return Err(err);
            }
        }
    }
    requester.close().await?;
    Ok(answered)
}
