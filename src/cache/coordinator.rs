use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::Message;
use crate::session::CacheHandler;
use crate::session::handler::guarded_sync;
use crate::topic::TopicPattern;
use crate::utils::error::CacheError;

/// What happens to live messages matching an outstanding request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiveDataAction {
    /// Held, then delivered after the request completes.
    #[default]
    Queue,
    /// Delivered as they arrive.
    FlowThrough,
    /// Dropped while the request is outstanding.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncompleteReason {
    NoData,
    SuspectData,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Ok,
    Incomplete(IncompleteReason),
    Fail,
}

impl CacheOutcome {
    pub(crate) fn from_response(received: usize, suspect: bool) -> Self {
        if received == 0 {
            Self::Incomplete(IncompleteReason::NoData)
        } else if suspect {
            Self::Incomplete(IncompleteReason::SuspectData)
        } else {
            Self::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    InProgress,
    Completed(CacheOutcome),
}

#[derive(Debug, Clone)]
pub struct CacheRequest {
    pub request_id: u64,
    pub topic: String,
    pub live_data: LiveDataAction,
    /// Block the caller until the request completes.
    pub wait: bool,
    /// Also subscribe to `topic` for live traffic.
    pub subscribe: bool,
    /// Most recent messages per topic to return; 0 for all.
    pub max_messages: usize,
    pub timeout: Duration,
}

impl CacheRequest {
    pub fn new(request_id: u64, topic: impl Into<String>) -> Self {
        Self {
            request_id,
            topic: topic.into(),
            live_data: LiveDataAction::Queue,
            wait: false,
            subscribe: true,
            max_messages: 0,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn live_data(mut self, action: LiveDataAction) -> Self {
        self.live_data = action;
        self
    }

    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct Pending {
    request_id: u64,
    pattern: TopicPattern,
    live_data: LiveDataAction,
    handler: Option<Arc<dyn CacheHandler>>,
    waiter: Option<oneshot::Sender<CacheOutcome>>,
    held: Vec<Message>,
    /// Cancelled once the request ends, which stops its timeout timer.
    timer: CancellationToken,
}

/// A finished request, taken out of the coordinator so it can be reported
/// without holding the session lock.
pub struct Completion {
    pub request_id: u64,
    pub outcome: CacheOutcome,
    handler: Option<Arc<dyn CacheHandler>>,
    waiter: Option<oneshot::Sender<CacheOutcome>>,
    held: Vec<Message>,
}

impl Completion {
    /// Reports the outcome and returns the live messages held meanwhile, to
    /// be dispatched after it.
    pub fn notify(self) -> Vec<Message> {
        if let Some(handler) = self.handler {
            let (request_id, outcome) = (self.request_id, self.outcome);
            guarded_sync("cache", || handler.on_complete(request_id, outcome));
        }
        if let Some(waiter) = self.waiter {
            let _ = waiter.send(self.outcome);
        }
        self.held
    }
}

/// Outstanding cache requests of one session, keyed by the correlation the
/// router echoes.
#[derive(Default)]
pub struct CacheRequestCoordinator {
    pending: BTreeMap<u64, Pending>,
}

impl CacheRequestCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Tracks a new request. The returned token is cancelled when the
    /// request ends for any reason.
    pub fn register(
        &mut self,
        correlation: u64,
        request: &CacheRequest,
        pattern: TopicPattern,
        handler: Option<Arc<dyn CacheHandler>>,
        waiter: Option<oneshot::Sender<CacheOutcome>>,
    ) -> Result<CancellationToken, CacheError> {
        if self
            .pending
            .values()
            .any(|p| p.request_id == request.request_id)
        {
            return Err(CacheError::Duplicate(request.request_id));
        }
        let timer = CancellationToken::new();
        self.pending.insert(
            correlation,
            Pending {
                request_id: request.request_id,
                pattern,
                live_data: request.live_data,
                handler,
                waiter,
                held: Vec::new(),
                timer: timer.clone(),
            },
        );
        Ok(timer)
    }

    pub fn cancel(&mut self, correlation: u64) {
        if let Some(pending) = self.pending.remove(&correlation) {
            pending.timer.cancel();
        }
    }

    /// Applies the live-data action of the oldest outstanding request whose
    /// topic matches. Returns the message if it should be dispatched now.
    pub fn intercept(&mut self, message: Message) -> Option<Message> {
        if message.cached {
            return Some(message);
        }
        let Some(topic) = message.topic() else {
            return Some(message);
        };
        let Some(pending) = self.pending.values_mut().find(|p| p.pattern.matches(topic)) else {
            return Some(message);
        };
        match pending.live_data {
            LiveDataAction::FlowThrough => Some(message),
            LiveDataAction::Queue => {
                pending.held.push(message);
                None
            }
            LiveDataAction::Discard => {
                debug!(request = pending.request_id, "live message discarded");
                None
            }
        }
    }

    pub fn complete(&mut self, correlation: u64, outcome: CacheOutcome) -> Option<Completion> {
        let pending = self.pending.remove(&correlation)?;
        pending.timer.cancel();
        Some(Completion {
            request_id: pending.request_id,
            outcome,
            handler: pending.handler,
            waiter: pending.waiter,
            held: pending.held,
        })
    }

    /// Ends every request with `Fail`. Waiting callers see `Cancelled` and
    /// held live messages are dropped.
    pub fn fail_all(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|pending| {
                pending.timer.cancel();
                Completion {
                    request_id: pending.request_id,
                    outcome: CacheOutcome::Fail,
                    handler: pending.handler,
                    waiter: None,
                    held: Vec::new(),
                }
            })
            .collect()
    }
}
