use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{
    CacheOutcome, CacheRequest, CacheRequestCoordinator, CacheStatus, IncompleteReason,
};
use crate::config::{FlowSettings, SessionSettings, Settings};
use crate::connection::{Connection, ConnectionEvent, Lane, TransportState};
use crate::flow::flow::{FlowBinding, FlowRegistry};
use crate::flow::{Endpoint, Flow, FlowOptions};
use crate::message::{Destination, Message};
use crate::session::dispatcher::Dispatcher;
use crate::session::handler::{guarded, guarded_sync};
use crate::session::{CacheHandler, EventHandler, FlowHandler, MessageHandler};
use crate::topic::{TopicPattern, validate_publish_topic};
use crate::transaction::{TransactedSession, TxInner};
use crate::transport::Transport;
use crate::transport::frame::{ClientFrame, Outcome, RejectCode, Rejection, ServerFrame};
use crate::utils::error::{
    CacheError, ConnectError, FlowError, ProvisionError, PublishError, RequestError, SendError,
    SubscribeError, TransactionError,
};

/// Notifications outside the message path.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Reconnecting,
    Reconnected,
    /// The connection is gone for good; the session is closed.
    Down(ConnectError),
    /// A `publish_nowait` was accepted.
    Acknowledged {
        correlation: u64,
        message_id: Option<u64>,
    },
    /// A `publish_nowait` failed.
    Rejected {
        correlation: u64,
        error: PublishError,
    },
    FlowUnbound {
        flow_id: u64,
        reason: String,
    },
    /// The flow became the consumer of its exclusive endpoint.
    FlowActive { flow_id: u64 },
    /// The flow is bound but waits on standby behind another consumer.
    FlowInactive { flow_id: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Refine local dispatch only; the router is never told.
    pub local_only: bool,
    /// Wait for the router to confirm the subscription.
    pub wait_for_confirm: bool,
}

impl SubscribeOptions {
    pub fn local_only() -> Self {
        Self {
            local_only: true,
            wait_for_confirm: false,
        }
    }

    pub fn confirmed() -> Self {
        Self {
            local_only: false,
            wait_for_confirm: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Succeed when the endpoint is already there.
    pub ignore_exists: bool,
}

/// Snapshot of the per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub received: u64,
    pub cached: u64,
    pub dispatched_default: u64,
    pub dispatched_handlers: u64,
    pub discarded_no_local: u64,
    pub published: u64,
    pub acknowledged: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct StatsCounters {
    received: AtomicU64,
    cached: AtomicU64,
    dispatched_default: AtomicU64,
    dispatched_handlers: AtomicU64,
    discarded_no_local: AtomicU64,
    published: AtomicU64,
    acknowledged: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StatsCounters {
    fn snapshot(&self) -> SessionStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SessionStats {
            received: get(&self.received),
            cached: get(&self.cached),
            dispatched_default: get(&self.dispatched_default),
            dispatched_handlers: get(&self.dispatched_handlers),
            discarded_no_local: get(&self.discarded_no_local),
            published: get(&self.published),
            acknowledged: get(&self.acknowledged),
            rejected: get(&self.rejected),
        }
    }
}

/// A connected session. Clones share it; dropping the last clone closes it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
    _guard: Arc<SessionGuard>,
}

struct SessionGuard {
    inner: Arc<SessionInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.close();
    }
}

pub(crate) struct SessionInner {
    pub(crate) connection: Connection,
    pub(crate) settings: SessionSettings,
    flow_settings: FlowSettings,
    dispatcher: Mutex<Dispatcher>,
    flows: FlowRegistry,
    transactions: Mutex<HashMap<u64, Weak<TxInner>>>,
    cache: Mutex<CacheRequestCoordinator>,
    cache_timeouts: mpsc::UnboundedSender<u64>,
    default_handler: Arc<dyn MessageHandler>,
    events: Option<Arc<dyn EventHandler>>,
    publish_window: Semaphore,
    next_flow_id: AtomicU64,
    next_transaction_id: AtomicU64,
    next_sequence: AtomicU64,
    next_publish_token: AtomicU64,
    stats: StatsCounters,
    closing: AtomicBool,
    closed: CancellationToken,
}

impl Session {
    /// Connects and starts the context task. Direct messages no dispatch
    /// handler takes go to `handler`.
    pub async fn connect(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Session, ConnectError> {
        Self::build(settings, transport, handler, None).await
    }

    pub async fn connect_with_events(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        events: Arc<dyn EventHandler>,
    ) -> Result<Session, ConnectError> {
        Self::build(settings, transport, handler, Some(events)).await
    }

    async fn build(
        settings: &Settings,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        events: Option<Arc<dyn EventHandler>>,
    ) -> Result<Session, ConnectError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection::connect(&settings.session, transport, events_tx).await?;
        let (timeouts_tx, timeouts_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            connection,
            dispatcher: Mutex::new(Dispatcher::new(settings.session.default_handler_policy)),
            flows: Arc::new(Mutex::new(HashMap::new())),
            transactions: Mutex::new(HashMap::new()),
            cache: Mutex::new(CacheRequestCoordinator::new()),
            cache_timeouts: timeouts_tx,
            default_handler: handler,
            events,
            publish_window: Semaphore::new(settings.session.publish_window.max(1)),
            next_flow_id: AtomicU64::new(1),
            next_transaction_id: AtomicU64::new(1),
            next_sequence: AtomicU64::new(1),
            next_publish_token: AtomicU64::new(1),
            stats: StatsCounters::default(),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            settings: settings.session.clone(),
            flow_settings: settings.flow.clone(),
        });
        tokio::spawn(run_context(inner.clone(), events_rx, timeouts_rx));
        info!(session = %inner.connection.session_id(), "session up");

        Ok(Session {
            inner: inner.clone(),
            _guard: Arc::new(SessionGuard { inner }),
        })
    }

    pub fn session_id(&self) -> &str {
        self.inner.connection.session_id()
    }

    pub fn transport_state(&self) -> TransportState {
        self.inner.connection.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.stats.snapshot()
    }

    /// Registers `pattern`. With a handler, matching messages go to it
    /// instead of the default handler; without one, this is a plain
    /// subscription.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Option<Arc<dyn MessageHandler>>,
        options: SubscribeOptions,
    ) -> Result<(), SubscribeError> {
        let pattern = TopicPattern::parse(pattern)?;
        let needs_router =
            self.inner
                .dispatcher
                .lock()
                .add(pattern.clone(), handler.clone(), options.local_only)?;
        if !needs_router {
            return Ok(());
        }

        let topic = pattern.to_string();
        let connection = &self.inner.connection;
        let result = if options.wait_for_confirm {
            connection
                .request(
                    |correlation| ClientFrame::Subscribe {
                        correlation: Some(correlation),
                        topic,
                    },
                    self.inner.settings.ack_timeout(),
                )
                .await
                .map(|_| ())
        } else {
            connection
                .send(ClientFrame::Subscribe {
                    correlation: None,
                    topic,
                })
                .await
                .map_err(RequestError::from)
        };

        if let Err(err) = result {
            self.inner
                .dispatcher
                .lock()
                .remove_one(&pattern, &handler, options.local_only);
            return Err(err.into());
        }
        debug!(pattern = %pattern, "subscribed");
        Ok(())
    }

    /// Removes every registration of `pattern`.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), SubscribeError> {
        let pattern = TopicPattern::parse(pattern)?;
        let needs_router = self.inner.dispatcher.lock().remove(&pattern)?;
        if needs_router {
            self.inner
                .connection
                .send(ClientFrame::Unsubscribe {
                    correlation: None,
                    topic: pattern.to_string(),
                })
                .await
                .map_err(RequestError::from)?;
        }
        Ok(())
    }

    /// Publishes `message`. Direct messages are fire-and-forget; guaranteed
    /// ones wait for the router and get their `message_id` set.
    pub async fn publish(&self, message: &mut Message) -> Result<(), PublishError> {
        self.inner.publish(message).await
    }

    /// Publishes in the background. The returned token comes back in a
    /// `SessionEvent::Acknowledged` or `SessionEvent::Rejected`.
    pub fn publish_nowait(&self, message: Message) -> Result<u64, PublishError> {
        if self.inner.is_closed() {
            return Err(SendError::Closed.into());
        }
        if let Destination::Topic(topic) = &message.destination {
            validate_publish_topic(topic)?;
        }
        let token = self.inner.next_publish_token.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut message = message;
            let event = match inner.publish(&mut message).await {
                Ok(()) => SessionEvent::Acknowledged {
                    correlation: token,
                    message_id: message.message_id,
                },
                Err(error) => SessionEvent::Rejected {
                    correlation: token,
                    error,
                },
            };
            inner.emit(event);
        });
        Ok(token)
    }

    pub async fn create_flow(
        &self,
        endpoint: Endpoint,
        options: FlowOptions,
        handler: Option<Arc<dyn FlowHandler>>,
    ) -> Result<Flow, FlowError> {
        self.inner.open_flow(endpoint, options, handler, None).await
    }

    /// Flow options seeded from the configured flow defaults.
    pub fn flow_options(&self) -> FlowOptions {
        FlowOptions::from_settings(&self.inner.flow_settings)
    }

    pub fn flows(&self) -> Vec<Flow> {
        self.inner.flows.lock().values().cloned().collect()
    }

    pub async fn create_transacted_session(&self) -> Result<TransactedSession, TransactionError> {
        if self.inner.is_closed() {
            return Err(TransactionError::Closed);
        }
        TransactedSession::open(self.inner.clone()).await
    }

    /// Creates a queue owned by this session. It disappears when the session
    /// logs out.
    pub async fn create_temporary_queue(&self) -> Result<Endpoint, ProvisionError> {
        let outcome = self
            .inner
            .connection
            .request(
                |correlation| ClientFrame::CreateTemporaryQueue { correlation },
                self.inner.settings.ack_timeout(),
            )
            .await?;
        match outcome {
            Outcome::TemporaryQueue { name } => Ok(Endpoint::TemporaryQueue { name }),
            other => Err(RequestError::Rejected(Rejection::new(
                RejectCode::PermissionDenied,
                format!("unexpected reply {other:?}"),
            ))
            .into()),
        }
    }

    pub async fn provision(
        &self,
        endpoint: Endpoint,
        options: ProvisionOptions,
    ) -> Result<(), ProvisionError> {
        match &endpoint {
            Endpoint::TemporaryQueue { .. } => return Err(ProvisionError::Temporary),
            Endpoint::TopicEndpoint { topic, .. } => {
                TopicPattern::parse(topic)?;
            }
            Endpoint::Queue { .. } => {}
        }
        self.inner
            .connection
            .request(
                |correlation| ClientFrame::Provision {
                    correlation,
                    endpoint,
                    ignore_exists: options.ignore_exists,
                },
                self.inner.settings.ack_timeout(),
            )
            .await?;
        Ok(())
    }

    pub async fn deprovision(
        &self,
        endpoint: Endpoint,
        ignore_missing: bool,
    ) -> Result<(), ProvisionError> {
        if let Endpoint::TemporaryQueue { .. } = endpoint {
            return Err(ProvisionError::Temporary);
        }
        self.inner
            .connection
            .request(
                |correlation| ClientFrame::Deprovision {
                    correlation,
                    endpoint,
                    ignore_missing,
                },
                self.inner.settings.ack_timeout(),
            )
            .await?;
        Ok(())
    }

    /// Asks the router for the history of `request.topic`.
    ///
    /// Cached messages are dispatched like live ones, with `cached` set. A
    /// waiting request returns the final outcome; do not wait from inside a
    /// handler, the response is dispatched on the same task.
    pub async fn send_cache_request(
        &self,
        request: CacheRequest,
        handler: Option<Arc<dyn CacheHandler>>,
    ) -> Result<CacheStatus, CacheError> {
        if self.inner.is_closed() {
            return Err(CacheError::Cancelled);
        }
        let pattern = TopicPattern::parse(&request.topic)?;
        let correlation = self.inner.connection.next_correlation();
        let (waiter, completed) = if request.wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let timer = self
            .inner
            .cache
            .lock()
            .register(correlation, &request, pattern.clone(), handler, waiter)?;

        let mut subscribed = false;
        if request.subscribe {
            let mut dispatcher = self.inner.dispatcher.lock();
            if !dispatcher.contains(&pattern) {
                // The cache request itself subscribes on the router.
                subscribed = dispatcher.add(pattern.clone(), None, false).is_ok();
            }
        }

        let frame = ClientFrame::CacheRequest {
            correlation,
            topic: request.topic.clone(),
            subscribe: request.subscribe,
            max_messages: request.max_messages,
        };
        if let Err(err) = self.inner.connection.send(frame).await {
            self.inner.cache.lock().cancel(correlation);
            if subscribed {
                self.inner.dispatcher.lock().remove_one(&pattern, &None, false);
            }
            return Err(err.into());
        }

        let timeouts = self.inner.cache_timeouts.clone();
        let timeout = request.timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = timeouts.send(correlation);
                }
                _ = timer.cancelled() => {}
            }
        });

        match completed {
            Some(rx) => rx
                .await
                .map(CacheStatus::Completed)
                .map_err(|_| CacheError::Cancelled),
            None => Ok(CacheStatus::InProgress),
        }
    }

    /// Closes the session. Pending requests complete with `Cancelled`, flows
    /// are destroyed and outstanding cache requests fail.
    pub fn disconnect(&self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("state", &self.transport_state())
            .finish()
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn next_transaction_id(&self) -> u64 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_transaction(&self, tx: &Arc<TxInner>) {
        self.transactions
            .lock()
            .insert(tx.id(), Arc::downgrade(tx));
    }

    pub(crate) fn forget_transaction(&self, id: u64) {
        self.transactions.lock().remove(&id);
    }

    /// Stamps the generated header fields on an outgoing message.
    pub(crate) fn prepare(&self, message: &mut Message) {
        let settings = &self.settings;
        if settings.generate_sender_id && message.sender_id.is_none() {
            message.sender_id = Some(settings.client_name.clone());
        }
        if settings.generate_sequence_numbers && message.sequence_number.is_none() {
            message.sequence_number = Some(self.next_sequence.fetch_add(1, Ordering::Relaxed));
        }
        if settings.generate_send_timestamps {
            message.timestamp = Some(Utc::now().timestamp_millis());
        }
        message.message_id = None;
        message.origin = None;
        message.redelivered = false;
        message.cached = false;
    }

    async fn publish(&self, message: &mut Message) -> Result<(), PublishError> {
        if self.is_closed() {
            return Err(SendError::Closed.into());
        }
        if let Destination::Topic(topic) = &message.destination {
            validate_publish_topic(topic)?;
        }
        self.prepare(message);

        if !message.delivery_mode.is_guaranteed() {
            self.connection
                .send(ClientFrame::Publish {
                    correlation: None,
                    message: message.clone(),
                })
                .await?;
            bump(&self.stats.published);
            return Ok(());
        }

        let _permit = self
            .publish_window
            .acquire()
            .await
            .map_err(|_| PublishError::from(SendError::Closed))?;
        let outbound = message.clone();
        let outcome = self
            .connection
            .request(
                |correlation| ClientFrame::Publish {
                    correlation: Some(correlation),
                    message: outbound,
                },
                self.settings.ack_timeout(),
            )
            .await;
        bump(&self.stats.published);

        match outcome {
            Ok(outcome) => {
                if let Outcome::Published { message_id } = outcome {
                    message.message_id = message_id;
                }
                bump(&self.stats.acknowledged);
                Ok(())
            }
            Err(err) => {
                bump(&self.stats.rejected);
                debug!("guaranteed publish failed: {err}");
                Err(err.into())
            }
        }
    }

    pub(crate) async fn open_flow(
        &self,
        endpoint: Endpoint,
        mut options: FlowOptions,
        handler: Option<Arc<dyn FlowHandler>>,
        transaction: Option<(u64, Weak<TxInner>)>,
    ) -> Result<Flow, FlowError> {
        if self.is_closed() {
            return Err(FlowError::Destroyed);
        }
        if self.settings.no_local {
            options.no_local = true;
        }
        let binding = FlowBinding {
            id: self.next_flow_id.fetch_add(1, Ordering::Relaxed),
            endpoint,
            options,
            handler,
            transaction,
        };
        Flow::open(
            self.connection.clone(),
            &self.flows,
            self.flow_settings.bind_timeout(),
            binding,
        )
        .await
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            guarded_sync("event", || events.on_event(event));
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame(frame) => self.on_frame(frame).await,
            ConnectionEvent::Reconnecting => self.emit(SessionEvent::Reconnecting),
            ConnectionEvent::Reconnected => {
                self.recover().await;
                self.connection.resume();
                self.emit(SessionEvent::Reconnected);
            }
            ConnectionEvent::Down(err) => {
                self.emit(SessionEvent::Down(err));
                self.close();
            }
        }
    }

    async fn on_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Message { message } => {
                let live = self.cache.lock().intercept(message);
                if let Some(message) = live {
                    self.dispatch(message).await;
                }
            }
            ServerFrame::FlowMessage { flow_id, message } => {
                let flow = self.flows.lock().get(&flow_id).cloned();
                match flow {
                    Some(flow) => flow.deliver(message).await,
                    None => debug!(flow = flow_id, "message for an unknown flow dropped"),
                }
            }
            ServerFrame::FlowUnbound { flow_id, reason } => {
                let flow = self.flows.lock().get(&flow_id).cloned();
                if let Some(flow) = flow {
                    flow.mark_destroyed();
                }
                warn!(flow = flow_id, "flow unbound by the router: {reason}");
                self.emit(SessionEvent::FlowUnbound { flow_id, reason });
            }
            ServerFrame::FlowReleased { flow_id } => {
                let flow = self.flows.lock().get(&flow_id).cloned();
                if let Some(flow) = flow {
                    flow.reset_unacked();
                }
            }
            ServerFrame::FlowActive { flow_id } => {
                debug!(flow = flow_id, "flow active");
                self.emit(SessionEvent::FlowActive { flow_id });
            }
            ServerFrame::FlowInactive { flow_id } => {
                debug!(flow = flow_id, "flow on standby");
                self.emit(SessionEvent::FlowInactive { flow_id });
            }
            ServerFrame::CacheResponse {
                correlation,
                messages,
                suspect,
            } => self.on_cache_response(correlation, messages, suspect).await,
            ServerFrame::Error { message } => warn!("router error: {message}"),
            other => debug!("unexpected frame {other:?}"),
        }
    }

    async fn dispatch(&self, message: Message) {
        bump(&self.stats.received);
        if message.cached {
            bump(&self.stats.cached);
        }
        if self.settings.no_local
            && message.origin.as_deref() == Some(self.connection.session_id())
        {
            bump(&self.stats.discarded_no_local);
            return;
        }

        let routed = self.dispatcher.lock().route(message.topic());
        for handler in routed.handlers {
            guarded("dispatch", handler.on_message(message.clone())).await;
            bump(&self.stats.dispatched_handlers);
        }
        if routed.to_default {
            guarded("session", self.default_handler.on_message(message)).await;
            bump(&self.stats.dispatched_default);
        }
    }

    async fn on_cache_response(&self, correlation: u64, messages: Vec<Message>, suspect: bool) {
        let outcome = CacheOutcome::from_response(messages.len(), suspect);
        let completion = self.cache.lock().complete(correlation, outcome);
        let Some(completion) = completion else {
            debug!(correlation, "cache response after the request ended");
            return;
        };
        for mut message in messages {
            message.cached = true;
            self.dispatch(message).await;
        }
        for message in completion.notify() {
            self.dispatch(message).await;
        }
    }

    async fn on_cache_timeout(&self, correlation: u64) {
        let outcome = CacheOutcome::Incomplete(IncompleteReason::Timeout);
        let completion = self.cache.lock().complete(correlation, outcome);
        if let Some(completion) = completion {
            debug!(request = completion.request_id, "cache request timed out");
            for message in completion.notify() {
                self.dispatch(message).await;
            }
        }
    }

    /// Restores router-side state after a reconnect: subscriptions, then
    /// transactions, then flows. Everything goes through the recovery lane
    /// while the regular send queue is held.
    async fn recover(&self) {
        let patterns = self.dispatcher.lock().broker_patterns();
        for topic in patterns {
            if let Err(err) = self
                .connection
                .send_on(
                    Lane::Recovery,
                    ClientFrame::Subscribe {
                        correlation: None,
                        topic: topic.clone(),
                    },
                )
                .await
            {
                warn!(pattern = %topic, "resubscribe failed: {err}");
            }
        }

        let transactions: Vec<Arc<TxInner>> = self
            .transactions
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for tx in transactions {
            if let Err(err) = tx.reopen().await {
                warn!(transaction = tx.id(), "reopen failed: {err}");
            }
        }

        let flows: Vec<Flow> = self.flows.lock().values().cloned().collect();
        for flow in flows {
            if let Err(err) = flow.rebind().await {
                warn!(flow = flow.id(), "rebind failed: {err}");
                flow.mark_destroyed();
                self.emit(SessionEvent::FlowUnbound {
                    flow_id: flow.id(),
                    reason: err.to_string(),
                });
            }
        }
    }

    pub(crate) fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();
        self.connection.disconnect();
        self.publish_window.close();

        let flows: Vec<Flow> = self.flows.lock().drain().map(|(_, flow)| flow).collect();
        for flow in flows {
            flow.mark_destroyed();
        }
        let transactions: Vec<Arc<TxInner>> = self
            .transactions
            .lock()
            .drain()
            .filter_map(|(_, tx)| tx.upgrade())
            .collect();
        for tx in transactions {
            tx.mark_closed();
        }
        let failed = self.cache.lock().fail_all();
        for completion in failed {
            completion.notify();
        }
        info!(session = %self.connection.session_id(), "session closed");
    }
}

async fn run_context(
    inner: Arc<SessionInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    mut cache_timeouts: mpsc::UnboundedReceiver<u64>,
) {
    loop {
        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.on_connection_event(event).await,
                None => break,
            },
            Some(correlation) = cache_timeouts.recv() => inner.on_cache_timeout(correlation).await,
        }
    }
    inner.close();
}
