use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FlowSettings;
use crate::connection::{Connection, Lane};
use crate::flow::Endpoint;
use crate::message::Message;
use crate::session::FlowHandler;
use crate::session::handler::guarded;
use crate::transaction::TxInner;
use crate::transport::frame::{ClientFrame, FlowAck};
use crate::utils::error::{FlowError, RequestError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledged once the handler returns, or once `receive` hands the
    /// message out.
    Auto,
    #[default]
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Binding,
    Bound,
    Active,
    WindowBlocked,
    Unbinding,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub ack_mode: AckMode,
    /// Maximum unacknowledged messages; for browsers, the batch granted by
    /// each `start`.
    pub window: usize,
    pub browser: bool,
    /// Drop (and acknowledge) messages this session published itself.
    pub no_local: bool,
    /// Bind started. A stopped flow receives nothing until `start`.
    pub start: bool,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self::from_settings(&FlowSettings::default())
    }
}

impl FlowOptions {
    pub fn from_settings(settings: &FlowSettings) -> Self {
        Self {
            ack_mode: settings.ack_mode,
            window: settings.window_size.max(1),
            browser: false,
            no_local: false,
            start: true,
        }
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn browser(mut self) -> Self {
        self.browser = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn stopped(mut self) -> Self {
        self.start = false;
        self
    }
}

pub(crate) type FlowRegistry = Arc<Mutex<HashMap<u64, Flow>>>;

/// What a session hands over to bind a new flow.
pub(crate) struct FlowBinding {
    pub id: u64,
    pub endpoint: Endpoint,
    pub options: FlowOptions,
    pub handler: Option<Arc<dyn FlowHandler>>,
    pub transaction: Option<(u64, Weak<TxInner>)>,
}

/// Handle to a bound flow. Cloning yields another handle to the same flow.
#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

struct FlowInner {
    id: u64,
    endpoint: Endpoint,
    options: FlowOptions,
    session_id: String,
    connection: Connection,
    registry: Weak<Mutex<HashMap<u64, Flow>>>,
    handler: Option<Arc<dyn FlowHandler>>,
    transaction: Option<(u64, Weak<TxInner>)>,
    bind_timeout: Duration,
    core: Mutex<FlowCore>,
    // Entries carry the epoch they were queued in; older epochs are stale.
    queue_tx: mpsc::UnboundedSender<(u64, Message)>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, Message)>>,
    cancel: CancellationToken,
    received: AtomicU64,
}

struct FlowCore {
    state: FlowState,
    unacked: BTreeSet<u64>,
    started: bool,
    credit: usize,
    epoch: u64,
}

impl FlowCore {
    fn refresh(&mut self, options: &FlowOptions) {
        if !matches!(
            self.state,
            FlowState::Bound | FlowState::Active | FlowState::WindowBlocked
        ) {
            return;
        }
        let blocked = if options.browser {
            self.credit == 0
        } else {
            self.unacked.len() >= options.window
        };
        self.state = if blocked {
            FlowState::WindowBlocked
        } else {
            FlowState::Active
        };
    }
}

impl Flow {
    /// Registers the flow and binds it. The registry entry exists before the
    /// bind request goes out so that the first deliveries find it.
    pub(crate) async fn open(
        connection: Connection,
        registry: &FlowRegistry,
        bind_timeout: Duration,
        binding: FlowBinding,
    ) -> Result<Flow, FlowError> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let credit = if binding.options.start {
            binding.options.window
        } else {
            0
        };
        let flow = Flow {
            inner: Arc::new(FlowInner {
                id: binding.id,
                session_id: connection.session_id().to_string(),
                core: Mutex::new(FlowCore {
                    state: FlowState::Binding,
                    unacked: BTreeSet::new(),
                    started: binding.options.start,
                    credit,
                    epoch: 0,
                }),
                endpoint: binding.endpoint,
                options: binding.options,
                connection,
                registry: Arc::downgrade(registry),
                handler: binding.handler,
                transaction: binding.transaction,
                bind_timeout,
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                cancel: CancellationToken::new(),
                received: AtomicU64::new(0),
            }),
        };

        registry.lock().insert(flow.id(), flow.clone());
        match flow.bind(Lane::Regular).await {
            Ok(()) => {
                debug!(flow = flow.id(), endpoint = flow.endpoint().name(), "flow bound");
                Ok(flow)
            }
            Err(err) => {
                flow.mark_destroyed();
                Err(err)
            }
        }
    }

    async fn bind(&self, lane: Lane) -> Result<(), FlowError> {
        let inner = &self.inner;
        let started = {
            let mut core = inner.core.lock();
            core.state = FlowState::Binding;
            core.started
        };
        let endpoint = inner.endpoint.clone();
        let transaction = inner.transaction.as_ref().map(|(id, _)| *id);
        inner
            .connection
            .request_on(
                lane,
                |correlation| ClientFrame::Bind {
                    correlation,
                    flow_id: inner.id,
                    endpoint,
                    window: inner.options.window,
                    browser: inner.options.browser,
                    started,
                    transaction,
                },
                inner.bind_timeout,
            )
            .await?;

        let mut core = inner.core.lock();
        if core.state == FlowState::Binding {
            core.state = FlowState::Bound;
            // Deliveries may have raced the bind reply.
            if !core.unacked.is_empty() {
                core.refresh(&inner.options);
            }
        }
        Ok(())
    }

    /// Binds again after the connection was re-established. Everything that
    /// was outstanding is redelivered by the router.
    pub(crate) async fn rebind(&self) -> Result<(), FlowError> {
        self.reset_unacked();
        self.bind(Lane::Recovery).await
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &FlowOptions {
        &self.inner.options
    }

    pub fn state(&self) -> FlowState {
        self.inner.core.lock().state
    }

    /// Ids delivered to the application and not yet acknowledged, in order.
    pub fn unacked(&self) -> Vec<u64> {
        self.inner.core.lock().unacked.iter().copied().collect()
    }

    pub fn received_count(&self) -> u64 {
        self.inner.received.load(Ordering::Relaxed)
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.inner.transaction.as_ref().map(|(id, _)| *id)
    }

    pub fn has_handler(&self) -> bool {
        self.inner.handler.is_some()
    }

    /// Acknowledges `message_id`. Fire-and-forget: the ack is queued on the
    /// connection. On a transacted flow it is staged until the next commit.
    pub fn ack(&self, message_id: u64) -> Result<(), FlowError> {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock();
            if core.state == FlowState::Destroyed {
                return Err(FlowError::Destroyed);
            }
            if !core.unacked.remove(&message_id) {
                return Err(FlowError::UnknownMessage(message_id));
            }
            core.refresh(&inner.options);
        }

        let ack = FlowAck {
            flow_id: inner.id,
            message_id,
        };
        if let Some((_, tx)) = &inner.transaction {
            let staged = tx.upgrade().is_some_and(|tx| tx.stage_ack(ack));
            return if staged {
                Ok(())
            } else {
                Err(FlowError::Destroyed)
            };
        }
        inner.connection.enqueue(ClientFrame::Ack {
            flow_id: ack.flow_id,
            message_id: ack.message_id,
        })?;
        Ok(())
    }

    /// Waits up to `timeout` for the next message. Only available on flows
    /// created without a handler.
    pub async fn receive(&self, timeout: Duration) -> Result<Message, FlowError> {
        let inner = &self.inner;
        if inner.handler.is_some() {
            return Err(FlowError::HandlerRegistered);
        }
        if self.state() == FlowState::Destroyed {
            return Err(FlowError::Destroyed);
        }

        let deadline = Instant::now() + timeout;
        let mut queue = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(FlowError::Destroyed),
            guard = tokio::time::timeout_at(deadline, inner.queue_rx.lock()) => {
                guard.map_err(|_| FlowError::Timeout)?
            }
        };

        loop {
            let next = tokio::select! {
                _ = inner.cancel.cancelled() => return Err(FlowError::Destroyed),
                next = tokio::time::timeout_at(deadline, queue.recv()) => next,
            };
            let (epoch, message) = match next {
                Err(_) => return Err(FlowError::Timeout),
                Ok(None) => return Err(FlowError::Destroyed),
                Ok(Some(entry)) => entry,
            };
            if epoch != inner.core.lock().epoch {
                continue;
            }
            if inner.options.ack_mode == AckMode::Auto {
                if let Some(id) = message.message_id {
                    self.ack(id)?;
                }
            }
            return Ok(message);
        }
    }

    /// Pauses delivery.
    pub async fn stop(&self) -> Result<(), FlowError> {
        self.ensure_live()?;
        self.inner.core.lock().started = false;
        self.inner
            .connection
            .send(ClientFrame::Stop {
                flow_id: self.inner.id,
            })
            .await?;
        Ok(())
    }

    /// Resumes delivery. A browser is granted another `window` messages.
    pub async fn start(&self) -> Result<(), FlowError> {
        self.ensure_live()?;
        {
            let mut core = self.inner.core.lock();
            core.started = true;
            if self.inner.options.browser {
                core.credit = self.inner.options.window;
            }
            core.refresh(&self.inner.options);
        }
        self.inner
            .connection
            .send(ClientFrame::Start {
                flow_id: self.inner.id,
            })
            .await?;
        Ok(())
    }

    /// Unbinds the flow. It ends `Destroyed` once the router confirms or the
    /// bind timeout elapses.
    pub async fn destroy(&self) -> Result<(), FlowError> {
        {
            let mut core = self.inner.core.lock();
            if matches!(core.state, FlowState::Unbinding | FlowState::Destroyed) {
                return Ok(());
            }
            core.state = FlowState::Unbinding;
        }
        let flow_id = self.inner.id;
        let result = self
            .inner
            .connection
            .request(
                |correlation| ClientFrame::Unbind {
                    correlation: Some(correlation),
                    flow_id,
                },
                self.inner.bind_timeout,
            )
            .await;
        self.mark_destroyed();

        match result {
            Ok(_) | Err(RequestError::Cancelled) => Ok(()),
            Err(RequestError::Timeout) => {
                warn!(flow = flow_id, "unbind not confirmed before the timeout");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_live(&self) -> Result<(), FlowError> {
        match self.state() {
            FlowState::Unbinding | FlowState::Destroyed => Err(FlowError::Destroyed),
            _ => Ok(()),
        }
    }

    /// Hands a delivered message to the handler, or queues it for `receive`.
    pub(crate) async fn deliver(&self, message: Message) {
        let inner = &self.inner;
        let Some(message_id) = message.message_id else {
            warn!(flow = inner.id, "flow message without an id dropped");
            return;
        };
        let epoch = {
            let mut core = inner.core.lock();
            if matches!(core.state, FlowState::Unbinding | FlowState::Destroyed) {
                return;
            }
            core.unacked.insert(message_id);
            if inner.options.browser {
                core.credit = core.credit.saturating_sub(1);
            }
            core.refresh(&inner.options);
            core.epoch
        };
        inner.received.fetch_add(1, Ordering::Relaxed);

        if inner.options.no_local && message.origin.as_deref() == Some(inner.session_id.as_str()) {
            debug!(flow = inner.id, message_id, "no-local message discarded");
            if let Err(err) = self.ack(message_id) {
                debug!(flow = inner.id, "ack of discarded message failed: {err}");
            }
            return;
        }

        match &inner.handler {
            Some(handler) => {
                guarded("flow", handler.on_message(self, message)).await;
                if inner.options.ack_mode == AckMode::Auto {
                    if let Err(err) = self.ack(message_id) {
                        debug!(flow = inner.id, message_id, "auto-ack skipped: {err}");
                    }
                }
            }
            None => {
                let _ = inner.queue_tx.send((epoch, message));
            }
        }
    }

    /// Forgets everything outstanding; queued but unreceived messages become
    /// stale. Used after a rollback or a lost link, when the router
    /// redelivers.
    pub(crate) fn reset_unacked(&self) {
        let mut core = self.inner.core.lock();
        core.unacked.clear();
        core.epoch += 1;
        if self.inner.options.browser && core.started {
            core.credit = self.inner.options.window;
        }
        core.refresh(&self.inner.options);
    }

    pub(crate) fn mark_destroyed(&self) {
        self.inner.core.lock().state = FlowState::Destroyed;
        self.inner.cancel.cancel();
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.lock().remove(&self.inner.id);
        }
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("handler", &self.inner.handler.is_some())
            .finish()
    }
}
