use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::transport::frame::{ClientFrame, Outcome, ServerFrame};
use crate::transport::{Link, Transport};
use crate::utils::error::{ConnectError, RequestError, SendError, TransportError};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

impl Backoff {
    /// Delay before retry `attempt` (1-based), never more than 30 seconds.
    pub fn delay(self, base: Duration, attempt: u32) -> Duration {
        let delay = match self {
            Self::Fixed => base,
            Self::Exponential => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        };
        delay.min(MAX_RETRY_DELAY)
    }
}

/// What the driver reports to the owning session. Replies to correlated
/// requests never show up here; they are resolved on the driver.
#[derive(Debug)]
pub enum ConnectionEvent {
    Frame(ServerFrame),
    Reconnecting,
    /// The link is back. Regular sends stay queued until the owner has
    /// restored its state and called [`Connection::resume`].
    Reconnected,
    Down(ConnectError),
}

/// The path a frame takes to the link. After a reconnect the regular queue
/// is held until [`Connection::resume`]; recovery frames go out at once so
/// router state is restored before anything queued meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Regular,
    Recovery,
}

enum Control {
    Frame(ClientFrame),
    Resume,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Outcome>>>>;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    session_id: String,
    settings: SessionSettings,
    outbound: mpsc::Sender<ClientFrame>,
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<TransportState>,
    pending: PendingMap,
    next_correlation: AtomicU64,
    cancel: CancellationToken,
}

enum HandshakeError {
    Auth(String),
    Transport(TransportError),
}

impl From<TransportError> for HandshakeError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl Connection {
    /// Opens a link and logs in, trying `connect_retries + 1` times.
    pub async fn connect(
        settings: &SessionSettings,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Connection, ConnectError> {
        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);

        let mut dialer = Dialer {
            settings: settings.clone(),
            transport,
            session_id: session_id.clone(),
            cancel: cancel.clone(),
        };
        let link = match dialer.establish(settings.connect_retries + 1, false).await {
            Ok(link) => link,
            Err(err) => {
                let _ = state_tx.send(TransportState::Disconnected);
                return Err(err);
            }
        };
        let _ = state_tx.send(TransportState::Connected);
        info!(session = %session_id, endpoint = %dialer.transport.describe(), "connected");

        let (outbound, outbound_rx) = mpsc::channel(settings.send_queue_capacity.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let driver = Driver {
            dialer,
            link,
            outbound_rx,
            control_rx,
            pending: pending.clone(),
            state: state_tx,
            events,
        };
        tokio::spawn(driver.run());

        Ok(Connection {
            inner: Arc::new(ConnectionInner {
                session_id,
                settings: settings.clone(),
                outbound,
                control,
                state: state_rx,
                pending,
                next_correlation: AtomicU64::new(1),
                cancel,
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> TransportState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled() || self.inner.outbound.is_closed()
    }

    pub fn next_correlation(&self) -> u64 {
        self.inner.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues `frame`, waiting at most `send_timeout` for room. While the
    /// link is being re-established the queue is not drained, so this is
    /// where callers feel a long outage.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), SendError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        match tokio::time::timeout(self.inner.settings.send_timeout(), self.inner.outbound.send(frame))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    /// Sends `frame` through `lane`. Recovery frames are never held back.
    pub async fn send_on(&self, lane: Lane, frame: ClientFrame) -> Result<(), SendError> {
        match lane {
            Lane::Regular => self.send(frame).await,
            Lane::Recovery => {
                if self.inner.cancel.is_cancelled() {
                    return Err(SendError::Closed);
                }
                self.inner
                    .control
                    .send(Control::Frame(frame))
                    .map_err(|_| SendError::Closed)
            }
        }
    }

    /// Releases the regular queue held since the last reconnect.
    pub fn resume(&self) {
        let _ = self.inner.control.send(Control::Resume);
    }

    /// Queues `frame` without waiting.
    pub fn enqueue(&self, frame: ClientFrame) -> Result<(), SendError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.inner.outbound.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Sends the frame built for a fresh correlation number and waits up to
    /// `timeout` for the matching reply.
    pub async fn request<F>(&self, build: F, timeout: Duration) -> Result<Outcome, RequestError>
    where
        F: FnOnce(u64) -> ClientFrame,
    {
        self.request_on(Lane::Regular, build, timeout).await
    }

    /// [`request`](Self::request) through a chosen lane.
    pub async fn request_on<F>(
        &self,
        lane: Lane,
        build: F,
        timeout: Duration,
    ) -> Result<Outcome, RequestError>
    where
        F: FnOnce(u64) -> ClientFrame,
    {
        let correlation = self.next_correlation();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(correlation, tx);

        if let Err(err) = self.send_on(lane, build(correlation)).await {
            self.inner.pending.lock().remove(&correlation);
            return Err(err.into());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Outcome::Rejected(rejection))) => Err(RequestError::Rejected(rejection)),
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(RequestError::Cancelled),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Logs out and stops the driver. Outstanding requests complete with
    /// `Cancelled`.
    pub fn disconnect(&self) {
        if !self.inner.cancel.is_cancelled() {
            debug!(session = %self.inner.session_id, "disconnect requested");
            self.inner.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session_id", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

struct Dialer {
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    session_id: String,
    cancel: CancellationToken,
}

impl Dialer {
    /// Makes up to `attempts` attempts. Authentication failures end the loop
    /// at once.
    async fn establish(&mut self, attempts: u32, delay_first: bool) -> Result<Link, ConnectError> {
        let mut reason = "no attempt made".to_string();
        for attempt in 1..=attempts {
            if attempt > 1 || delay_first {
                let retry = if delay_first { attempt } else { attempt - 1 };
                let delay = self.settings.retry_delay(retry);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(attempt, endpoint = %self.transport.describe(), "connecting");

            let handshake = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
                res = tokio::time::timeout(self.settings.connect_timeout(), self.handshake()) => res,
            };
            match handshake {
                Ok(Ok(link)) => return Ok(link),
                Ok(Err(HandshakeError::Auth(message))) => {
                    error!(session = %self.session_id, "login rejected: {message}");
                    return Err(ConnectError::Auth(message));
                }
                Ok(Err(HandshakeError::Transport(err))) => {
                    warn!(attempt, "connect attempt failed: {err}");
                    reason = err.to_string();
                }
                Err(_) => {
                    warn!(attempt, "connect attempt timed out");
                    reason = "login timed out".to_string();
                }
            }
        }
        Err(ConnectError::ConnectFailed { attempts, reason })
    }

    async fn handshake(&self) -> Result<Link, HandshakeError> {
        let mut link = self.transport.open().await?;
        let settings = &self.settings;
        link.outbound
            .send(ClientFrame::Login {
                session_id: self.session_id.clone(),
                username: settings.username.clone(),
                password: settings.password.clone(),
                vpn: settings.vpn.clone(),
                client_name: settings.client_name.clone(),
                compression_level: settings.compression_level,
            })
            .map_err(|_| TransportError::Closed)?;

        match link.inbound.recv().await {
            Some(ServerFrame::LoginResponse { .. }) => Ok(link),
            Some(ServerFrame::Error { message }) => Err(HandshakeError::Auth(message)),
            Some(other) => Err(TransportError::Refused(format!("unexpected {other:?}")).into()),
            None => Err(TransportError::Closed.into()),
        }
    }
}

struct Driver {
    dialer: Dialer,
    link: Link,
    outbound_rx: mpsc::Receiver<ClientFrame>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    pending: PendingMap,
    state: watch::Sender<TransportState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Driver {
    async fn run(mut self) {
        let session = self.dialer.session_id.clone();
        // A frame taken off the queue when the link died; resent first.
        let mut stashed: Option<ClientFrame> = None;
        // Set by a reconnect, cleared by `Control::Resume`.
        let mut held = false;

        loop {
            loop {
                tokio::select! {
                    _ = self.dialer.cancel.cancelled() => {
                        let _ = self.link.outbound.send(ClientFrame::Logout);
                        info!(session = %session, "disconnected");
                        self.finish();
                        return;
                    }
                    control = self.control_rx.recv() => match control {
                        Some(Control::Frame(frame)) => {
                            // A recovery frame lost with the link is redone by
                            // the next recovery.
                            if self.link.outbound.send(frame).is_err() {
                                break;
                            }
                        }
                        Some(Control::Resume) if held => {
                            held = false;
                            debug!(session = %session, "send queue resumed");
                            if let Some(frame) = stashed.take() {
                                if let Err(lost) = self.link.outbound.send(frame) {
                                    stashed = Some(lost.0);
                                    break;
                                }
                            }
                        }
                        Some(Control::Resume) => {}
                        None => {
                            let _ = self.link.outbound.send(ClientFrame::Logout);
                            self.finish();
                            return;
                        }
                    },
                    frame = self.outbound_rx.recv(), if !held => match frame {
                        Some(frame) => {
                            if let Err(lost) = self.link.outbound.send(frame) {
                                stashed = Some(lost.0);
                                break;
                            }
                        }
                        None => {
                            debug!(session = %session, "all connection handles dropped");
                            let _ = self.link.outbound.send(ClientFrame::Logout);
                            self.finish();
                            return;
                        }
                    },
                    frame = self.link.inbound.recv() => match frame {
                        Some(ServerFrame::Reply { correlation, outcome }) => {
                            match self.pending.lock().remove(&correlation) {
                                Some(waiter) => {
                                    let _ = waiter.send(outcome);
                                }
                                None => debug!(correlation, "reply for an abandoned request"),
                            }
                        }
                        Some(frame) => {
                            let _ = self.events.send(ConnectionEvent::Frame(frame));
                        }
                        None => break,
                    },
                }
            }

            warn!(session = %session, "link lost, reconnecting");
            let _ = self.state.send(TransportState::Reconnecting);
            let _ = self.events.send(ConnectionEvent::Reconnecting);

            let attempts = self.dialer.settings.reconnect_retries;
            match self.dialer.establish(attempts, true).await {
                Ok(link) => {
                    self.link = link;
                    let _ = self.state.send(TransportState::Connected);
                    // Whatever was meant for the old link is stale.
                    while self.control_rx.try_recv().is_ok() {}
                    held = true;
                    info!(session = %session, "reconnected, send queue held until recovery");
                    let _ = self.events.send(ConnectionEvent::Reconnected);
                }
                Err(err) => {
                    error!(session = %session, "giving up: {err}");
                    self.finish();
                    let _ = self.events.send(ConnectionEvent::Down(err));
                    return;
                }
            }
        }
    }

    fn finish(&mut self) {
        let _ = self.state.send(TransportState::Disconnected);
        self.outbound_rx.close();
        self.control_rx.close();
        // Dropping the waiters completes their requests with `Cancelled`.
        self.pending.lock().clear();
    }
}
