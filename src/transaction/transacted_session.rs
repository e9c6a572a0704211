use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::Lane;
use crate::flow::{Endpoint, Flow, FlowOptions};
use crate::message::{Destination, Message};
use crate::session::FlowHandler;
use crate::session::session::SessionInner;
use crate::topic::validate_publish_topic;
use crate::transport::frame::{ClientFrame, FlowAck, RejectCode, Rejection};
use crate::utils::error::TransactionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RolledBack,
}

/// Handle to a transacted session. Clones share the same transaction.
#[derive(Clone)]
pub struct TransactedSession {
    inner: Arc<TxInner>,
}

pub(crate) struct TxInner {
    id: u64,
    session: Arc<SessionInner>,
    core: Mutex<TxCore>,
}

struct TxCore {
    state: TransactionState,
    sends: Vec<Message>,
    acks: Vec<FlowAck>,
    flows: Vec<Flow>,
    // Staged work was lost with the link; the next commit must fail.
    interrupted: bool,
    closed: bool,
}

impl TxInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Stages an acknowledgement from an enlisted flow. False once closed.
    pub(crate) fn stage_ack(&self, ack: FlowAck) -> bool {
        let mut core = self.core.lock();
        if core.closed {
            return false;
        }
        core.acks.push(ack);
        core.state = TransactionState::Open;
        true
    }

    /// Opens the transaction on the router again after a reconnect.
    pub(crate) async fn reopen(&self) -> Result<(), TransactionError> {
        {
            let mut core = self.core.lock();
            if core.closed {
                return Ok(());
            }
            if !core.sends.is_empty() || !core.acks.is_empty() {
                core.sends.clear();
                core.acks.clear();
                core.interrupted = true;
            }
        }
        open_on_router(&self.session, self.id, Lane::Recovery).await
    }

    /// Local teardown; enlisted flows are dropped with the transaction.
    pub(crate) fn mark_closed(&self) -> Vec<Flow> {
        let mut core = self.core.lock();
        core.closed = true;
        core.sends.clear();
        core.acks.clear();
        std::mem::take(&mut core.flows)
    }

    fn set_state(&self, state: TransactionState) {
        self.core.lock().state = state;
    }
}

async fn open_on_router(session: &SessionInner, id: u64, lane: Lane) -> Result<(), TransactionError> {
    session
        .connection
        .request_on(
            lane,
            |correlation| ClientFrame::OpenTransaction {
                correlation,
                transaction: id,
            },
            session.settings.ack_timeout(),
        )
        .await
        .map(|_| ())
        .map_err(|err| TransactionError::from_request(err, |_| TransactionError::Closed))
}

impl TransactedSession {
    pub(crate) async fn open(session: Arc<SessionInner>) -> Result<Self, TransactionError> {
        let id = session.next_transaction_id();
        open_on_router(&session, id, Lane::Regular).await?;

        let inner = Arc::new(TxInner {
            id,
            session: session.clone(),
            core: Mutex::new(TxCore {
                state: TransactionState::Open,
                sends: Vec::new(),
                acks: Vec::new(),
                flows: Vec::new(),
                interrupted: false,
                closed: false,
            }),
        });
        session.register_transaction(&inner);
        debug!(transaction = id, "transacted session opened");
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> TransactionState {
        self.inner.core.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.inner.core.lock().closed
    }

    /// Sends and acknowledgements staged since the last commit or rollback.
    pub fn staged(&self) -> (usize, usize) {
        let core = self.inner.core.lock();
        (core.sends.len(), core.acks.len())
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.inner.core.lock().closed {
            return Err(TransactionError::Closed);
        }
        Ok(())
    }

    /// Binds a flow whose acknowledgements belong to this transaction.
    pub async fn create_flow(
        &self,
        endpoint: Endpoint,
        options: FlowOptions,
        handler: Option<Arc<dyn FlowHandler>>,
    ) -> Result<Flow, TransactionError> {
        self.ensure_open()?;
        let flow = self
            .inner
            .session
            .open_flow(
                endpoint,
                options,
                handler,
                Some((self.inner.id, Arc::downgrade(&self.inner))),
            )
            .await?;
        self.inner.core.lock().flows.push(flow.clone());
        Ok(flow)
    }

    /// Stages a guaranteed send. It stays invisible until `commit`.
    pub fn send_msg(&self, mut message: Message) -> Result<(), TransactionError> {
        self.ensure_open()?;
        if !message.delivery_mode.is_guaranteed() {
            return Err(TransactionError::DirectSend);
        }
        if let Destination::Topic(topic) = &message.destination {
            validate_publish_topic(topic)?;
        }
        self.inner.session.prepare(&mut message);

        let mut core = self.inner.core.lock();
        core.sends.push(message);
        core.state = TransactionState::Open;
        Ok(())
    }

    /// Receives from an enlisted flow created without a handler.
    pub async fn receive_msg(&self, flow: &Flow, timeout: Duration) -> Result<Message, TransactionError> {
        self.ensure_open()?;
        if flow.transaction_id() != Some(self.inner.id) {
            return Err(TransactionError::NotEnlisted(flow.id()));
        }
        Ok(flow.receive(timeout).await?)
    }

    /// Commits everything staged since the last commit or rollback as one
    /// unit. On any error the staged work must be treated as failed; the
    /// state is then `RolledBack`.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        let inner = &self.inner;
        let (sends, acks) = {
            let mut core = inner.core.lock();
            if core.closed {
                return Err(TransactionError::Closed);
            }
            if core.interrupted {
                core.interrupted = false;
                core.state = TransactionState::RolledBack;
                return Err(TransactionError::CommitFailed(Rejection::new(
                    RejectCode::UnknownTransaction,
                    "transaction interrupted by a reconnect",
                )));
            }
            core.state = TransactionState::Committing;
            (std::mem::take(&mut core.sends), std::mem::take(&mut core.acks))
        };
        let (send_count, ack_count) = (sends.len(), acks.len());

        let result = inner
            .session
            .connection
            .request(
                |correlation| ClientFrame::Commit {
                    correlation,
                    transaction: inner.id,
                    sends,
                    acks,
                },
                inner.session.settings.ack_timeout(),
            )
            .await;

        match result {
            Ok(_) => {
                inner.set_state(TransactionState::Committed);
                debug!(
                    transaction = inner.id,
                    sends = send_count,
                    acks = ack_count,
                    "committed"
                );
                Ok(())
            }
            Err(err) => {
                inner.set_state(TransactionState::RolledBack);
                warn!(transaction = inner.id, "commit failed: {err}");
                Err(TransactionError::from_request(
                    err,
                    TransactionError::CommitFailed,
                ))
            }
        }
    }

    /// Discards staged sends; consumed but uncommitted messages are
    /// redelivered.
    pub async fn rollback(&self) -> Result<(), TransactionError> {
        let inner = &self.inner;
        {
            let mut core = inner.core.lock();
            if core.closed {
                return Err(TransactionError::Closed);
            }
            core.sends.clear();
            core.acks.clear();
            core.interrupted = false;
        }

        let result = inner
            .session
            .connection
            .request(
                |correlation| ClientFrame::Rollback {
                    correlation,
                    transaction: inner.id,
                },
                inner.session.settings.ack_timeout(),
            )
            .await;
        inner.set_state(TransactionState::RolledBack);
        result
            .map(|_| ())
            .map_err(|err| TransactionError::from_request(err, TransactionError::RollbackFailed))
    }

    /// Destroys the enlisted flows and ends the transaction. Anything staged
    /// is discarded.
    pub async fn close(&self) -> Result<(), TransactionError> {
        let inner = &self.inner;
        if inner.core.lock().closed {
            return Ok(());
        }
        let flows = inner.mark_closed();
        for flow in flows {
            if let Err(err) = flow.destroy().await {
                warn!(flow = flow.id(), "flow teardown failed: {err}");
            }
        }
        if let Err(err) = inner
            .session
            .connection
            .send(ClientFrame::CloseTransaction {
                transaction: inner.id,
            })
            .await
        {
            warn!(transaction = inner.id, "close not sent: {err}");
        }
        inner.session.forget_transaction(inner.id);
        info!(transaction = inner.id, "transacted session closed");
        Ok(())
    }
}

impl std::fmt::Debug for TransactedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactedSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
