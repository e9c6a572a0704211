//! The `router` module is the message router sessions connect to.
//!
//! A [`Router`] is a cheap clonable handle around the shared [`engine`]
//! state. Every transport ends up calling [`Router::attach`], which hands back
//! a [`Link`] and spawns a task that serves the frames arriving on it.

mod client;
pub(crate) mod engine;
mod spool;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RouterSettings;
use crate::flow::Endpoint;
use crate::transport::Link;
use crate::transport::frame::{ClientFrame, Rejection, ServerFrame};
use crate::utils::error::{RouterError, TransportError};
use engine::Engine;

#[derive(Clone)]
pub struct Router {
    engine: Arc<Mutex<Engine>>,
    next_link: Arc<AtomicU64>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("clients", &self.client_count())
            .finish()
    }
}

impl Router {
    pub fn new(settings: RouterSettings) -> Result<Self, RouterError> {
        Ok(Self {
            engine: Arc::new(Mutex::new(Engine::new(settings)?)),
            next_link: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Opens a new link. Fails while the router refuses connections.
    pub fn attach(&self) -> Result<Link, TransportError> {
        if !self.engine.lock().accepting() {
            return Err(TransportError::Refused("router".to_string()));
        }
        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (client_tx, client_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (server_tx, server_rx) = mpsc::unbounded_channel::<ServerFrame>();

        tokio::spawn(serve_link(self.engine.clone(), link_id, client_rx, server_tx));

        Ok(Link {
            outbound: client_tx,
            inbound: server_rx,
        })
    }

    /// Stops (or resumes) accepting new links. Existing links are unaffected.
    pub fn set_accepting(&self, accepting: bool) {
        self.engine.lock().set_accepting(accepting);
    }

    /// Drops a session's current link as if it had failed. Returns false if
    /// the session is not connected.
    pub fn disconnect_client(&self, session_id: &str) -> bool {
        self.engine.lock().kick(session_id)
    }

    /// Provisions a durable endpoint from the router side.
    pub fn provision(&self, endpoint: Endpoint) -> Result<(), Rejection> {
        self.engine.lock().provision(endpoint, true)
    }

    pub fn subscriptions(&self, session_id: &str) -> Vec<String> {
        self.engine.lock().subscriptions(session_id)
    }

    /// Messages spooled on `name`, including ones handed out but not yet
    /// acknowledged.
    pub fn endpoint_depth(&self, name: &str) -> Option<usize> {
        self.engine.lock().endpoint_depth(name)
    }

    pub fn client_count(&self) -> usize {
        self.engine.lock().client_count()
    }
}

async fn serve_link(
    engine: Arc<Mutex<Engine>>,
    link_id: u64,
    mut frames: mpsc::UnboundedReceiver<ClientFrame>,
    sender: mpsc::UnboundedSender<ServerFrame>,
) {
    let session_id = match frames.recv().await {
        Some(ClientFrame::Login {
            session_id,
            username,
            password,
            client_name,
            ..
        }) => {
            let mut engine = engine.lock();
            if !engine.authenticate(&username, &password) {
                warn!(link = link_id, user = %username, "login rejected");
                let _ = sender.send(ServerFrame::Error {
                    message: "invalid credentials".to_string(),
                });
                return;
            }
            engine.login(&session_id, link_id, sender);
            info!(link = link_id, session = %session_id, client = %client_name, "session logged in");
            session_id
        }
        Some(_) => {
            let _ = sender.send(ServerFrame::Error {
                message: "must authenticate first".to_string(),
            });
            return;
        }
        None => return,
    };

    let mut logout = false;
    while let Some(frame) = frames.recv().await {
        if let ClientFrame::Logout = frame {
            logout = true;
            break;
        }
        engine.lock().handle(&session_id, link_id, frame);
    }

    engine.lock().detach(&session_id, link_id, logout);
    debug!(link = link_id, session = %session_id, logout, "link closed");
}

#[cfg(test)]
mod tests;
