//! The `transport` module is responsible for moving frames between a session
//! and the router.
//!
//! It defines the frame protocol, the [`Transport`] seam a `Connection` opens
//! links through, and two implementations: WebSocket (client and server side)
//! and an in-memory transport attached directly to an in-process router.

pub mod frame;
pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::utils::error::TransportError;
use frame::{ClientFrame, ServerFrame};

pub use memory::MemoryTransport;
pub use websocket::{WebSocketTransport, start_websocket_server};

/// One open link to the router. The inbound receiver yielding `None` means the
/// link is gone.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a fresh link. Called once per connect or reconnect attempt.
    async fn open(&self) -> Result<Link, TransportError>;

    /// Human readable endpoint description for logs.
    fn describe(&self) -> String;
}
