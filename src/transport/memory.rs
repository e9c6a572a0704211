use async_trait::async_trait;

use crate::router::Router;
use crate::transport::{Link, Transport};
use crate::utils::error::TransportError;

/// Connects sessions to a [`Router`] living in the same process.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    router: Router,
}

impl MemoryTransport {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Link, TransportError> {
        self.router.attach()
    }

    fn describe(&self) -> String {
        "memory://router".to_string()
    }
}
