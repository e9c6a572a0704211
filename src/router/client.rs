use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::UnboundedSender;

use crate::topic::TopicPattern;
use crate::transport::frame::ServerFrame;

/// A logged-in session as the router sees it.
///
/// `link_id` identifies the link the session is currently attached through;
/// frames and detaches from an older link of the same session are ignored.
#[derive(Debug)]
pub(crate) struct Client {
    pub link_id: u64,
    pub sender: UnboundedSender<ServerFrame>,
    pub subscriptions: Vec<TopicPattern>,
    /// Flow id to the name of the endpoint it is bound to.
    pub flows: HashMap<u64, String>,
    pub transactions: HashSet<u64>,
}

impl Client {
    pub fn new(link_id: u64, sender: UnboundedSender<ServerFrame>) -> Self {
        Self {
            link_id,
            sender,
            subscriptions: Vec::new(),
            flows: HashMap::new(),
            transactions: HashSet::new(),
        }
    }

    pub fn send(&self, frame: ServerFrame) {
        // A closed sender means the link is going away; its detach cleans up.
        let _ = self.sender.send(frame);
    }

    pub fn subscribe(&mut self, pattern: TopicPattern) {
        if !self.subscriptions.contains(&pattern) {
            self.subscriptions.push(pattern);
        }
    }

    pub fn unsubscribe(&mut self, pattern: &TopicPattern) {
        self.subscriptions.retain(|p| p != pattern);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|p| p.matches(topic))
    }
}
