//! Message spool of one durable or temporary endpoint.
//!
//! Messages are kept in id order. A consuming binding holds the messages it
//! was handed until it acknowledges them or lets go (unbind, rollback, lost
//! link), after which they are handed out again marked redelivered. Browsing
//! bindings walk the spool with a cursor and never hold anything.
//!
//! A topic endpoint has one active consumer at a time. Further consumers
//! wait on standby and the oldest is promoted when the active one goes.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::flow::Endpoint;
use crate::message::Message;
use crate::topic::TopicPattern;
use crate::transport::frame::{RejectCode, Rejection};

struct Spooled {
    message: Message,
    holder: Option<(String, u64)>,
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub session_id: String,
    pub flow_id: u64,
    pub window: usize,
    pub browser: bool,
    pub started: bool,
    pub transaction: Option<u64>,
    active: bool,
    credit: usize,
    cursor: u64,
    inflight: BTreeSet<u64>,
}

impl Binding {
    pub fn new(
        session_id: String,
        flow_id: u64,
        window: usize,
        browser: bool,
        started: bool,
        transaction: Option<u64>,
    ) -> Self {
        let window = window.max(1);
        Self {
            session_id,
            flow_id,
            window,
            browser,
            started,
            transaction,
            active: true,
            credit: if browser && started { window } else { 0 },
            cursor: 0,
            inflight: BTreeSet::new(),
        }
    }

    fn is(&self, session_id: &str, flow_id: u64) -> bool {
        self.session_id == session_id && self.flow_id == flow_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn consumes(&self) -> bool {
        !self.browser && self.active && self.started && self.inflight.len() < self.window
    }
}

pub(crate) struct Spool {
    endpoint: Endpoint,
    topic: Option<TopicPattern>,
    owner: Option<String>,
    messages: BTreeMap<u64, Spooled>,
    bindings: Vec<Binding>,
    next_binding: usize,
}

impl Spool {
    pub fn new(endpoint: Endpoint, owner: Option<String>) -> Result<Self, Rejection> {
        let topic = match &endpoint {
            Endpoint::TopicEndpoint { topic, .. } => Some(
                TopicPattern::parse(topic)
                    .map_err(|e| Rejection::new(RejectCode::InvalidTopic, e.to_string()))?,
            ),
            _ => None,
        };
        Ok(Self {
            endpoint,
            topic,
            owner,
            messages: BTreeMap::new(),
            bindings: Vec::new(),
            next_binding: 0,
        })
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Whether guaranteed messages published on `topic` land here.
    pub fn accepts_topic(&self, topic: &str) -> bool {
        self.topic.as_ref().is_some_and(|p| p.matches(topic))
    }

    pub fn depth(&self) -> usize {
        self.messages.len()
    }

    pub fn enqueue(&mut self, id: u64, mut message: Message) {
        message.message_id = Some(id);
        self.messages.insert(
            id,
            Spooled {
                message,
                holder: None,
            },
        );
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn binding(&self, session_id: &str, flow_id: u64) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.is(session_id, flow_id))
    }

    fn binding_mut(&mut self, session_id: &str, flow_id: u64) -> Option<&mut Binding> {
        self.bindings.iter_mut().find(|b| b.is(session_id, flow_id))
    }

    fn exclusive(&self) -> bool {
        matches!(self.endpoint, Endpoint::TopicEndpoint { .. })
    }

    /// Adds a binding. On an exclusive endpoint a second consumer is put on
    /// standby; the returned flag says whether the binding is active.
    pub fn bind(&mut self, mut binding: Binding) -> Result<bool, Rejection> {
        if let Some(owner) = &self.owner {
            if owner != &binding.session_id {
                return Err(Rejection::new(
                    RejectCode::PermissionDenied,
                    format!("'{}' belongs to another session", self.endpoint.name()),
                ));
            }
        }
        if self.exclusive() && !binding.browser {
            binding.active = !self.bindings.iter().any(|b| !b.browser && b.active);
        }
        let active = binding.active;
        self.bindings.push(binding);
        Ok(active)
    }

    /// Whether the endpoint reports active/standby changes to its consumers.
    pub fn indicates_activity(&self, binding: &Binding) -> bool {
        self.exclusive() && !binding.browser
    }

    /// Removes the binding; whatever it held is released for redelivery.
    /// Returns the standby consumer promoted in its place, if any.
    pub fn unbind(&mut self, session_id: &str, flow_id: u64) -> Option<(String, u64)> {
        self.release(session_id, flow_id);
        let index = self.bindings.iter().position(|b| b.is(session_id, flow_id))?;
        let removed = self.bindings.remove(index);
        self.next_binding = 0;
        if !(self.exclusive() && !removed.browser && removed.active) {
            return None;
        }
        let next = self.bindings.iter_mut().find(|b| !b.browser && !b.active)?;
        next.active = true;
        Some((next.session_id.clone(), next.flow_id))
    }

    /// Returns the messages held by a binding to the spool.
    pub fn release(&mut self, session_id: &str, flow_id: u64) {
        let Some(binding) = self.binding_mut(session_id, flow_id) else {
            return;
        };
        let held = std::mem::take(&mut binding.inflight);
        for id in held {
            if let Some(spooled) = self.messages.get_mut(&id) {
                spooled.holder = None;
                spooled.message.redelivered = true;
            }
        }
    }

    pub fn can_ack(&self, session_id: &str, flow_id: u64, message_id: u64) -> bool {
        match self.binding(session_id, flow_id) {
            Some(b) if b.browser => self.messages.contains_key(&message_id),
            Some(b) => b.inflight.contains(&message_id),
            None => false,
        }
    }

    /// Removes an acknowledged message. A browser may remove any message
    /// still spooled.
    pub fn ack(&mut self, session_id: &str, flow_id: u64, message_id: u64) -> Result<(), Rejection> {
        if !self.can_ack(session_id, flow_id, message_id) {
            return Err(Rejection::new(
                RejectCode::InvalidAck,
                format!("message {message_id} is not outstanding on flow {flow_id}"),
            ));
        }
        if let Some(Spooled {
            holder: Some((holder_session, holder_flow)),
            ..
        }) = self.messages.remove(&message_id)
        {
            if let Some(holder) = self.binding_mut(&holder_session, holder_flow) {
                holder.inflight.remove(&message_id);
            }
        }
        Ok(())
    }

    pub fn set_started(&mut self, session_id: &str, flow_id: u64, started: bool) -> bool {
        let Some(binding) = self.binding_mut(session_id, flow_id) else {
            return false;
        };
        binding.started = started;
        if started && binding.browser {
            binding.credit = binding.window;
        }
        true
    }

    /// Hands out whatever the bindings have room for: unheld messages to
    /// consumers in turn, then the next batch to each browser.
    pub fn pump(&mut self) -> Vec<(String, u64, Message)> {
        let mut out = Vec::new();

        let free: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, m)| m.holder.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in free {
            let count = self.bindings.len();
            let chosen = (0..count)
                .map(|step| (self.next_binding + step) % count)
                .find(|&i| self.bindings[i].consumes());
            let Some(index) = chosen else {
                break;
            };
            self.next_binding = (index + 1) % count;

            let binding = &mut self.bindings[index];
            let Some(spooled) = self.messages.get_mut(&id) else {
                continue;
            };
            binding.inflight.insert(id);
            spooled.holder = Some((binding.session_id.clone(), binding.flow_id));
            out.push((binding.session_id.clone(), binding.flow_id, spooled.message.clone()));
        }

        let messages = &self.messages;
        for binding in self.bindings.iter_mut().filter(|b| b.browser && b.started) {
            while binding.credit > 0 {
                let next = messages
                    .range((Bound::Excluded(binding.cursor), Bound::Unbounded))
                    .next();
                let Some((id, spooled)) = next else {
                    break;
                };
                binding.cursor = *id;
                binding.credit -= 1;
                out.push((binding.session_id.clone(), binding.flow_id, spooled.message.clone()));
            }
        }
        out
    }
}
