use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::session::MessageHandler;
use crate::topic::TopicPattern;
use crate::utils::error::SubscribeError;

/// When the session default handler sees a message that a dispatch handler
/// already took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultHandlerPolicy {
    /// Only messages no dispatch handler matched.
    #[default]
    Fallback,
    /// Every message, in addition to any dispatch handlers.
    Always,
}

struct Registration {
    pattern: TopicPattern,
    handler: Option<Arc<dyn MessageHandler>>,
    local_only: bool,
}

impl Registration {
    fn is(
        &self,
        pattern: &TopicPattern,
        handler: &Option<Arc<dyn MessageHandler>>,
        local_only: bool,
    ) -> bool {
        let same_handler = match (&self.handler, handler) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        &self.pattern == pattern && self.local_only == local_only && same_handler
    }
}

/// Handlers chosen for one inbound message.
pub struct Routed {
    pub handlers: Vec<Arc<dyn MessageHandler>>,
    pub to_default: bool,
}

/// The subscription table of a session.
///
/// Registrations without a handler are plain subscriptions whose messages go
/// to the default handler. The router is told about a pattern only on its
/// first broker-registered use and forgets it on the last.
pub struct Dispatcher {
    registrations: Vec<Registration>,
    broker_refs: HashMap<String, usize>,
    policy: DefaultHandlerPolicy,
}

impl Dispatcher {
    pub fn new(policy: DefaultHandlerPolicy) -> Self {
        Self {
            registrations: Vec::new(),
            broker_refs: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> DefaultHandlerPolicy {
        self.policy
    }

    /// Adds a registration. Returns true when the router must be asked to
    /// subscribe.
    pub fn add(
        &mut self,
        pattern: TopicPattern,
        handler: Option<Arc<dyn MessageHandler>>,
        local_only: bool,
    ) -> Result<bool, SubscribeError> {
        let duplicate = self
            .registrations
            .iter()
            .any(|r| r.is(&pattern, &handler, local_only));
        if duplicate {
            return Err(SubscribeError::Duplicate(pattern.to_string()));
        }

        let mut first_broker_use = false;
        if !local_only {
            let refs = self.broker_refs.entry(pattern.to_string()).or_insert(0);
            *refs += 1;
            first_broker_use = *refs == 1;
        }
        self.registrations.push(Registration {
            pattern,
            handler,
            local_only,
        });
        Ok(first_broker_use)
    }

    /// Removes every registration of `pattern`. Returns true when the router
    /// must be asked to unsubscribe.
    pub fn remove(&mut self, pattern: &TopicPattern) -> Result<bool, SubscribeError> {
        let before = self.registrations.len();
        self.registrations.retain(|r| &r.pattern != pattern);
        if self.registrations.len() == before {
            return Err(SubscribeError::NotFound(pattern.to_string()));
        }
        Ok(self.broker_refs.remove(pattern.as_str()).is_some())
    }

    /// Undoes one `add`, e.g. after the router refused the subscription.
    pub fn remove_one(
        &mut self,
        pattern: &TopicPattern,
        handler: &Option<Arc<dyn MessageHandler>>,
        local_only: bool,
    ) {
        let position = self
            .registrations
            .iter()
            .position(|r| r.is(pattern, handler, local_only));
        let Some(position) = position else {
            return;
        };
        self.registrations.remove(position);
        if !local_only {
            if let Some(refs) = self.broker_refs.get_mut(pattern.as_str()) {
                *refs -= 1;
                if *refs == 0 {
                    self.broker_refs.remove(pattern.as_str());
                }
            }
        }
    }

    pub fn contains(&self, pattern: &TopicPattern) -> bool {
        self.registrations.iter().any(|r| &r.pattern == pattern)
    }

    /// Patterns the router must hold for this session, e.g. to reapply after
    /// a reconnect.
    pub fn broker_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.broker_refs.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    pub fn route(&self, topic: Option<&str>) -> Routed {
        let handlers: Vec<Arc<dyn MessageHandler>> = match topic {
            Some(topic) => self
                .registrations
                .iter()
                .filter(|r| r.pattern.matches(topic))
                .filter_map(|r| r.handler.clone())
                .collect(),
            None => Vec::new(),
        };
        let to_default = match self.policy {
            DefaultHandlerPolicy::Fallback => handlers.is_empty(),
            DefaultHandlerPolicy::Always => true,
        };
        Routed {
            handlers,
            to_default,
        }
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
