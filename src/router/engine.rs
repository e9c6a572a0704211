//! Router engine
//!
//! The synchronous core of the in-process router:
//! - registry of logged-in sessions and their topic subscriptions
//! - fan-out of topic publishes to subscribed sessions
//! - spools for queues, topic endpoints and temporary queues, and the flows
//!   bound to them
//! - transactions, applied all-or-nothing on commit
//! - topic history for cache requests, via `Persistence`
//!
//! It is held behind `Arc<Mutex<Engine>>` by [`Router`](super::Router);
//! nothing here awaits, so the lock is never held across I/O.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RouterSettings;
use crate::flow::Endpoint;
use crate::message::{Destination, Message};
use crate::persistence::Persistence;
use crate::router::client::Client;
use crate::router::spool::{Binding, Spool};
use crate::topic::{TopicPattern, validate_publish_topic};
use crate::transport::frame::{ClientFrame, FlowAck, Outcome, RejectCode, Rejection, ServerFrame};
use crate::utils::error::RouterError;

/// Where an accepted publish goes.
struct Route {
    clients: Vec<String>,
    spools: Vec<String>,
}

pub(crate) struct Engine {
    settings: RouterSettings,
    clients: HashMap<String, Client>,
    spools: HashMap<String, Spool>,
    history: Persistence,
    next_message_id: u64,
    accepting: bool,
}

impl Engine {
    pub fn new(settings: RouterSettings) -> Result<Self, RouterError> {
        let history = Persistence::open(
            settings.cache_path.as_deref(),
            settings.cache_ttl_secs,
            settings.cache_max_messages_per_topic,
        )?;
        Ok(Self {
            settings,
            clients: HashMap::new(),
            spools: HashMap::new(),
            history,
            next_message_id: 1,
            accepting: true,
        })
    }

    pub fn accepting(&self) -> bool {
        self.accepting
    }

    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.settings.credentials.is_empty()
            || self
                .settings
                .credentials
                .get(username)
                .is_some_and(|expected| expected == password)
    }

    /// Registers a session. A session logging in again replaces its older
    /// link, which lets go of everything that link held.
    pub fn login(&mut self, session_id: &str, link_id: u64, sender: UnboundedSender<ServerFrame>) {
        if self.clients.contains_key(session_id) {
            debug!(session = %session_id, "session logged in again, replacing old link");
            self.drop_client(session_id, false);
        }
        let client = Client::new(link_id, sender);
        client.send(ServerFrame::LoginResponse {
            session_id: session_id.to_string(),
        });
        self.clients.insert(session_id.to_string(), client);
    }

    /// The link `link_id` of `session_id` is gone. On logout the session's
    /// temporary queues go too.
    pub fn detach(&mut self, session_id: &str, link_id: u64, logout: bool) {
        let current = self
            .clients
            .get(session_id)
            .is_some_and(|c| c.link_id == link_id);
        if current {
            self.drop_client(session_id, logout);
            self.pump();
        }
    }

    /// Drops a session as if its link had failed.
    pub fn kick(&mut self, session_id: &str) -> bool {
        if !self.clients.contains_key(session_id) {
            return false;
        }
        self.drop_client(session_id, false);
        self.pump();
        true
    }

    fn drop_client(&mut self, session_id: &str, logout: bool) {
        let Some(client) = self.clients.remove(session_id) else {
            return;
        };
        for (flow_id, spool_name) in &client.flows {
            let promoted = self
                .spools
                .get_mut(spool_name)
                .and_then(|spool| spool.unbind(session_id, *flow_id));
            self.activate(promoted);
        }
        if logout {
            self.spools.retain(|_, spool| spool.owner() != Some(session_id));
        }
        info!(session = %session_id, logout, "client cleaned up");
    }

    pub fn subscriptions(&self, session_id: &str) -> Vec<String> {
        self.clients
            .get(session_id)
            .map(|c| c.subscriptions.iter().map(|p| p.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn endpoint_depth(&self, name: &str) -> Option<usize> {
        self.spools.get(name).map(Spool::depth)
    }

    pub fn provision(&mut self, endpoint: Endpoint, ignore_exists: bool) -> Result<(), Rejection> {
        if let Endpoint::TemporaryQueue { .. } = endpoint {
            return Err(Rejection::new(
                RejectCode::PermissionDenied,
                "temporary queues are created by their session",
            ));
        }
        let name = endpoint.name().to_string();
        if self.spools.contains_key(&name) {
            return if ignore_exists {
                Ok(())
            } else {
                Err(Rejection::new(
                    RejectCode::EndpointExists,
                    format!("'{name}' already exists"),
                ))
            };
        }
        let spool = Spool::new(endpoint, None)?;
        self.spools.insert(name.clone(), spool);
        info!(endpoint = %name, "endpoint provisioned");
        Ok(())
    }

    fn deprovision(&mut self, endpoint: &Endpoint, ignore_missing: bool) -> Result<(), Rejection> {
        let name = endpoint.name();
        let Some(spool) = self.spools.remove(name) else {
            return if ignore_missing {
                Ok(())
            } else {
                Err(Rejection::new(
                    RejectCode::UnknownEndpoint,
                    format!("'{name}' does not exist"),
                ))
            };
        };
        for binding in spool.bindings() {
            if let Some(client) = self.clients.get_mut(&binding.session_id) {
                client.flows.remove(&binding.flow_id);
                client.send(ServerFrame::FlowUnbound {
                    flow_id: binding.flow_id,
                    reason: format!("'{name}' was deprovisioned"),
                });
            }
        }
        info!(endpoint = %name, "endpoint deprovisioned");
        Ok(())
    }

    fn reply(&self, session_id: &str, correlation: Option<u64>, result: Result<Outcome, Rejection>) {
        let Some(correlation) = correlation else {
            if let Err(rejection) = result {
                warn!(session = %session_id, "uncorrelated request rejected: {rejection}");
            }
            return;
        };
        let outcome = result.unwrap_or_else(Outcome::Rejected);
        if let Some(client) = self.clients.get(session_id) {
            client.send(ServerFrame::Reply {
                correlation,
                outcome,
            });
        }
    }

    /// Applies one frame from `session_id` arriving on `link_id`.
    pub fn handle(&mut self, session_id: &str, link_id: u64, frame: ClientFrame) {
        if !self
            .clients
            .get(session_id)
            .is_some_and(|c| c.link_id == link_id)
        {
            debug!(session = %session_id, "frame from a stale link ignored");
            return;
        }

        match frame {
            ClientFrame::Login { .. } | ClientFrame::Logout => {
                warn!(session = %session_id, "unexpected session frame ignored");
            }
            ClientFrame::Subscribe { correlation, topic } => {
                let result = self.subscribe(session_id, &topic).map(|_| Outcome::Ok);
                self.reply(session_id, correlation, result);
            }
            ClientFrame::Unsubscribe { correlation, topic } => {
                let result = parse_pattern(&topic).map(|pattern| {
                    if let Some(client) = self.clients.get_mut(session_id) {
                        client.unsubscribe(&pattern);
                    }
                    Outcome::Ok
                });
                self.reply(session_id, correlation, result);
            }
            ClientFrame::Publish {
                correlation,
                message,
            } => {
                let result = self
                    .route(&message)
                    .map(|route| self.apply_publish(session_id, message, route))
                    .map(|message_id| Outcome::Published { message_id });
                self.reply(session_id, correlation, result);
            }
            ClientFrame::Provision {
                correlation,
                endpoint,
                ignore_exists,
            } => {
                let result = self.provision(endpoint, ignore_exists).map(|_| Outcome::Ok);
                self.reply(session_id, Some(correlation), result);
            }
            ClientFrame::Deprovision {
                correlation,
                endpoint,
                ignore_missing,
            } => {
                let result = self
                    .deprovision(&endpoint, ignore_missing)
                    .map(|_| Outcome::Ok);
                self.reply(session_id, Some(correlation), result);
            }
            ClientFrame::CreateTemporaryQueue { correlation } => {
                let name = format!("popmsg/tmp/{}", Uuid::new_v4());
                let endpoint = Endpoint::TemporaryQueue { name: name.clone() };
                let result = Spool::new(endpoint, Some(session_id.to_string())).map(|spool| {
                    self.spools.insert(name.clone(), spool);
                    Outcome::TemporaryQueue { name }
                });
                self.reply(session_id, Some(correlation), result);
            }
            ClientFrame::Bind {
                correlation,
                flow_id,
                endpoint,
                window,
                browser,
                started,
                transaction,
            } => {
                let binding = Binding::new(
                    session_id.to_string(),
                    flow_id,
                    window,
                    browser,
                    started,
                    transaction,
                );
                let result = self.bind(session_id, &endpoint, binding);
                let indication = result.as_ref().ok().copied().flatten();
                self.reply(session_id, Some(correlation), result.map(|_| Outcome::Ok));
                if let (Some(active), Some(client)) = (indication, self.clients.get(session_id)) {
                    client.send(if active {
                        ServerFrame::FlowActive { flow_id }
                    } else {
                        ServerFrame::FlowInactive { flow_id }
                    });
                }
            }
            ClientFrame::Unbind {
                correlation,
                flow_id,
            } => {
                let result = self.unbind(session_id, flow_id).map(|_| Outcome::Ok);
                self.reply(session_id, correlation, result);
            }
            ClientFrame::Ack {
                flow_id,
                message_id,
            } => {
                if let Err(rejection) = self.ack(session_id, flow_id, message_id) {
                    warn!(session = %session_id, flow = flow_id, "ack refused: {rejection}");
                }
            }
            ClientFrame::Start { flow_id } => self.set_started(session_id, flow_id, true),
            ClientFrame::Stop { flow_id } => self.set_started(session_id, flow_id, false),
            ClientFrame::OpenTransaction {
                correlation,
                transaction,
            } => {
                if let Some(client) = self.clients.get_mut(session_id) {
                    client.transactions.insert(transaction);
                }
                self.reply(session_id, Some(correlation), Ok(Outcome::Ok));
            }
            ClientFrame::Commit {
                correlation,
                transaction,
                sends,
                acks,
            } => {
                let result = self
                    .commit(session_id, transaction, sends, acks)
                    .map(|_| Outcome::Ok);
                self.reply(session_id, Some(correlation), result);
            }
            ClientFrame::Rollback {
                correlation,
                transaction,
            } => {
                let result = self
                    .check_transaction(session_id, transaction)
                    .map(|_| {
                        self.rollback(session_id, transaction);
                        Outcome::Ok
                    });
                self.reply(session_id, Some(correlation), result);
            }
            ClientFrame::CloseTransaction { transaction } => {
                self.rollback(session_id, transaction);
                if let Some(client) = self.clients.get_mut(session_id) {
                    client.transactions.remove(&transaction);
                }
            }
            ClientFrame::CacheRequest {
                correlation,
                topic,
                subscribe,
                max_messages,
            } => self.cache_request(session_id, correlation, &topic, subscribe, max_messages),
        }
        self.pump();
    }

    fn subscribe(&mut self, session_id: &str, topic: &str) -> Result<(), Rejection> {
        let pattern = parse_pattern(topic)?;
        if let Some(client) = self.clients.get_mut(session_id) {
            client.subscribe(pattern);
        }
        Ok(())
    }

    /// Works out who receives `message` without changing anything, so a
    /// commit can check every send before applying any.
    fn route(&self, message: &Message) -> Result<Route, Rejection> {
        let guaranteed = message.delivery_mode.is_guaranteed();
        match &message.destination {
            Destination::Topic(topic) => {
                validate_publish_topic(topic)
                    .map_err(|e| Rejection::new(RejectCode::InvalidTopic, e.to_string()))?;
                let clients: Vec<String> = self
                    .clients
                    .iter()
                    .filter(|(_, c)| c.is_subscribed(topic))
                    .map(|(id, _)| id.clone())
                    .collect();
                let spools: Vec<String> = if guaranteed {
                    self.spools
                        .iter()
                        .filter(|(_, s)| s.accepts_topic(topic))
                        .map(|(name, _)| name.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                if guaranteed
                    && clients.is_empty()
                    && spools.is_empty()
                    && self.settings.reject_unmatched_guaranteed
                {
                    return Err(Rejection::new(
                        RejectCode::NoMatchingEndpoint,
                        format!("no subscriber or endpoint matches '{topic}'"),
                    ));
                }
                Ok(Route { clients, spools })
            }
            Destination::Queue(name) => {
                if !self.spools.contains_key(name) {
                    return Err(Rejection::new(
                        RejectCode::UnknownEndpoint,
                        format!("queue '{name}' does not exist"),
                    ));
                }
                Ok(Route {
                    clients: Vec::new(),
                    spools: vec![name.clone()],
                })
            }
        }
    }

    /// Delivers an accepted publish. Returns the id given to a guaranteed
    /// message.
    fn apply_publish(&mut self, origin: &str, mut message: Message, route: Route) -> Option<u64> {
        let guaranteed = message.delivery_mode.is_guaranteed();
        let id = self.next_message_id;
        self.next_message_id += 1;

        message.origin = Some(origin.to_string());
        message.message_id = guaranteed.then_some(id);
        message.redelivered = false;
        message.cached = false;

        if message.topic().is_some() {
            if let Err(e) = self.history.store_message(&message) {
                warn!("failed to record history: {e}");
            }
        }
        for client_id in &route.clients {
            if let Some(client) = self.clients.get(client_id) {
                client.send(ServerFrame::Message {
                    message: message.clone(),
                });
            }
        }
        for name in &route.spools {
            if let Some(spool) = self.spools.get_mut(name) {
                spool.enqueue(id, message.clone());
            }
        }
        debug!(
            origin = %origin,
            destination = message.destination.name(),
            clients = route.clients.len(),
            spools = route.spools.len(),
            "published"
        );
        guaranteed.then_some(id)
    }

    /// Binds a flow. For endpoints that report activity the result carries
    /// whether the new flow is the active consumer.
    fn bind(
        &mut self,
        session_id: &str,
        endpoint: &Endpoint,
        binding: Binding,
    ) -> Result<Option<bool>, Rejection> {
        let name = endpoint.name().to_string();
        if let Some(transaction) = binding.transaction {
            self.check_transaction(session_id, transaction)?;
        }
        // A rebind of a live flow id replaces the old binding.
        let flow_id = binding.flow_id;
        let _ = self.unbind(session_id, flow_id);

        let spool = self.spools.get_mut(&name).ok_or_else(|| {
            Rejection::new(
                RejectCode::UnknownEndpoint,
                format!("endpoint '{name}' does not exist"),
            )
        })?;
        let indicates = spool.indicates_activity(&binding);
        let active = spool.bind(binding)?;
        if !active {
            debug!(session = %session_id, flow = flow_id, endpoint = %name, "flow bound on standby");
        }
        if let Some(client) = self.clients.get_mut(session_id) {
            client.flows.insert(flow_id, name);
        }
        Ok(indicates.then_some(active))
    }

    fn unbind(&mut self, session_id: &str, flow_id: u64) -> Result<(), Rejection> {
        let spool_name = self
            .clients
            .get_mut(session_id)
            .and_then(|c| c.flows.remove(&flow_id))
            .ok_or_else(|| Rejection::new(RejectCode::UnknownFlow, format!("flow {flow_id}")))?;
        let promoted = self
            .spools
            .get_mut(&spool_name)
            .and_then(|spool| spool.unbind(session_id, flow_id));
        self.activate(promoted);
        Ok(())
    }

    /// Tells a standby flow it has taken over its endpoint.
    fn activate(&self, promoted: Option<(String, u64)>) {
        let Some((session_id, flow_id)) = promoted else {
            return;
        };
        debug!(session = %session_id, flow = flow_id, "standby flow promoted");
        if let Some(client) = self.clients.get(&session_id) {
            client.send(ServerFrame::FlowActive { flow_id });
        }
    }

    fn spool_of(&self, session_id: &str, flow_id: u64) -> Option<&String> {
        self.clients.get(session_id)?.flows.get(&flow_id)
    }

    fn ack(&mut self, session_id: &str, flow_id: u64, message_id: u64) -> Result<(), Rejection> {
        let name = self
            .spool_of(session_id, flow_id)
            .cloned()
            .ok_or_else(|| Rejection::new(RejectCode::UnknownFlow, format!("flow {flow_id}")))?;
        match self.spools.get_mut(&name) {
            Some(spool) => spool.ack(session_id, flow_id, message_id),
            None => Err(Rejection::new(RejectCode::UnknownEndpoint, name)),
        }
    }

    fn set_started(&mut self, session_id: &str, flow_id: u64, started: bool) {
        let Some(name) = self.spool_of(session_id, flow_id).cloned() else {
            warn!(session = %session_id, flow = flow_id, "start/stop for an unknown flow");
            return;
        };
        if let Some(spool) = self.spools.get_mut(&name) {
            spool.set_started(session_id, flow_id, started);
        }
    }

    fn check_transaction(&self, session_id: &str, transaction: u64) -> Result<(), Rejection> {
        let known = self
            .clients
            .get(session_id)
            .is_some_and(|c| c.transactions.contains(&transaction));
        if known {
            Ok(())
        } else {
            Err(Rejection::new(
                RejectCode::UnknownTransaction,
                format!("transaction {transaction}"),
            ))
        }
    }

    /// Flows of `session_id` enlisted in `transaction`, with their spools.
    fn transaction_flows(&self, session_id: &str, transaction: u64) -> Vec<(u64, String)> {
        let Some(client) = self.clients.get(session_id) else {
            return Vec::new();
        };
        client
            .flows
            .iter()
            .filter(|(flow_id, name)| {
                self.spools
                    .get(*name)
                    .and_then(|s| s.binding(session_id, **flow_id))
                    .is_some_and(|b| b.transaction == Some(transaction))
            })
            .map(|(flow_id, name)| (*flow_id, name.clone()))
            .collect()
    }

    fn commit(
        &mut self,
        session_id: &str,
        transaction: u64,
        sends: Vec<Message>,
        acks: Vec<FlowAck>,
    ) -> Result<(), Rejection> {
        self.check_transaction(session_id, transaction)?;

        let validated = self.validate_commit(session_id, transaction, &sends, &acks);
        let routes = match validated {
            Ok(routes) => routes,
            Err(rejection) => {
                self.rollback(session_id, transaction);
                return Err(rejection);
            }
        };

        for ack in &acks {
            if let Err(rejection) = self.ack(session_id, ack.flow_id, ack.message_id) {
                warn!(session = %session_id, "validated ack failed to apply: {rejection}");
            }
        }
        for (message, route) in sends.into_iter().zip(routes) {
            self.apply_publish(session_id, message, route);
        }
        debug!(session = %session_id, transaction, acks = acks.len(), "transaction committed");
        Ok(())
    }

    fn validate_commit(
        &self,
        session_id: &str,
        transaction: u64,
        sends: &[Message],
        acks: &[FlowAck],
    ) -> Result<Vec<Route>, Rejection> {
        let mut seen = HashSet::new();
        for ack in acks {
            let spool = self
                .spool_of(session_id, ack.flow_id)
                .and_then(|name| self.spools.get(name));
            let valid = spool.is_some_and(|s| {
                s.binding(session_id, ack.flow_id)
                    .is_some_and(|b| b.transaction == Some(transaction))
                    && s.can_ack(session_id, ack.flow_id, ack.message_id)
            });
            if !valid || !seen.insert((ack.flow_id, ack.message_id)) {
                return Err(Rejection::new(
                    RejectCode::InvalidAck,
                    format!(
                        "message {} is not outstanding on flow {}",
                        ack.message_id, ack.flow_id
                    ),
                ));
            }
        }
        sends.iter().map(|message| self.route(message)).collect()
    }

    /// Returns every message held by the transaction's flows for redelivery.
    fn rollback(&mut self, session_id: &str, transaction: u64) {
        for (flow_id, name) in self.transaction_flows(session_id, transaction) {
            if let Some(spool) = self.spools.get_mut(&name) {
                spool.release(session_id, flow_id);
            }
            if let Some(client) = self.clients.get(session_id) {
                client.send(ServerFrame::FlowReleased { flow_id });
            }
        }
        debug!(session = %session_id, transaction, "transaction rolled back");
    }

    fn cache_request(
        &mut self,
        session_id: &str,
        correlation: u64,
        topic: &str,
        subscribe: bool,
        max_messages: usize,
    ) {
        let records = match parse_pattern(topic) {
            Ok(pattern) => {
                let records = self
                    .history
                    .load_messages(&pattern, max_messages)
                    .unwrap_or_else(|e| {
                        warn!("failed to load history for '{topic}': {e}");
                        Vec::new()
                    });
                if subscribe {
                    if let Some(client) = self.clients.get_mut(session_id) {
                        client.subscribe(pattern);
                    }
                }
                records
            }
            Err(rejection) => {
                warn!(session = %session_id, "cache request refused: {rejection}");
                Vec::new()
            }
        };

        let now = Utc::now().timestamp_millis();
        let suspect = self
            .settings
            .cache_suspect_after_secs
            .is_some_and(|secs| records.iter().any(|r| now - r.stored_at > secs * 1000));
        let messages = records
            .into_iter()
            .map(|record| {
                let mut message = record.message;
                message.cached = true;
                message
            })
            .collect();

        if let Some(client) = self.clients.get(session_id) {
            client.send(ServerFrame::CacheResponse {
                correlation,
                messages,
                suspect,
            });
        }
    }

    /// Hands spooled messages to bound flows.
    pub fn pump(&mut self) {
        for spool in self.spools.values_mut() {
            for (session_id, flow_id, message) in spool.pump() {
                if let Some(client) = self.clients.get(&session_id) {
                    client.send(ServerFrame::FlowMessage { flow_id, message });
                }
            }
        }
    }
}

fn parse_pattern(topic: &str) -> Result<TopicPattern, Rejection> {
    TopicPattern::parse(topic).map_err(|e| Rejection::new(RejectCode::InvalidTopic, e.to_string()))
}
