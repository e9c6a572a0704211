//! Handler traits for everything a session delivers.
//!
//! Message and flow handlers are async and run on the session context task,
//! one at a time. Closures get blanket implementations, so
//! `Arc::new(|msg: Message| ...)` works wherever a handler is expected.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::error;

use crate::cache::CacheOutcome;
use crate::flow::Flow;
use crate::message::Message;
use crate::session::SessionEvent;

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, message: Message);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    async fn on_message(&self, message: Message) {
        self(message)
    }
}

#[async_trait]
pub trait FlowHandler: Send + Sync + 'static {
    async fn on_message(&self, flow: &Flow, message: Message);
}

#[async_trait]
impl<F> FlowHandler for F
where
    F: Fn(&Flow, Message) + Send + Sync + 'static,
{
    async fn on_message(&self, flow: &Flow, message: Message) {
        self(flow, message)
    }
}

pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, event: SessionEvent);
}

impl<F> EventHandler for F
where
    F: Fn(SessionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}

pub trait CacheHandler: Send + Sync + 'static {
    fn on_complete(&self, request_id: u64, outcome: CacheOutcome);
}

impl<F> CacheHandler for F
where
    F: Fn(u64, CacheOutcome) + Send + Sync + 'static,
{
    fn on_complete(&self, request_id: u64, outcome: CacheOutcome) {
        self(request_id, outcome)
    }
}

/// Runs a handler future; a panic is logged and swallowed so the context task
/// keeps dispatching.
pub(crate) async fn guarded<F>(kind: &str, handler: F)
where
    F: Future<Output = ()>,
{
    if AssertUnwindSafe(handler).catch_unwind().await.is_err() {
        error!("{kind} handler panicked");
    }
}

pub(crate) fn guarded_sync(kind: &str, handler: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
        error!("{kind} handler panicked");
    }
}
