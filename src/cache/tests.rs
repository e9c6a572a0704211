use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::{
    CacheOutcome, CacheRequest, CacheRequestCoordinator, CacheStatus, IncompleteReason,
    LiveDataAction,
};
use crate::config::{RouterSettings, Settings};
use crate::message::Message;
use crate::router::Router;
use crate::session::{CacheHandler, Session};
use crate::tests::scripted::{Peer, ScriptedTransport};
use crate::topic::TopicPattern;
use crate::transport::MemoryTransport;
use crate::transport::frame::{ClientFrame, ServerFrame};
use crate::utils::error::{CacheError, SendError, SubscribeError};

const LONG: Duration = Duration::from_secs(5);

fn live(topic: &str, body: &str) -> Message {
    Message::to_topic(topic).with_payload(body)
}

fn cached(topic: &str, body: &str) -> Message {
    let mut message = live(topic, body);
    message.cached = true;
    message
}

fn pattern(topic: &str) -> TopicPattern {
    TopicPattern::parse(topic).unwrap()
}

#[test]
fn test_outcome_from_response() {
    assert_eq!(
        CacheOutcome::from_response(0, false),
        CacheOutcome::Incomplete(IncompleteReason::NoData)
    );
    assert_eq!(
        CacheOutcome::from_response(3, true),
        CacheOutcome::Incomplete(IncompleteReason::SuspectData)
    );
    assert_eq!(CacheOutcome::from_response(3, false), CacheOutcome::Ok);
}

#[test]
fn test_coordinator_holds_live_data_until_complete() {
    let mut coordinator = CacheRequestCoordinator::new();
    let request = CacheRequest::new(1, "q/>");
    coordinator
        .register(10, &request, pattern("q/>"), None, None)
        .unwrap();

    assert!(coordinator.intercept(live("q/a", "held")).is_none());
    assert!(coordinator.intercept(cached("q/a", "old")).is_some());
    assert!(coordinator.intercept(live("other", "pass")).is_some());

    let completion = coordinator.complete(10, CacheOutcome::Ok).unwrap();
    assert_eq!(completion.request_id, 1);
    let held = completion.notify();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].payload_text(), Some("held"));
    assert_eq!(coordinator.outstanding(), 0);
    assert!(coordinator.complete(10, CacheOutcome::Ok).is_none());
}

#[test]
fn test_coordinator_flow_through_and_discard() {
    let mut coordinator = CacheRequestCoordinator::new();
    let through = CacheRequest::new(1, "a").live_data(LiveDataAction::FlowThrough);
    let discard = CacheRequest::new(2, "b").live_data(LiveDataAction::Discard);
    coordinator.register(1, &through, pattern("a"), None, None).unwrap();
    coordinator.register(2, &discard, pattern("b"), None, None).unwrap();

    assert!(coordinator.intercept(live("a", "x")).is_some());
    assert!(coordinator.intercept(live("b", "y")).is_none());
    assert!(coordinator.complete(2, CacheOutcome::Ok).unwrap().notify().is_empty());
}

#[test]
fn test_coordinator_rejects_duplicate_request_ids() {
    let mut coordinator = CacheRequestCoordinator::new();
    let request = CacheRequest::new(5, "t");
    coordinator.register(1, &request, pattern("t"), None, None).unwrap();
    assert!(matches!(
        coordinator.register(2, &request, pattern("t"), None, None),
        Err(CacheError::Duplicate(5))
    ));

    coordinator.cancel(1);
    assert!(coordinator.register(3, &request, pattern("t"), None, None).is_ok());
}

#[test]
fn test_fail_all_reports_fail_and_drops_waiters() {
    let mut coordinator = CacheRequestCoordinator::new();
    let (handler_tx, handler_rx) = std::sync::mpsc::channel();
    let handler: Arc<dyn CacheHandler> = Arc::new(move |id: u64, outcome: CacheOutcome| {
        let _ = handler_tx.send((id, outcome));
    });
    let (waiter, mut waiting) = oneshot::channel();
    coordinator
        .register(1, &CacheRequest::new(9, "t"), pattern("t"), Some(handler), Some(waiter))
        .unwrap();
    coordinator.intercept(live("t", "held"));

    for completion in coordinator.fail_all() {
        assert!(completion.notify().is_empty());
    }
    assert_eq!(handler_rx.try_recv().unwrap(), (9, CacheOutcome::Fail));
    assert!(waiting.try_recv().is_err());
    assert_eq!(coordinator.outstanding(), 0);
}

#[test]
fn test_request_timer_stops_when_the_request_ends() {
    let mut coordinator = CacheRequestCoordinator::new();
    let answered = coordinator
        .register(1, &CacheRequest::new(1, "a"), pattern("a"), None, None)
        .unwrap();
    let cancelled = coordinator
        .register(2, &CacheRequest::new(2, "b"), pattern("b"), None, None)
        .unwrap();
    let failed = coordinator
        .register(3, &CacheRequest::new(3, "c"), pattern("c"), None, None)
        .unwrap();
    assert!(!answered.is_cancelled());

    coordinator.complete(1, CacheOutcome::Ok).unwrap().notify();
    assert!(answered.is_cancelled());
    assert!(!failed.is_cancelled());
    coordinator.cancel(2);
    assert!(cancelled.is_cancelled());
    assert_eq!(coordinator.fail_all().len(), 1);
    assert!(failed.is_cancelled());
}

#[derive(Debug, PartialEq)]
enum Seen {
    Message(String, bool),
    Done(u64, CacheOutcome),
}

async fn scripted_session() -> (Session, Peer, mpsc::UnboundedReceiver<Seen>, mpsc::UnboundedSender<Seen>) {
    let (transport, mut peers) = ScriptedTransport::new();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let default_tx = seen_tx.clone();

    let settings = Settings::default();
    let connecting = Session::connect(
        &settings,
        Arc::new(transport),
        Arc::new(move |message: Message| {
            let text = message.payload_text().unwrap_or_default().to_string();
            let _ = default_tx.send(Seen::Message(text, message.cached));
        }),
    );
    let accepting = async {
        let mut peer = peers.recv().await.unwrap();
        peer.accept_login().await;
        peer
    };
    let (session, peer) = tokio::join!(connecting, accepting);
    (session.unwrap(), peer, seen_rx, seen_tx)
}

fn done_handler(tx: &mpsc::UnboundedSender<Seen>) -> Arc<dyn CacheHandler> {
    let tx = tx.clone();
    Arc::new(move |id: u64, outcome: CacheOutcome| {
        let _ = tx.send(Seen::Done(id, outcome));
    })
}

async fn next_cache_request(peer: &mut Peer) -> u64 {
    match peer.next().await {
        ClientFrame::CacheRequest { correlation, .. } => correlation,
        other => panic!("expected a cache request, got {other:?}"),
    }
}

async fn seen(rx: &mut mpsc::UnboundedReceiver<Seen>, count: usize) -> Vec<Seen> {
    let mut out = Vec::new();
    for _ in 0..count {
        out.push(timeout(LONG, rx.recv()).await.unwrap().unwrap());
    }
    out
}

#[tokio::test]
async fn test_cached_then_completion_then_held_live() {
    let (session, mut peer, mut rx, tx) = scripted_session().await;

    let status = session
        .send_cache_request(CacheRequest::new(1, "q/a"), Some(done_handler(&tx)))
        .await
        .unwrap();
    assert_eq!(status, CacheStatus::InProgress);
    let correlation = next_cache_request(&mut peer).await;

    peer.send(ServerFrame::Message {
        message: live("q/a", "live"),
    });
    peer.send(ServerFrame::CacheResponse {
        correlation,
        messages: vec![cached("q/a", "old")],
        suspect: false,
    });

    assert_eq!(
        seen(&mut rx, 3).await,
        vec![
            Seen::Message("old".to_string(), true),
            Seen::Done(1, CacheOutcome::Ok),
            Seen::Message("live".to_string(), false),
        ]
    );
    assert_eq!(session.stats().cached, 1);
}

#[tokio::test]
async fn test_flow_through_delivers_live_first() {
    let (session, mut peer, mut rx, tx) = scripted_session().await;

    session
        .send_cache_request(
            CacheRequest::new(2, "q/a").live_data(LiveDataAction::FlowThrough),
            Some(done_handler(&tx)),
        )
        .await
        .unwrap();
    let correlation = next_cache_request(&mut peer).await;
    peer.send(ServerFrame::Message {
        message: live("q/a", "live"),
    });
    peer.send(ServerFrame::CacheResponse {
        correlation,
        messages: Vec::new(),
        suspect: false,
    });

    assert_eq!(
        seen(&mut rx, 2).await,
        vec![
            Seen::Message("live".to_string(), false),
            Seen::Done(2, CacheOutcome::Incomplete(IncompleteReason::NoData)),
        ]
    );
}

#[tokio::test]
async fn test_timeout_completes_incomplete_and_releases_live() {
    let (session, mut peer, mut rx, tx) = scripted_session().await;

    session
        .send_cache_request(
            CacheRequest::new(3, "q/a").timeout(Duration::from_millis(50)),
            Some(done_handler(&tx)),
        )
        .await
        .unwrap();
    let correlation = next_cache_request(&mut peer).await;
    peer.send(ServerFrame::Message {
        message: live("q/a", "live"),
    });

    assert_eq!(
        seen(&mut rx, 2).await,
        vec![
            Seen::Done(3, CacheOutcome::Incomplete(IncompleteReason::Timeout)),
            Seen::Message("live".to_string(), false),
        ]
    );

    // A late response is ignored.
    peer.send(ServerFrame::CacheResponse {
        correlation,
        messages: vec![cached("q/a", "late")],
        suspect: false,
    });
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_waiting_request_returns_outcome() {
    let (session, mut peer, _rx, _tx) = scripted_session().await;

    let waiting = session.send_cache_request(CacheRequest::new(4, "q/>").wait(), None);
    let answering = async {
        let correlation = next_cache_request(&mut peer).await;
        peer.send(ServerFrame::CacheResponse {
            correlation,
            messages: vec![cached("q/a", "old")],
            suspect: true,
        });
    };
    let (status, ()) = tokio::join!(waiting, answering);
    assert_eq!(
        status.unwrap(),
        CacheStatus::Completed(CacheOutcome::Incomplete(IncompleteReason::SuspectData))
    );
}

#[tokio::test]
async fn test_disconnect_cancels_waiting_request() {
    let (session, mut peer, _rx, _tx) = scripted_session().await;

    let waiting = session.send_cache_request(CacheRequest::new(5, "q/a").wait(), None);
    let closing = async {
        next_cache_request(&mut peer).await;
        session.disconnect();
    };
    let (status, ()) = tokio::join!(waiting, closing);
    assert_eq!(status, Err(CacheError::Cancelled));
}

#[tokio::test]
async fn test_duplicate_outstanding_request_is_refused() {
    let (session, _peer, _rx, _tx) = scripted_session().await;
    session
        .send_cache_request(CacheRequest::new(6, "q/a"), None)
        .await
        .unwrap();
    assert_eq!(
        session
            .send_cache_request(CacheRequest::new(6, "q/b"), None)
            .await,
        Err(CacheError::Duplicate(6))
    );
}

#[tokio::test]
async fn test_cache_request_against_router_history() {
    let router = Router::new(RouterSettings::default()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = Session::connect(
        &Settings::default(),
        Arc::new(MemoryTransport::new(router.clone())),
        Arc::new(move |message: Message| {
            let _ = tx.send(message);
        }),
    )
    .await
    .unwrap();

    for body in ["1", "2", "3"] {
        let mut message = live("prices/eur", body);
        session.publish(&mut message).await.unwrap();
    }

    let status = session
        .send_cache_request(CacheRequest::new(7, "prices/*").max_messages(2).wait(), None)
        .await
        .unwrap();
    assert_eq!(status, CacheStatus::Completed(CacheOutcome::Ok));

    let first = timeout(LONG, rx.recv()).await.unwrap().unwrap();
    let second = timeout(LONG, rx.recv()).await.unwrap().unwrap();
    assert!(first.cached && second.cached);
    assert_eq!(
        (first.payload_text(), second.payload_text()),
        (Some("2"), Some("3"))
    );
    assert_eq!(router.subscriptions(session.session_id()), vec!["prices/*"]);
}

#[tokio::test]
async fn test_unsent_cache_request_drops_its_subscription() {
    let (transport, mut peers) = ScriptedTransport::new();
    let mut settings = Settings::default();
    settings.session.send_queue_capacity = 1;
    settings.session.send_timeout_ms = 50;
    settings.session.reconnect_retry_wait_ms = 10;
    let connecting = Session::connect(&settings, Arc::new(transport), Arc::new(|_: Message| {}));
    let accepting = async {
        let mut peer = peers.recv().await.unwrap();
        peer.accept_login().await;
        peer
    };
    let (session, peer) = tokio::join!(connecting, accepting);
    let session = session.unwrap();

    // The link drops and the next login is never answered, so nothing drains
    // the send queue.
    drop(peer);
    let _stalled = timeout(LONG, peers.recv()).await.unwrap().unwrap();
    session.publish(&mut Message::to_topic("fill")).await.unwrap();

    let result = session
        .send_cache_request(CacheRequest::new(1, "q/a"), None)
        .await;
    assert!(matches!(result, Err(CacheError::Send(SendError::Timeout))));
    assert!(matches!(
        session.unsubscribe("q/a").await,
        Err(SubscribeError::NotFound(_))
    ));
}
