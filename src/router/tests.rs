use std::collections::HashMap;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::engine::Engine;
use super::spool::{Binding, Spool};
use crate::config::RouterSettings;
use crate::flow::Endpoint;
use crate::message::{Destination, Message};
use crate::transport::frame::{ClientFrame, FlowAck, Outcome, RejectCode, ServerFrame};

fn engine() -> Engine {
    Engine::new(RouterSettings::default()).unwrap()
}

fn login(engine: &mut Engine, session: &str, link: u64) -> UnboundedReceiver<ServerFrame> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.login(session, link, tx);
    assert!(matches!(rx.try_recv(), Ok(ServerFrame::LoginResponse { .. })));
    rx
}

fn drain(rx: &mut UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(frame);
    }
    out
}

fn outcome(rx: &mut UnboundedReceiver<ServerFrame>, correlation: u64) -> Outcome {
    drain(rx)
        .into_iter()
        .find_map(|frame| match frame {
            ServerFrame::Reply {
                correlation: c,
                outcome,
            } if c == correlation => Some(outcome),
            _ => None,
        })
        .expect("no reply for correlation")
}

fn rejected_with(outcome: Outcome) -> RejectCode {
    match outcome {
        Outcome::Rejected(rejection) => rejection.code,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

fn flow_messages(frames: &[ServerFrame]) -> Vec<(u64, Message)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            ServerFrame::FlowMessage { flow_id, message } => Some((*flow_id, message.clone())),
            _ => None,
        })
        .collect()
}

fn publish(engine: &mut Engine, session: &str, link: u64, correlation: u64, message: Message) {
    engine.handle(
        session,
        link,
        ClientFrame::Publish {
            correlation: Some(correlation),
            message,
        },
    );
}

fn bind(engine: &mut Engine, session: &str, link: u64, flow_id: u64, endpoint: Endpoint, window: usize) {
    engine.handle(
        session,
        link,
        ClientFrame::Bind {
            correlation: 900 + flow_id,
            flow_id,
            endpoint,
            window,
            browser: false,
            started: true,
            transaction: None,
        },
    );
}

#[test]
fn test_topic_publish_reaches_wildcard_subscriber_only() {
    let mut engine = engine();
    let mut sub = login(&mut engine, "sub", 1);
    let mut other = login(&mut engine, "other", 2);
    let mut publisher = login(&mut engine, "pub", 3);

    engine.handle(
        "sub",
        1,
        ClientFrame::Subscribe {
            correlation: Some(1),
            topic: "prices/>".to_string(),
        },
    );
    assert_eq!(outcome(&mut sub, 1), Outcome::Ok);

    publish(&mut engine, "pub", 3, 7, Message::to_topic("prices/eur/usd").with_payload("1.09"));
    assert_eq!(outcome(&mut publisher, 7), Outcome::Published { message_id: None });

    let frames = drain(&mut sub);
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        ServerFrame::Message { message } => {
            assert_eq!(message.payload_text(), Some("1.09"));
            assert_eq!(message.origin.as_deref(), Some("pub"));
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(drain(&mut other).is_empty());
}

#[test]
fn test_invalid_subscription_topic_is_rejected() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);
    engine.handle(
        "s",
        1,
        ClientFrame::Subscribe {
            correlation: Some(4),
            topic: "a/>/b".to_string(),
        },
    );
    assert_eq!(rejected_with(outcome(&mut rx, 4)), RejectCode::InvalidTopic);
    assert!(engine.subscriptions("s").is_empty());
}

#[test]
fn test_guaranteed_publish_without_match_is_rejected() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);

    publish(&mut engine, "s", 1, 1, Message::to_topic("nobody/home").persistent());
    assert_eq!(rejected_with(outcome(&mut rx, 1)), RejectCode::NoMatchingEndpoint);

    publish(&mut engine, "s", 1, 2, Message::to_topic("nobody/home"));
    assert_eq!(outcome(&mut rx, 2), Outcome::Published { message_id: None });
}

#[test]
fn test_guaranteed_publish_gets_message_id() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);
    engine.handle(
        "s",
        1,
        ClientFrame::Subscribe {
            correlation: None,
            topic: "orders".to_string(),
        },
    );
    publish(&mut engine, "s", 1, 3, Message::to_topic("orders").persistent());
    let frames = drain(&mut rx);
    let id = frames.iter().find_map(|f| match f {
        ServerFrame::Reply {
            outcome: Outcome::Published { message_id },
            ..
        } => *message_id,
        _ => None,
    });
    assert!(id.is_some());
}

#[test]
fn test_unknown_queue_is_rejected() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);
    publish(&mut engine, "s", 1, 1, Message::to_queue("missing").persistent());
    assert_eq!(rejected_with(outcome(&mut rx, 1)), RejectCode::UnknownEndpoint);
}

#[test]
fn test_queue_respects_window_until_ack() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("work"), false).unwrap();
    let mut rx = login(&mut engine, "s", 1);

    for body in ["a", "b", "c"] {
        publish(&mut engine, "s", 1, 1, Message::to_queue("work").persistent().with_payload(body));
    }
    bind(&mut engine, "s", 1, 10, Endpoint::queue("work"), 2);

    let delivered = flow_messages(&drain(&mut rx));
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].1.payload_text(), Some("a"));

    let first = delivered[0].1.message_id.unwrap();
    engine.handle(
        "s",
        1,
        ClientFrame::Ack {
            flow_id: 10,
            message_id: first,
        },
    );
    let delivered = flow_messages(&drain(&mut rx));
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].1.payload_text(), Some("c"));
    assert_eq!(engine.endpoint_depth("work"), Some(2));
}

#[test]
fn test_unbind_releases_for_redelivery() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("work"), false).unwrap();
    let mut rx = login(&mut engine, "s", 1);
    publish(&mut engine, "s", 1, 1, Message::to_queue("work").persistent());
    bind(&mut engine, "s", 1, 1, Endpoint::queue("work"), 5);
    let first = flow_messages(&drain(&mut rx));
    assert!(!first[0].1.redelivered);

    engine.handle(
        "s",
        1,
        ClientFrame::Unbind {
            correlation: Some(2),
            flow_id: 1,
        },
    );
    bind(&mut engine, "s", 1, 2, Endpoint::queue("work"), 5);
    let again = flow_messages(&drain(&mut rx));
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].0, 2);
    assert!(again[0].1.redelivered);
}

fn activity(frames: &[ServerFrame]) -> Vec<ServerFrame> {
    frames
        .iter()
        .filter(|f| matches!(f, ServerFrame::FlowActive { .. } | ServerFrame::FlowInactive { .. }))
        .cloned()
        .collect()
}

#[test]
fn test_topic_endpoint_keeps_second_consumer_on_standby() {
    let mut engine = engine();
    let te = Endpoint::topic_endpoint("te", "alerts/>");
    engine.provision(te.clone(), false).unwrap();
    let mut a = login(&mut engine, "a", 1);
    let mut b = login(&mut engine, "b", 2);

    bind(&mut engine, "a", 1, 1, te.clone(), 5);
    let frames = drain(&mut a);
    assert!(frames.contains(&ServerFrame::Reply {
        correlation: 901,
        outcome: Outcome::Ok
    }));
    assert_eq!(activity(&frames), vec![ServerFrame::FlowActive { flow_id: 1 }]);

    bind(&mut engine, "b", 2, 1, te, 5);
    let frames = drain(&mut b);
    assert!(frames.contains(&ServerFrame::Reply {
        correlation: 901,
        outcome: Outcome::Ok
    }));
    assert_eq!(activity(&frames), vec![ServerFrame::FlowInactive { flow_id: 1 }]);

    publish(&mut engine, "b", 2, 5, Message::to_topic("alerts/disk").persistent());
    assert_eq!(flow_messages(&drain(&mut a)).len(), 1);
    assert!(flow_messages(&drain(&mut b)).is_empty());

    // The standby takes over, with what the active flow left unacknowledged.
    engine.handle(
        "a",
        1,
        ClientFrame::Unbind {
            correlation: Some(2),
            flow_id: 1,
        },
    );
    assert!(activity(&drain(&mut a)).is_empty());
    let frames = drain(&mut b);
    assert_eq!(activity(&frames), vec![ServerFrame::FlowActive { flow_id: 1 }]);
    let taken = flow_messages(&frames);
    assert_eq!(taken.len(), 1);
    assert!(taken[0].1.redelivered);
}

#[test]
fn test_standby_promoted_when_active_session_drops() {
    let mut engine = engine();
    let te = Endpoint::topic_endpoint("te", "alerts/>");
    engine.provision(te.clone(), false).unwrap();
    let _a = login(&mut engine, "a", 1);
    let mut b = login(&mut engine, "b", 2);
    bind(&mut engine, "a", 1, 1, te.clone(), 5);
    bind(&mut engine, "b", 2, 7, te, 5);
    drain(&mut b);

    engine.detach("a", 1, false);
    assert_eq!(activity(&drain(&mut b)), vec![ServerFrame::FlowActive { flow_id: 7 }]);
}

#[test]
fn test_queue_consumers_get_no_activity_frames() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("work"), false).unwrap();
    let mut a = login(&mut engine, "a", 1);
    bind(&mut engine, "a", 1, 1, Endpoint::queue("work"), 5);
    let frames = drain(&mut a);
    assert_eq!(frames.len(), 1);
    assert!(activity(&frames).is_empty());
}

#[test]
fn test_provision_existing_endpoint() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("q"), false).unwrap();
    let err = engine.provision(Endpoint::queue("q"), false).unwrap_err();
    assert_eq!(err.code, RejectCode::EndpointExists);
    assert!(engine.provision(Endpoint::queue("q"), true).is_ok());
}

#[test]
fn test_temporary_queue_ownership_and_lifetime() {
    let mut engine = engine();
    let mut owner = login(&mut engine, "owner", 1);
    let mut other = login(&mut engine, "other", 2);

    engine.handle("owner", 1, ClientFrame::CreateTemporaryQueue { correlation: 1 });
    let Outcome::TemporaryQueue { name } = outcome(&mut owner, 1) else {
        panic!("no temporary queue created");
    };
    let endpoint = Endpoint::TemporaryQueue { name: name.clone() };

    bind(&mut engine, "other", 2, 1, endpoint.clone(), 5);
    assert_eq!(rejected_with(outcome(&mut other, 901)), RejectCode::PermissionDenied);

    // An abrupt drop keeps the queue for a reconnect.
    engine.detach("owner", 1, false);
    assert_eq!(engine.endpoint_depth(&name), Some(0));

    let _owner = login(&mut engine, "owner", 3);
    engine.detach("owner", 3, true);
    assert_eq!(engine.endpoint_depth(&name), None);
}

#[test]
fn test_stale_link_is_ignored() {
    let mut engine = engine();
    let _old = login(&mut engine, "s", 1);
    let _new = login(&mut engine, "s", 2);

    engine.handle(
        "s",
        1,
        ClientFrame::Subscribe {
            correlation: None,
            topic: "t".to_string(),
        },
    );
    assert!(engine.subscriptions("s").is_empty());

    engine.detach("s", 1, true);
    assert_eq!(engine.client_count(), 1);
}

#[test]
fn test_commit_is_all_or_nothing() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("in"), false).unwrap();
    engine.provision(Endpoint::queue("out"), false).unwrap();
    let mut rx = login(&mut engine, "s", 1);

    publish(&mut engine, "s", 1, 1, Message::to_queue("in").persistent());
    engine.handle(
        "s",
        1,
        ClientFrame::OpenTransaction {
            correlation: 2,
            transaction: 7,
        },
    );
    engine.handle(
        "s",
        1,
        ClientFrame::Bind {
            correlation: 3,
            flow_id: 1,
            endpoint: Endpoint::queue("in"),
            window: 5,
            browser: false,
            started: true,
            transaction: Some(7),
        },
    );
    let delivered = flow_messages(&drain(&mut rx));
    let id = delivered[0].1.message_id.unwrap();

    engine.handle(
        "s",
        1,
        ClientFrame::Commit {
            correlation: 4,
            transaction: 7,
            sends: vec![Message::to_queue("out").persistent()],
            acks: vec![FlowAck {
                flow_id: 1,
                message_id: id + 100,
            }],
        },
    );
    let frames = drain(&mut rx);
    let reply = frames.iter().find_map(|f| match f {
        ServerFrame::Reply {
            correlation: 4,
            outcome,
        } => Some(outcome.clone()),
        _ => None,
    });
    assert_eq!(rejected_with(reply.unwrap()), RejectCode::InvalidAck);
    assert_eq!(engine.endpoint_depth("out"), Some(0));

    // Rolled back: the consumed message comes back redelivered.
    let redelivered = flow_messages(&frames);
    assert_eq!(redelivered.len(), 1);
    assert!(redelivered[0].1.redelivered);

    engine.handle(
        "s",
        1,
        ClientFrame::Commit {
            correlation: 5,
            transaction: 7,
            sends: vec![Message::to_queue("out").persistent()],
            acks: vec![FlowAck {
                flow_id: 1,
                message_id: id,
            }],
        },
    );
    assert_eq!(outcome(&mut rx, 5), Outcome::Ok);
    assert_eq!(engine.endpoint_depth("in"), Some(0));
    assert_eq!(engine.endpoint_depth("out"), Some(1));
}

#[test]
fn test_unknown_transaction_is_rejected() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);
    engine.handle(
        "s",
        1,
        ClientFrame::Commit {
            correlation: 1,
            transaction: 99,
            sends: Vec::new(),
            acks: Vec::new(),
        },
    );
    assert_eq!(rejected_with(outcome(&mut rx, 1)), RejectCode::UnknownTransaction);
}

#[test]
fn test_cache_request_returns_history_and_subscribes() {
    let mut engine = engine();
    let mut rx = login(&mut engine, "s", 1);
    publish(&mut engine, "s", 1, 1, Message::to_topic("quotes/ibm").with_payload("100"));
    publish(&mut engine, "s", 1, 2, Message::to_topic("quotes/ibm").with_payload("101"));
    drain(&mut rx);

    engine.handle(
        "s",
        1,
        ClientFrame::CacheRequest {
            correlation: 3,
            topic: "quotes/*".to_string(),
            subscribe: true,
            max_messages: 1,
        },
    );
    let frames = drain(&mut rx);
    match &frames[..] {
        [ServerFrame::CacheResponse {
            correlation: 3,
            messages,
            suspect: false,
        }] => {
            assert_eq!(messages.len(), 1);
            assert!(messages[0].cached);
            assert_eq!(messages[0].payload_text(), Some("101"));
        }
        other => panic!("unexpected frames {other:?}"),
    }
    assert_eq!(engine.subscriptions("s"), vec!["quotes/*".to_string()]);
}

#[test]
fn test_deprovision_notifies_bound_flows() {
    let mut engine = engine();
    engine.provision(Endpoint::queue("q"), false).unwrap();
    let mut rx = login(&mut engine, "s", 1);
    bind(&mut engine, "s", 1, 3, Endpoint::queue("q"), 1);
    drain(&mut rx);

    engine.handle(
        "s",
        1,
        ClientFrame::Deprovision {
            correlation: 1,
            endpoint: Endpoint::queue("q"),
            ignore_missing: false,
        },
    );
    let frames = drain(&mut rx);
    assert!(
        frames
            .iter()
            .any(|f| matches!(f, ServerFrame::FlowUnbound { flow_id: 3, .. }))
    );

    engine.handle(
        "s",
        1,
        ClientFrame::Deprovision {
            correlation: 2,
            endpoint: Endpoint::queue("q"),
            ignore_missing: false,
        },
    );
    assert_eq!(rejected_with(outcome(&mut rx, 2)), RejectCode::UnknownEndpoint);
}

#[test]
fn test_credentials_are_checked() {
    let settings = RouterSettings {
        credentials: HashMap::from([("alice".to_string(), "secret".to_string())]),
        ..RouterSettings::default()
    };
    let engine = Engine::new(settings).unwrap();
    assert!(engine.authenticate("alice", "secret"));
    assert!(!engine.authenticate("alice", "wrong"));
    assert!(!engine.authenticate("bob", "secret"));
    assert!(self::engine().authenticate("anyone", ""));
}

#[test]
fn test_spool_browser_walks_without_holding() {
    let mut spool = Spool::new(Endpoint::queue("q"), None).unwrap();
    for id in 1..=3 {
        spool.enqueue(id, Message::new(Destination::queue("q")));
    }
    spool
        .bind(Binding::new("s".to_string(), 1, 2, true, true, None))
        .unwrap();

    let first: Vec<u64> = spool
        .pump()
        .into_iter()
        .filter_map(|(_, _, m)| m.message_id)
        .collect();
    assert_eq!(first, vec![1, 2]);
    assert!(spool.pump().is_empty());

    // Selective removal by the browser.
    spool.ack("s", 1, 2).unwrap();
    assert_eq!(spool.depth(), 2);

    spool.set_started("s", 1, true);
    let next: Vec<u64> = spool
        .pump()
        .into_iter()
        .filter_map(|(_, _, m)| m.message_id)
        .collect();
    assert_eq!(next, vec![3]);
}

#[test]
fn test_spool_round_robins_consumers() {
    let mut spool = Spool::new(Endpoint::queue("q"), None).unwrap();
    spool
        .bind(Binding::new("a".to_string(), 1, 10, false, true, None))
        .unwrap();
    spool
        .bind(Binding::new("b".to_string(), 1, 10, false, true, None))
        .unwrap();
    for id in 1..=4 {
        spool.enqueue(id, Message::new(Destination::queue("q")));
    }
    let owners: Vec<String> = spool.pump().into_iter().map(|(s, _, _)| s).collect();
    assert_eq!(owners, vec!["a", "b", "a", "b"]);
}

#[test]
fn test_spool_standby_consumer_waits_its_turn() {
    let mut spool = Spool::new(Endpoint::topic_endpoint("te", "t/>"), None).unwrap();
    let first = spool.bind(Binding::new("a".to_string(), 1, 10, false, true, None));
    let second = spool.bind(Binding::new("b".to_string(), 1, 10, false, true, None));
    let browser = spool.bind(Binding::new("c".to_string(), 1, 10, true, true, None));
    assert_eq!((first, second, browser), (Ok(true), Ok(false), Ok(true)));

    spool.enqueue(1, Message::new(Destination::topic("t/x")));
    let consumers: Vec<String> = spool
        .pump()
        .into_iter()
        .filter(|(s, _, _)| s != "c")
        .map(|(s, _, _)| s)
        .collect();
    assert_eq!(consumers, vec!["a"]);

    assert_eq!(spool.unbind("c", 1), None);
    assert_eq!(spool.unbind("a", 1), Some(("b".to_string(), 1)));
    assert!(spool.binding("b", 1).is_some_and(|b| b.is_active()));
    assert_eq!(spool.unbind("b", 1), None);
}
