use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{RouterSettings, Settings};
use crate::flow::Endpoint;
use crate::message::{Destination, Message};
use crate::request_reply::{run_replier, run_requester};
use crate::router::Router;
use crate::session::{ProvisionOptions, Session, SubscribeOptions};
use crate::transaction::TransactionState;
use crate::transport::{WebSocketTransport, start_websocket_server};

const LONG: Duration = Duration::from_secs(5);

async fn serve() -> (String, Router) {
    let router = Router::new(RouterSettings::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(start_websocket_server(listener, router.clone()));
    (url, router)
}

async fn connect(url: &str, tx: Option<mpsc::UnboundedSender<Message>>) -> Session {
    Session::connect(
        &Settings::default(),
        Arc::new(WebSocketTransport::new(url)),
        Arc::new(move |message: Message| {
            if let Some(tx) = &tx {
                let _ = tx.send(message);
            }
        }),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn integration_pubsub_end_to_end() {
    let (url, _router) = serve().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber = connect(&url, Some(tx)).await;
    let publisher = connect(&url, None).await;

    subscriber
        .subscribe("test/>", None, SubscribeOptions::confirmed())
        .await
        .unwrap();
    let mut message = Message::to_topic("test/greeting").with_payload("hello world");
    publisher.publish(&mut message).await.unwrap();

    let received = timeout(LONG, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.topic(), Some("test/greeting"));
    assert_eq!(received.payload_text(), Some("hello world"));
    assert_eq!(received.sequence_number, Some(1));
    assert!(received.timestamp.is_some());

    publisher.disconnect();
    subscriber.disconnect();
}

#[tokio::test]
async fn integration_guaranteed_queue_end_to_end() {
    let (url, router) = serve().await;
    let session = connect(&url, None).await;
    session
        .provision(Endpoint::queue("orders"), ProvisionOptions::default())
        .await
        .unwrap();

    let mut message = Message::to_queue("orders").persistent().with_payload("order-1");
    session.publish(&mut message).await.unwrap();
    assert!(message.message_id.is_some());

    let flow = session
        .create_flow(Endpoint::queue("orders"), session.flow_options(), None)
        .await
        .unwrap();
    let received = flow.receive(LONG).await.unwrap();
    assert_eq!(received.message_id, message.message_id);
    assert_eq!(router.endpoint_depth("orders"), Some(1));

    flow.ack(received.message_id.unwrap()).unwrap();
    timeout(LONG, async {
        while router.endpoint_depth("orders") != Some(0) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn integration_request_reply_end_to_end() {
    let (url, router) = serve().await;
    router.provision(Endpoint::queue("calc")).unwrap();

    let replier_session = connect(&url, None).await;
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let replier = tokio::spawn(async move {
        run_replier(&replier_session, Endpoint::queue("calc"), token).await
    });

    let requester = connect(&url, None).await;
    let answered = run_requester(&requester, Destination::queue("calc"), 9, 5)
        .await
        .unwrap();
    assert_eq!(answered.len(), 5);
    assert_eq!(answered[2], (3, Some(45.0)));
    assert_eq!(answered[4], (5, None));

    shutdown.cancel();
    let report = replier.await.unwrap().unwrap();
    assert_eq!(report.served, 5);
    assert_eq!(report.state, TransactionState::Committed);
}
