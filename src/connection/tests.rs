use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{Backoff, Connection, ConnectionEvent, Lane, TransportState};
use crate::config::{RouterSettings, SessionSettings};
use crate::flow::Endpoint;
use crate::router::Router;
use crate::transport::MemoryTransport;
use crate::transport::frame::{ClientFrame, Outcome, RejectCode};
use crate::utils::error::{ConnectError, RequestError, SendError};

fn settings() -> SessionSettings {
    SessionSettings {
        connect_retries: 1,
        reconnect_retries: 3,
        reconnect_retry_wait_ms: 20,
        ..SessionSettings::default()
    }
}

fn router() -> Router {
    Router::new(RouterSettings::default()).unwrap()
}

async fn connect(
    router: &Router,
    settings: &SessionSettings,
) -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport::new(router.clone()));
    let connection = Connection::connect(settings, transport, tx).await.unwrap();
    (connection, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no connection event")
        .expect("event channel closed")
}

#[test]
fn test_fixed_backoff_is_constant() {
    let base = Duration::from_millis(3000);
    assert_eq!(Backoff::Fixed.delay(base, 1), base);
    assert_eq!(Backoff::Fixed.delay(base, 7), base);
}

#[test]
fn test_exponential_backoff_doubles_up_to_cap() {
    let base = Duration::from_secs(1);
    assert_eq!(Backoff::Exponential.delay(base, 1), Duration::from_secs(1));
    assert_eq!(Backoff::Exponential.delay(base, 2), Duration::from_secs(2));
    assert_eq!(Backoff::Exponential.delay(base, 4), Duration::from_secs(8));
    assert_eq!(Backoff::Exponential.delay(base, 10), Duration::from_secs(30));
    assert_eq!(Backoff::Exponential.delay(base, 64), Duration::from_secs(30));
}

#[tokio::test]
async fn test_connect_and_request() {
    let router = router();
    let (connection, _events) = connect(&router, &settings()).await;
    assert_eq!(connection.state(), TransportState::Connected);
    assert_eq!(router.client_count(), 1);

    let outcome = connection
        .request(
            |correlation| ClientFrame::Subscribe {
                correlation: Some(correlation),
                topic: "a/b".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Ok);
    assert_eq!(router.subscriptions(connection.session_id()), vec!["a/b"]);
}

#[tokio::test]
async fn test_rejected_request_is_an_error() {
    let router = router();
    let (connection, _events) = connect(&router, &settings()).await;

    let err = connection
        .request(
            |correlation| ClientFrame::Provision {
                correlation,
                endpoint: Endpoint::TemporaryQueue {
                    name: "mine".to_string(),
                },
                ignore_exists: false,
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    match err {
        RequestError::Rejected(rejection) => assert_eq!(rejection.code, RejectCode::PermissionDenied),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_gives_up_after_retries() {
    let router = router();
    router.set_accepting(false);
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport::new(router.clone()));

    let settings = SessionSettings {
        connect_retries: 2,
        ..settings()
    };
    let err = Connection::connect(&settings, transport, tx).await.unwrap_err();
    assert!(matches!(err, ConnectError::ConnectFailed { attempts: 3, .. }));
}

#[tokio::test]
async fn test_bad_credentials_fail_without_retry() {
    let router = Router::new(RouterSettings {
        credentials: HashMap::from([("app".to_string(), "secret".to_string())]),
        ..RouterSettings::default()
    })
    .unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MemoryTransport::new(router.clone()));
    let settings = SessionSettings {
        username: "app".to_string(),
        password: "wrong".to_string(),
        connect_retries: 5,
        reconnect_retry_wait_ms: 60_000,
        ..settings()
    };

    let err = timeout(
        Duration::from_secs(5),
        Connection::connect(&settings, transport, tx),
    )
    .await
    .expect("auth failure must not be retried")
    .unwrap_err();
    assert!(matches!(err, ConnectError::Auth(_)));
    assert_eq!(router.client_count(), 0);
}

#[tokio::test]
async fn test_reconnects_after_link_loss() {
    let router = router();
    let (connection, mut events) = connect(&router, &settings()).await;

    assert!(router.disconnect_client(connection.session_id()));
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnecting));
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnected));
    assert_eq!(connection.state(), TransportState::Connected);
    assert_eq!(router.client_count(), 1);
}

#[tokio::test]
async fn test_send_queue_holds_frames_while_reconnecting() {
    let router = router();
    let settings = SessionSettings {
        reconnect_retries: 50,
        ..settings()
    };
    let (connection, mut events) = connect(&router, &settings).await;
    let session_id = connection.session_id().to_string();

    router.set_accepting(false);
    router.disconnect_client(&session_id);
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnecting));
    assert_eq!(connection.state(), TransportState::Reconnecting);

    connection
        .send(ClientFrame::Subscribe {
            correlation: None,
            topic: "held/topic".to_string(),
        })
        .await
        .unwrap();

    router.set_accepting(true);
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnected));

    // Queued frames wait until recovery is done.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.subscriptions(&session_id).is_empty());
    let restored = connection
        .request_on(
            Lane::Recovery,
            |correlation| ClientFrame::Subscribe {
                correlation: Some(correlation),
                topic: "restored".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(restored, Outcome::Ok);
    assert_eq!(router.subscriptions(&session_id), vec!["restored"]);
    connection.resume();

    let outcome = connection
        .request(
            |correlation| ClientFrame::Subscribe {
                correlation: Some(correlation),
                topic: "after".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Ok);
    assert_eq!(
        router.subscriptions(&session_id),
        vec!["restored", "held/topic", "after"]
    );
}

#[tokio::test]
async fn test_resume_without_reconnect_is_ignored() {
    let router = router();
    let (connection, _events) = connect(&router, &settings()).await;
    connection.resume();
    let outcome = connection
        .request(
            |correlation| ClientFrame::Subscribe {
                correlation: Some(correlation),
                topic: "t".to_string(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Ok);
}

#[tokio::test]
async fn test_down_when_reconnect_fails() {
    let router = router();
    let (connection, mut events) = connect(&router, &settings()).await;

    router.set_accepting(false);
    router.disconnect_client(connection.session_id());
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Reconnecting));
    match next_event(&mut events).await {
        ConnectionEvent::Down(ConnectError::ConnectFailed { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(connection.state(), TransportState::Disconnected);
    assert_eq!(
        connection
            .send(ClientFrame::Unsubscribe {
                correlation: None,
                topic: "x".to_string(),
            })
            .await,
        Err(SendError::Closed)
    );
}

#[tokio::test]
async fn test_disconnect_logs_out() {
    let router = router();
    let (connection, _events) = connect(&router, &settings()).await;

    connection.disconnect();
    assert!(connection.is_closed());
    assert_eq!(
        connection.enqueue(ClientFrame::Start { flow_id: 1 }),
        Err(SendError::Closed)
    );

    timeout(Duration::from_secs(5), async {
        while router.client_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("router never saw the logout");
}
