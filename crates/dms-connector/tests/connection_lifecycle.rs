use std::time::Duration;

use dms_connector::{
    ConnectionState, ConnectionStatus, DmsClient, DmsConfig, DmsError, DmsEvent, EventHandler,
    Generation, MemoryConnector, MemoryPeer, MemoryServer, ReconnectPolicy, SubscribeCommand,
    Subscription, SubscriptionStatus, websocket::WsFrame,
};
use serde_json::json;
use tokio::{sync::mpsc, time::timeout};

async fn connect(config: DmsConfig) -> (DmsClient, MemoryServer, MemoryPeer) {
    let (connector, mut server) = MemoryConnector::pair();
    let client = DmsClient::connect_with(config, connector)
        .await
        .expect("connect");
    let peer = server.accept().await.expect("peer");
    (client, server, peer)
}

fn config() -> DmsConfig {
    DmsConfig::new("test-client", "tester")
}

async fn wait_for_status(client: &DmsClient, check: impl Fn(&ConnectionStatus) -> bool) {
    let mut rx = client.watch_status();
    timeout(Duration::from_secs(2), rx.wait_for(|status| check(status)))
        .await
        .expect("status change timed out")
        .expect("connection driver stopped");
}

struct Recorder {
    events: mpsc::UnboundedSender<DmsEvent>,
    terminated: mpsc::UnboundedSender<DmsError>,
}

impl EventHandler for Recorder {
    fn on_event(&self, event: &DmsEvent) {
        let _ = self.events.send(event.clone());
    }

    fn on_terminated(&self, error: &DmsError) {
        let _ = self.terminated.send(error.clone());
    }
}

async fn subscribe_recorded(
    client: &DmsClient,
    peer: &mut MemoryPeer,
) -> (Subscription, mpsc::UnboundedReceiver<DmsError>) {
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (terminated, terminated_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .subscribe(
                    SubscribeCommand::new("Plant:Temp"),
                    Recorder { events, terminated },
                )
                .await
        }
    });
    let frame = peer.recv_json().await.unwrap();
    let tag = frame["subscribe"][0]["tag"].clone();
    peer.send_json(&json!({"subscribe": [{"code": "ok", "tag": tag}]}));
    (task.await.unwrap().unwrap(), terminated_rx)
}

#[tokio::test]
async fn abrupt_disconnect_fails_every_pending_request() {
    let (client, _server, mut peer) = connect(config()).await;

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.get(format!("Point:{i}")).await })
        })
        .collect();
    for _ in 0..5 {
        peer.recv_json().await.unwrap();
    }
    assert_eq!(client.pending_count(), 5);

    drop(peer);

    for task in tasks {
        assert!(matches!(
            task.await.unwrap(),
            Err(DmsError::ConnectionLost { .. })
        ));
    }
    assert_eq!(client.pending_count(), 0);

    wait_for_status(&client, |s| s.state == ConnectionState::Disconnected).await;
    assert!(matches!(
        client.get("After:Loss").await,
        Err(DmsError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn disconnect_terminates_subscriptions() {
    let (client, _server, mut peer) = connect(config()).await;
    let (subscription, mut terminated) = subscribe_recorded(&client, &mut peer).await;

    peer.close();

    let error = timeout(Duration::from_secs(2), terminated.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, DmsError::ConnectionLost { .. }));
    assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
    assert_eq!(client.subscription_count(), 0);
    // Each handler hears about it once.
    assert!(terminated.recv().await.is_none());

    assert!(matches!(
        subscription.unsubscribe().await,
        Err(DmsError::ConnectionLost { .. })
    ));
}

#[tokio::test]
async fn close_then_reconnect() {
    let (client, mut server, mut peer) = connect(config()).await;
    assert_eq!(client.status().generation, Generation(1));

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(peer.recv().await, Some(WsFrame::Close(None)));
    assert!(matches!(
        client.get("Closed").await,
        Err(DmsError::NotConnected {
            state: ConnectionState::Disconnected
        })
    ));

    let generation = client.reconnect().await.unwrap();
    assert_eq!(generation, Generation(2));
    assert!(client.is_connected());

    let mut peer = server.accept().await.unwrap();
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("Again").await }
    });
    let frame = peer.recv_json().await.unwrap();
    let tag = frame["get"][0]["tag"].clone();
    peer.send_json(&json!({"get": [{"code": "ok", "value": true, "tag": tag}]}));
    assert_eq!(task.await.unwrap().unwrap().value, json!(true));
}

#[tokio::test]
async fn explicit_reconnect_starts_new_generation() {
    let (client, mut server, mut peer) = connect(config()).await;
    let (subscription, mut terminated) = subscribe_recorded(&client, &mut peer).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.get("In:Flight").await }
    });
    peer.recv_json().await.unwrap();

    let generation = client.reconnect().await.unwrap();
    assert_eq!(generation, Generation(2));
    let _new_peer = server.accept().await.unwrap();

    assert!(matches!(
        pending.await.unwrap(),
        Err(DmsError::ConnectionLost { .. })
    ));
    assert!(terminated.recv().await.is_some());
    assert_eq!(subscription.status(), SubscriptionStatus::Cancelled);
    assert_eq!(subscription.id().generation, Generation(1));
    assert!(matches!(
        subscription.unsubscribe().await,
        Err(DmsError::ConnectionLost { .. })
    ));
}

#[tokio::test]
async fn automatic_reconnect_after_loss() {
    let policy = ReconnectPolicy::enabled()
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(50))
        .jitter(0.0);
    let (client, mut server, peer) = connect(config().reconnect(policy)).await;

    drop(peer);
    let mut peer = timeout(Duration::from_secs(2), server.accept())
        .await
        .expect("reconnect attempt")
        .unwrap();
    wait_for_status(&client, |s| {
        s.state == ConnectionState::Connected && s.generation == Generation(2)
    })
    .await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("After:Reconnect").await }
    });
    let frame = peer.recv_json().await.unwrap();
    let tag = frame["get"][0]["tag"].clone();
    peer.send_json(&json!({"get": [{"code": "ok", "value": 1, "tag": tag}]}));
    assert_eq!(task.await.unwrap().unwrap().value, json!(1));
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let policy = ReconnectPolicy::enabled()
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(10))
        .jitter(0.0)
        .max_attempts(Some(2));
    let (client, server, peer) = connect(config().reconnect(policy)).await;

    server.refuse_connections(true);
    drop(peer);

    wait_for_status(&client, |s| s.state == ConnectionState::Disconnected).await;
    assert_eq!(client.status().generation, Generation(1));
}

#[tokio::test]
async fn server_close_frame_is_a_loss() {
    let (client, _server, mut peer) = connect(config()).await;
    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("Point").await }
    });
    peer.recv_json().await.unwrap();
    peer.send_frame(WsFrame::Close(Some("maintenance".to_string())));

    match task.await.unwrap() {
        Err(DmsError::ConnectionLost { reason }) => assert!(reason.contains("maintenance")),
        other => panic!("expected connection loss, got {other:?}"),
    }
}

#[tokio::test]
async fn refused_connect_fails() {
    let (connector, server) = MemoryConnector::pair();
    server.refuse_connections(true);
    let result = DmsClient::connect_with(config(), connector).await;
    assert!(matches!(result, Err(DmsError::ConnectFailed { .. })));
}

#[tokio::test]
async fn loss_during_subscribe_fails_the_call_only() {
    let (client, _server, mut peer) = connect(config()).await;
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (terminated, mut terminated_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .subscribe(
                    SubscribeCommand::new("Plant:Temp"),
                    Recorder { events, terminated },
                )
                .await
        }
    });
    peer.recv_json().await.unwrap();
    assert_eq!(client.subscription_count(), 1);

    drop(peer);

    assert!(matches!(
        task.await.unwrap(),
        Err(DmsError::ConnectionLost { .. })
    ));
    assert_eq!(client.subscription_count(), 0);
    // The handler was never confirmed, so it is not told about the loss.
    let notified = timeout(Duration::from_secs(2), terminated_rx.recv())
        .await
        .expect("handler released");
    assert!(notified.is_none());
}
