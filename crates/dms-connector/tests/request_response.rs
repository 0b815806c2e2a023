use std::time::Duration;

use dms_connector::{
    DmsClient, DmsConfig, DmsError, GetCommand, MemoryConnector, MemoryPeer, MemoryServer, Query,
    ResponseCode, SetCommand, ValueType,
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde_json::{Value, json};
use tokio::time::timeout;

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

/// The single command of an outbound frame, with its kind.
fn command_of(frame: &Value) -> (String, Value) {
    let object = frame.as_object().expect("frame object");
    let (kind, list) = object
        .iter()
        .find(|(key, _)| !matches!(key.as_str(), "whois" | "user" | "tag"))
        .expect("command kind");
    (kind.clone(), list[0].clone())
}

#[tokio::test]
async fn get_round_trip() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("System:Time").await }
    });

    let frame = peer.recv_json().await.expect("request frame");
    assert_eq!(frame["whois"], "test-client");
    assert_eq!(frame["user"], "tester");
    let (kind, command) = command_of(&frame);
    assert_eq!(kind, "get");
    assert_eq!(command["path"], "System:Time");
    let tag = command["tag"].as_str().expect("tag").to_string();

    peer.send_json(&json!({
        "get": [{
            "code": "ok",
            "path": "System:Time",
            "value": "12:00:00",
            "type": "string",
            "stamp": "2024-01-01T12:00:00,000+01:00",
            "tag": tag
        }]
    }));

    let response = task.await.unwrap().expect("get response");
    assert_eq!(response.code, ResponseCode::Ok);
    assert_eq!(response.value, json!("12:00:00"));
    assert_eq!(response.value_type.as_deref(), Some("string"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn issue_request_returns_payload_unchanged() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .issue_request(
                    SetCommand::new("Plant:Setpoint", 21.5)
                        .create(true)
                        .value_type(ValueType::Double),
                    None,
                )
                .await
        }
    });

    let frame = peer.recv_json().await.unwrap();
    let (kind, command) = command_of(&frame);
    assert_eq!(kind, "set");
    assert_eq!(command["value"], json!(21.5));
    assert_eq!(command["create"], json!(true));
    assert_eq!(command["type"], json!("double"));

    let element = json!({
        "code": "ok",
        "path": "Plant:Setpoint",
        "value": 21.5,
        "type": "double",
        "extra": {"nested": [1, 2, 3]},
        "tag": command["tag"]
    });
    peer.send_json(&json!({ "set": [element.clone()] }));

    let payload = task.await.unwrap().unwrap();
    assert_eq!(payload.items, vec![element]);
}

const GARBAGE: [&str; 7] = [
    "{broken json",
    "[1, 2, 3]",
    "null",
    r#"{"bogusKind": [{"tag": "x"}]}"#,
    r#"{"get": [{"code": "ok", "value": "stray"}]}"#,
    r#"{"get": [{"code": "ok", "value": "stray", "tag": "no-such-request"}]}"#,
    r#"{"event": [{"code": "onChange", "path": "Nowhere", "tag": "no-such-subscription"}]}"#,
];

/// Answer `commands` in random order, in batches of one to three per frame,
/// with random garbage frames in between.
fn answer_shuffled(peer: &MemoryPeer, rng: &mut StdRng, mut commands: Vec<Value>) {
    commands.shuffle(rng);
    let mut rest = &commands[..];
    while !rest.is_empty() {
        for _ in 0..rng.random_range(0..3) {
            peer.send_text(GARBAGE[rng.random_range(0..GARBAGE.len())]);
        }
        let (batch, tail) = rest.split_at(rng.random_range(1..=3).min(rest.len()));
        let items: Vec<Value> = batch
            .iter()
            .map(|command| {
                json!({
                    "code": "ok",
                    "path": command["path"],
                    "value": command["path"],
                    "tag": command["tag"]
                })
            })
            .collect();
        peer.send_json(&json!({ "get": items }));
        rest = tail;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_are_correlated() {
    const ROUNDS: u64 = 25;
    const CALLERS: usize = 40;

    let (client, _server, mut peer) = connect(config()).await;

    for round in 0..ROUNDS {
        let mut rng = StdRng::seed_from_u64(round);
        let spawn_caller = |i: usize| {
            let client = client.clone();
            let path = format!("Point:{round}:{i}");
            tokio::spawn(async move { (path.clone(), client.get(path).await) })
        };

        let first_wave = rng.random_range(1..CALLERS);
        let mut callers: Vec<_> = (0..first_wave).map(&spawn_caller).collect();
        let mut requests = Vec::new();
        for _ in 0..first_wave {
            let frame = peer.recv_json().await.expect("request frame");
            requests.push(command_of(&frame).1);
        }

        // Answer part of the first wave while the second wave is issued.
        requests.shuffle(&mut rng);
        let answered_early = rng.random_range(0..=requests.len());
        let mut outstanding = requests.split_off(answered_early);
        answer_shuffled(&peer, &mut rng, requests);

        callers.extend((first_wave..CALLERS).map(&spawn_caller));
        for _ in first_wave..CALLERS {
            let frame = peer.recv_json().await.expect("request frame");
            outstanding.push(command_of(&frame).1);
        }
        answer_shuffled(&peer, &mut rng, outstanding);

        for caller in callers {
            let (path, result) = timeout(Duration::from_secs(5), caller)
                .await
                .expect("caller finished")
                .unwrap();
            let response = result.expect("response");
            assert_eq!(response.value, json!(path), "round {round}");
            assert_eq!(response.path.as_deref(), Some(path.as_str()));
        }
        assert_eq!(client.pending_count(), 0, "round {round}");
    }
    assert!(client.is_connected());
}

#[tokio::test]
async fn untagged_element_does_not_hide_response() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .issue_request(GetCommand::new("Plant:Temp"), Some(Duration::from_secs(2)))
                .await
        }
    });
    let frame = peer.recv_json().await.unwrap();
    let (_, command) = command_of(&frame);
    peer.send_json(&json!({
        "get": [
            {"code": "ok", "path": "Plant:Temp", "value": 20, "tag": command["tag"]},
            {"code": "ok", "path": "Plant:Other", "value": 99}
        ]
    }));

    let payload = task.await.unwrap().expect("response despite untagged sibling");
    assert_eq!(payload.items.len(), 1);
    assert_eq!(payload.items[0]["value"], json!(20));
}

#[tokio::test]
async fn untagged_event_does_not_hide_response() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .issue_request(GetCommand::new("Plant:Temp"), Some(Duration::from_secs(2)))
                .await
        }
    });
    let frame = peer.recv_json().await.unwrap();
    let (_, command) = command_of(&frame);
    peer.send_json(&json!({
        "get": [{"code": "ok", "path": "Plant:Temp", "value": 20, "tag": command["tag"]}],
        "event": [{"code": "onChange", "path": "X"}]
    }));

    let payload = task.await.unwrap().expect("response despite untagged event");
    assert_eq!(payload.items[0]["value"], json!(20));
}

#[tokio::test]
async fn timeout_then_late_response_is_absorbed() {
    let (client, _server, mut peer) = connect(config()).await;

    let result = client
        .issue_request(GetCommand::new("Slow:Point"), Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(DmsError::RequestTimeout { .. })));
    assert_eq!(client.pending_count(), 0);

    let frame = peer.recv_json().await.unwrap();
    let (_, late) = command_of(&frame);
    peer.send_json(&json!({"get": [{"code": "ok", "value": 1, "tag": late["tag"]}]}));

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("Fast:Point").await }
    });
    let frame = peer.recv_json().await.unwrap();
    let (_, command) = command_of(&frame);
    assert_ne!(command["tag"], late["tag"]);
    peer.send_json(&json!({"get": [{"code": "ok", "value": 2, "tag": command["tag"]}]}));

    let response = task.await.unwrap().unwrap();
    assert_eq!(response.value, json!(2));
    assert!(client.is_connected());
}

#[tokio::test]
async fn dropped_caller_cancels_request() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.get("Never:Answered").await }
    });
    let _ = peer.recv_json().await.unwrap();
    assert_eq!(client.pending_count(), 1);

    task.abort();
    let _ = task.await;
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn rejected_request_is_protocol_error() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.set("Locked:Point", 1).await }
    });
    let frame = peer.recv_json().await.unwrap();
    let (_, command) = command_of(&frame);
    peer.send_json(&json!({
        "set": [{"code": "no perm", "message": "read only", "tag": command["tag"]}]
    }));

    match task.await.unwrap() {
        Err(DmsError::Protocol { code, message, tag }) => {
            assert_eq!(code, ResponseCode::NoPerm);
            assert_eq!(message.as_deref(), Some("read only"));
            assert_eq!(json!(tag), command["tag"]);
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn search_collects_every_match() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .search("Plant", Query::new().reg_ex_path("Temp.*").max_depth(-1))
                .await
        }
    });
    let frame = peer.recv_json().await.unwrap();
    let (_, command) = command_of(&frame);
    assert_eq!(command["query"], json!({"regExPath": "Temp.*", "maxDepth": -1}));

    let tag = command["tag"].clone();
    peer.send_json(&json!({
        "get": [
            {"code": "ok", "path": "Plant:Temp1", "value": 20, "tag": tag},
            {"code": "ok", "path": "Plant:Temp2", "value": 21, "tag": tag}
        ]
    }));

    let found = task.await.unwrap().unwrap();
    let paths: Vec<_> = found.iter().filter_map(|r| r.path.as_deref()).collect();
    assert_eq!(paths, vec!["Plant:Temp1", "Plant:Temp2"]);
}

#[tokio::test]
async fn changelog_groups_use_frame_level_tag() {
    let (client, _server, mut peer) = connect(config()).await;

    let task = tokio::spawn({
        let client = client.clone();
        async move { client.changelog_groups().await }
    });
    let frame = peer.recv_json().await.unwrap();
    assert_eq!(frame["changelogGetGroups"], json!([{"changelogGetGroups": []}]));
    let tag = frame["tag"]["changelogGetGroups"][0].clone();
    assert!(tag.is_string());

    peer.send_json(&json!({
        "tag": {"changelogGetGroups": [tag]},
        "changelogGetGroups": [{"code": "ok", "groups": ["Alarms", "Events"]}]
    }));

    let groups = task.await.unwrap().unwrap();
    assert_eq!(groups, vec!["Alarms".to_string(), "Events".to_string()]);
}

#[tokio::test]
async fn invalid_command_is_rejected_before_sending() {
    let (client, _server, mut peer) = connect(config()).await;

    let result = client.get("").await;
    assert!(matches!(result, Err(DmsError::Encoding { .. })));
    assert_eq!(client.pending_count(), 0);

    let nothing = timeout(Duration::from_millis(50), peer.recv_text()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn capacity_is_enforced() {
    let (client, _server, mut peer) = connect(config().max_pending_requests(1)).await;

    let first = tokio::spawn({
        let client = client.clone();
        async move { client.get("A").await }
    });
    let _ = peer.recv_json().await.unwrap();

    let second = client.get("B").await;
    assert!(matches!(second, Err(DmsError::CapacityExceeded { .. })));
    first.abort();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let (connector, _server) = MemoryConnector::pair();
    let result = DmsClient::connect_with(DmsConfig::default(), connector).await;
    assert!(matches!(result, Err(DmsError::Config { .. })));
}
