//! Facade routing in remote and local mode.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use collector_link_client::{
    BridgeConfig, ChannelState, ClientConfig, ConnectionConfig, ControlClient, Credential,
    EventKind, LinkError, MemoryCredentialStore, Operation, RecordConsumer, ReconnectLimit,
    StreamRecord,
};
use collector_link_core::{CredentialStore, HandlerError};
use collector_link_transport::Frame;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

async fn hunts() -> impl IntoResponse {
    Json(json!([{"hunt_id": "H.1"}, {"hunt_id": "H.2"}]))
}

async fn server_info() -> impl IntoResponse {
    Json(json!({"version": "0.7.1"}))
}

async fn stream(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo_subscriptions)
}

/// Answers every subscribe with one event on that topic.
async fn echo_subscriptions(socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = Frame::decode(text.as_str()) else { continue };
        if frame.kind != collector_link_transport::FrameType::Subscribe {
            continue;
        }
        let event = Frame::event(frame.topic.clone(), json!({"status": "RUNNING"}))
            .encode()
            .unwrap();
        if sender.send(Message::Text(event.into())).await.is_err() {
            return;
        }
    }
}

async fn serve() -> String {
    let app = Router::new()
        .route("/api/v1/hunts", get(hunts))
        .route("/api/v1/info", get(server_info))
        .route("/api/v1/stream", get(stream));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn remote(base: &str) -> ControlClient {
    let config = ConnectionConfig::builder(base)
        .credential(Credential::api_key("secret"))
        .reconnect_limit(ReconnectLimit::MaxAttempts(3))
        .build()
        .unwrap();
    ControlClient::new(ClientConfig::remote(config)).unwrap()
}

fn local() -> ControlClient {
    let config = BridgeConfig::builder("/bin/sh")
        .base_args(["-c"])
        .grace_period(Duration::from_secs(2))
        .build()
        .unwrap();
    ControlClient::new(ClientConfig::local(config)).unwrap()
}

struct Collecting(Mutex<Vec<StreamRecord>>);

impl Collecting {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Vec::new())))
    }

    fn values(&self) -> Vec<Value> {
        self.0.lock().unwrap().iter().map(|r| r.value.clone()).collect()
    }
}

#[async_trait]
impl RecordConsumer for Collecting {
    async fn on_record(&self, record: StreamRecord) -> Result<(), HandlerError> {
        self.0.lock().unwrap().push(record);
        Ok(())
    }
}

#[tokio::test]
async fn test_remote_call() {
    let base = serve().await;
    let client = remote(&base);
    assert!(client.is_remote());

    let value = client.call(Operation::get("/api/v1/info")).await.unwrap();
    assert_eq!(value, json!({"version": "0.7.1"}));

    client.close().await;
}

#[tokio::test]
async fn test_remote_stream_delivers_array_elements() {
    let base = serve().await;
    let client = remote(&base);
    let consumer = Collecting::new();

    client
        .stream(Operation::get("/api/v1/hunts"), consumer.clone())
        .await
        .unwrap();

    assert_eq!(
        consumer.values(),
        vec![json!({"hunt_id": "H.1"}), json!({"hunt_id": "H.2"})]
    );
    let seqs: Vec<u64> = consumer.0.lock().unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
}

#[tokio::test]
async fn test_remote_subscription_receives_events() {
    let base = serve().await;
    let client = remote(&base);
    let (_, mut flows) = client.subscribe_queue("flows", 8);

    client.open().unwrap();

    let event = timeout(WAIT, flows.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventKind::Update);
    assert_eq!(event.topic, "flows");
    assert_eq!(event.payload, json!({"status": "RUNNING"}));
    assert_eq!(client.channel_state(), Some(ChannelState::Connected));

    // Subscribing while connected sends the new topic right away.
    let (_, mut clients) = client.subscribe_queue("clients", 8);
    let event = timeout(WAIT, clients.recv()).await.unwrap().unwrap();
    assert_eq!(event.topic, "clients");

    client.close().await;
    assert_eq!(client.channel_state(), Some(ChannelState::Closed));
    assert!(matches!(client.open(), Err(LinkError::Configuration(_))));
}

#[tokio::test]
async fn test_from_store() {
    let base = serve().await;
    let store = MemoryCredentialStore::new();
    let builder =
        || ConnectionConfig::builder(base.as_str()).reconnect_limit(ReconnectLimit::Unbounded);

    let err = ControlClient::from_store(&store, "prod", builder())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LinkError::Configuration(_)), "{err:?}");

    store.put("prod", Credential::api_key("secret")).await.unwrap();
    let client = ControlClient::from_store(&store, "prod", builder())
        .await
        .unwrap();
    assert!(client.call(Operation::get("/api/v1/info")).await.is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_call_collects_records() {
    let client = local();
    assert!(!client.is_remote());

    let value = client
        .call(Operation::local([
            r#"echo '{"pid":1}'; echo 'banner noise'; echo '{"pid":2}'"#,
        ]))
        .await
        .unwrap();

    assert_eq!(value, json!([{"pid": 1}, {"pid": 2}]));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_failure_surfaces_process_error() {
    let client = local();

    let err = client
        .call(Operation::local(["echo 'no such artifact' >&2; exit 2"]))
        .await
        .unwrap_err();

    assert!(matches!(err, LinkError::Process { exit_code: Some(2), .. }), "{err:?}");
    assert!(err.stderr().unwrap_or_default().contains("no such artifact"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_call_cancelled() {
    let client = local();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let err = timeout(
        WAIT,
        client.call_with_cancel(Operation::local(["sleep 30"]), &cancel),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, LinkError::Cancelled), "{err:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_deadline_is_timeout() {
    let client = local();

    let err = timeout(
        WAIT,
        client.call(Operation::local(["sleep 30"]).with_deadline(Duration::from_millis(200))),
    )
    .await
    .unwrap()
    .unwrap_err();

    assert!(matches!(err, LinkError::Timeout(_)), "{err:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_local_stream() {
    let client = local();
    let consumer = Collecting::new();

    client
        .stream(
            Operation::local([r#"for i in 1 2 3; do echo "{\"i\":$i}"; done"#]),
            consumer.clone(),
        )
        .await
        .unwrap();

    assert_eq!(
        consumer.values(),
        vec![json!({"i": 1}), json!({"i": 2}), json!({"i": 3})]
    );
}
