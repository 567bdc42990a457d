//! End-to-end signaling over real WebSocket connections

use futures::{SinkExt, StreamExt};
use roomcast_api::create_router;
use roomcast_sfu::{ConsumerId, LoopbackEngine, PeerId, ProducerId, SfuConfig, SfuManager};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(config: SfuConfig) -> (SocketAddr, Arc<SfuManager>) {
    let sfu = SfuManager::with_engine(config, &LoopbackEngine::new()).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(Arc::clone(&sfu), 64 * 1024);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, sfu)
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, action: &str, data: Value) {
    let text = json!({ "action": action, "data": data }).to_string();
    ws.send(Message::text(text)).await.unwrap();
}

/// Next text frame as JSON
async fn recv(ws: &mut Ws) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn expect(ws: &mut Ws, action: &str) -> Value {
    let message = recv(ws).await;
    assert_eq!(message["action"], action, "unexpected message: {message}");
    message["data"].clone()
}

fn dtls() -> Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }] })
}

fn vp8() -> Value {
    json!({
        "mid": "0",
        "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
        "encodings": [{ "ssrc": 2222 }]
    })
}

#[tokio::test]
async fn test_publish_subscribe_and_departure() {
    let (addr, sfu) = spawn_server(SfuConfig::default()).await;

    let mut a = connect(addr).await;
    let welcome_a = expect(&mut a, "routerRtpCapabilities").await;
    let a_id = welcome_a["peerId"].as_str().unwrap().to_string();
    assert_eq!(welcome_a["existingProducers"], json!([]));

    let mut b = connect(addr).await;
    let welcome_b = expect(&mut b, "routerRtpCapabilities").await;
    let caps = welcome_b["routerRtpCapabilities"].clone();
    assert_eq!(caps["codecs"].as_array().unwrap().len(), 2);

    // A publishes
    send(&mut a, "createProducerTransport", json!({})).await;
    let transport = expect(&mut a, "producerTransportCreated").await;
    assert!(transport["id"].is_string());
    assert!(transport["iceParameters"]["usernameFragment"].is_string());
    assert!(!transport["iceCandidates"].as_array().unwrap().is_empty());
    assert!(transport["dtlsParameters"]["fingerprints"].is_array());

    send(&mut a, "connectProducerTransport", json!({ "dtlsParameters": dtls() })).await;
    send(&mut a, "produce", json!({ "kind": "video", "rtpParameters": vp8() })).await;
    let p1 = expect(&mut a, "producerCreated").await["id"].as_str().unwrap().to_string();

    let announced = expect(&mut b, "newProducer").await;
    assert_eq!(announced, json!({ "producerId": p1, "peerId": a_id, "kind": "video" }));

    // B subscribes
    send(&mut b, "createConsumerTransport", json!({})).await;
    expect(&mut b, "consumerTransportCreated").await;
    send(&mut b, "connectConsumerTransport", json!({ "dtlsParameters": dtls() })).await;
    send(&mut b, "consume", json!({ "producerId": p1, "rtpCapabilities": caps })).await;
    let consumer = expect(&mut b, "consumerCreated").await;
    assert_eq!(consumer["producerId"], p1.as_str());
    assert_eq!(consumer["producerPeerId"], a_id.as_str());
    assert_eq!(consumer["kind"], "video");
    assert_eq!(consumer["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");
    let c1 = consumer["id"].as_str().unwrap().to_string();

    send(&mut b, "resumeConsumer", json!({ "consumerId": c1 })).await;

    // A leaves
    a.close(None).await.unwrap();

    let closed = expect(&mut b, "producerClosed").await;
    assert_eq!(closed, json!({ "producerId": p1, "peerId": a_id, "kind": "video" }));
    let departed = expect(&mut b, "peerDeparted").await;
    assert_eq!(departed["peerId"], a_id.as_str());

    let registry = sfu.registry();
    assert!(registry.get(&PeerId::from(a_id)).is_err());
    assert!(registry.producer(&ProducerId::from(p1)).is_none());
    assert!(registry.consumer(&ConsumerId::from(c1)).is_none());
    let stats = sfu.stats();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.producers, 0);
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.transports, 1);
}

#[tokio::test]
async fn test_malformed_frames_keep_socket_open() {
    let (addr, _sfu) = spawn_server(SfuConfig::default()).await;
    let mut ws = connect(addr).await;
    expect(&mut ws, "routerRtpCapabilities").await;

    ws.send(Message::text("definitely not json")).await.unwrap();
    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    send(&mut ws, "somethingElse", json!({})).await;
    send(&mut ws, "connectProducerTransport", json!({ "dtlsParameters": 7 })).await;
    let error = expect(&mut ws, "error").await;
    assert!(error["message"].as_str().unwrap().contains("connectProducerTransport"));

    send(&mut ws, "createProducerTransport", json!({})).await;
    expect(&mut ws, "producerTransportCreated").await;
}

#[tokio::test]
async fn test_join_over_capacity_is_refused() {
    let config = SfuConfig {
        max_peers: 1,
        ..SfuConfig::default()
    };
    let (addr, sfu) = spawn_server(config).await;

    let mut first = connect(addr).await;
    expect(&mut first, "routerRtpCapabilities").await;

    let mut second = connect(addr).await;
    let error = expect(&mut second, "error").await;
    assert!(error["message"].as_str().unwrap().contains("capacity"));

    let next = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .unwrap();
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    assert_eq!(sfu.stats().peers, 1);
}
