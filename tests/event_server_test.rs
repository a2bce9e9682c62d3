//! Event Server Integration Tests
//!
//! Connection-per-event delivery, decode-failure isolation, and handler
//! registration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hookbridge::{EventHandler, EventServer, RawEvent};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct ChannelHandler {
    tx: mpsc::UnboundedSender<RawEvent>,
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn on_event(&self, event: RawEvent) {
        let _ = self.tx.send(event);
    }
}

async fn start_server() -> (Arc<EventServer>, SocketAddr, mpsc::UnboundedReceiver<RawEvent>) {
    let server = Arc::new(EventServer::new("127.0.0.1", 0));
    let (tx, rx) = mpsc::unbounded_channel();
    server.register_callback(Arc::new(ChannelHandler { tx }));

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve(listener).await });

    (server, addr, rx)
}

async fn push_bytes(addr: SocketAddr, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    // Closing the write half frames the message
    stream.shutdown().await.unwrap();
}

async fn push_event(addr: SocketAddr, msg_id: i64) {
    let payload = json!({
        "msgId": msg_id,
        "timestamp": 1690000000,
        "fromGroup": "wxid_alice",
        "fromUser": "wxid_alice",
        "isSendMsg": 0,
        "type": 1,
        "content": "hello"
    })
    .to_string();
    push_bytes(addr, payload.as_bytes()).await;
}

#[tokio::test]
async fn test_concurrent_connections_deliver_each_event_once() {
    let (_server, addr, mut rx) = start_server().await;

    tokio::join!(push_event(addr, 1), push_event(addr, 2));

    let mut got = vec![
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .message_id,
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .message_id,
    ];
    got.sort();
    assert_eq!(got, vec![1, 2]);

    // No duplicates follow
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_undecodable_payload_is_dropped_and_serving_continues() {
    let (_server, addr, mut rx) = start_server().await;

    push_bytes(addr, b"definitely not json").await;
    push_event(addr, 7).await;

    let event = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.message_id, 7);
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_handler_replaced_after_serving_started() {
    let (server, addr, mut first_rx) = start_server().await;

    push_event(addr, 1).await;
    timeout(Duration::from_secs(2), first_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let (tx, mut second_rx) = mpsc::unbounded_channel();
    server.register_callback(Arc::new(ChannelHandler { tx }));

    push_event(addr, 2).await;
    let event = timeout(Duration::from_secs(2), second_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.message_id, 2);
    // The replaced handler saw nothing further; its channel just closes
    assert!(first_rx.recv().await.is_none());
}
