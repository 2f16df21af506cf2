//! End-to-end relay tests: a real listener driven by WebSocket and HTTP clients.
//!
//! These walk the whole flow a pair of browser tabs goes through: identity,
//! membership lists, offer/accept, then the upload and download streams
//! meeting in a pipe and the completion notice.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::test_helpers::{set_attach_timeout, test_app_state};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
    stop: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
        self.stop.cancel();
    }
}

/// Serve the full router on 127.0.0.1 with an OS-assigned port.
async fn start_server(state: AppState) -> TestServer {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();

    let app = crate::build_router(state.clone(), None);
    let server_stop = stop.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(server_stop.cancelled_owned())
        .await
        .expect("test server failed");
    });

    TestServer { addr, state, stop }
}

/// Connect a signaling client and return it with the identity from its welcome.
async fn connect_client(addr: SocketAddr) -> (Client, String) {
    let (mut ws, _) = timeout(TEST_TIMEOUT, connect_async(format!("ws://{addr}/ws")))
        .await
        .expect("timed out connecting")
        .expect("websocket handshake failed");

    let welcome = next_of_type(&mut ws, "welcome").await;
    let id = welcome["id"].as_str().expect("welcome without id").to_string();
    (ws, id)
}

/// Read frames until one with `"type": kind` arrives, skipping others.
async fn next_of_type(ws: &mut Client, kind: &str) -> Value {
    loop {
        let frame = timeout(TEST_TIMEOUT, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
            .expect("signaling stream closed")
            .expect("signaling read error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(text.as_str()).expect("invalid JSON frame");
            if value["type"] == kind {
                return value;
            }
        }
    }
}

/// Read `list` frames until one matches `expected` exactly (order-insensitive).
async fn wait_for_list(ws: &mut Client, expected: &[&str]) {
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();
    loop {
        let list = next_of_type(ws, "list").await;
        let mut users: Vec<String> = list["users"]
            .as_array()
            .expect("list without users")
            .iter()
            .map(|u| u.as_str().unwrap().to_string())
            .collect();
        users.sort();
        if users == expected {
            return;
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::text(value.to_string()))
        .await
        .expect("failed to send control message");
}

#[tokio::test]
async fn offer_accept_stream_complete() {
    let server = start_server(test_app_state().await).await;
    let addr = server.addr;

    let (mut alice, alice_id) = connect_client(addr).await;
    let (mut bob, bob_id) = connect_client(addr).await;
    assert_ne!(alice_id, bob_id);
    assert!(alice_id.starts_with("User-"));

    wait_for_list(&mut alice, &[&alice_id, &bob_id]).await;
    wait_for_list(&mut bob, &[&alice_id, &bob_id]).await;

    // size as a decimal string, the way some browsers serialize it
    send_json(
        &mut alice,
        json!({ "type": "offer", "to": bob_id, "name": "x.txt", "size": "1024", "mime": "text/plain" }),
    )
    .await;
    let offer = next_of_type(&mut bob, "offer").await;
    assert_eq!(offer["from"], alice_id.as_str());
    assert_eq!(offer["name"], "x.txt");
    // forwarded as sent
    assert_eq!(offer["size"], "1024");
    assert_eq!(offer["mime"], "text/plain");

    send_json(&mut bob, json!({ "type": "accept", "to": alice_id })).await;
    let accept = next_of_type(&mut alice, "accept").await;
    assert_eq!(accept["from"], bob_id.as_str());

    let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let http = reqwest::Client::new();

    let download = {
        let http = http.clone();
        let url = format!(
            "http://{addr}/stream?to={bob_id}&from={alice_id}&name=x.txt&size=1024"
        );
        tokio::spawn(async move {
            let resp = http.get(url).send().await.expect("download request failed");
            let headers = resp.headers().clone();
            let status = resp.status();
            let body = resp.bytes().await.expect("download body failed");
            (status, headers, body)
        })
    };
    let upload = http
        .post(format!("http://{addr}/stream?to={bob_id}&name=x.txt&size=1024"))
        .body(payload.clone())
        .send();
    let upload = timeout(TEST_TIMEOUT, upload)
        .await
        .expect("upload timed out")
        .expect("upload request failed");
    assert_eq!(upload.status(), reqwest::StatusCode::OK);
    let receipt: Value = upload.json().await.unwrap();
    assert_eq!(receipt["bytes"], 1024);

    let (status, headers, body) = timeout(TEST_TIMEOUT, download)
        .await
        .expect("download timed out")
        .unwrap();
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(headers["content-length"], "1024");
    assert_eq!(headers["content-disposition"], "attachment; filename=x.txt");
    assert_eq!(headers["content-type"], "application/octet-stream");
    assert_eq!(body.as_ref(), payload.as_slice());

    next_of_type(&mut alice, "complete").await;
    next_of_type(&mut bob, "complete").await;
    assert!(!server.state.transfers.contains(&bob_id));
}

#[tokio::test]
async fn disconnect_updates_membership() {
    let server = start_server(test_app_state().await).await;

    let (mut alice, alice_id) = connect_client(server.addr).await;
    let (mut bob, bob_id) = connect_client(server.addr).await;
    wait_for_list(&mut alice, &[&alice_id, &bob_id]).await;

    bob.close(None).await.unwrap();
    wait_for_list(&mut alice, &[&alice_id]).await;
    assert_eq!(server.state.connections.identities().await.len(), 1);
}

#[tokio::test]
async fn offer_to_absent_client_is_dropped() {
    let server = start_server(test_app_state().await).await;

    let (mut alice, alice_id) = connect_client(server.addr).await;
    send_json(
        &mut alice,
        json!({ "type": "offer", "to": "User-99999", "name": "x", "size": 1 }),
    )
    .await;
    // an unparseable frame is skipped too; the connection stays up
    alice.send(Message::text("not json")).await.unwrap();

    let (_bob, bob_id) = connect_client(server.addr).await;
    wait_for_list(&mut alice, &[&alice_id, &bob_id]).await;

    timeout(TEST_TIMEOUT, async {
        while server.state.metrics.snapshot().messages.dropped < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("offer was never counted as dropped");
    assert_eq!(server.state.metrics.snapshot().messages.relayed, 0);
}

#[tokio::test]
async fn unpaired_upload_expires() {
    let mut state = test_app_state().await;
    set_attach_timeout(&mut state, Duration::from_millis(100));
    let server = start_server(state).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{}/stream?to=User-00042&name=x&size=3", server.addr))
        .body(b"abc".to_vec())
        .send()
        .await
        .expect("upload request failed");
    assert_eq!(resp.status(), reqwest::StatusCode::REQUEST_TIMEOUT);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("User-00042"));
    assert!(!server.state.transfers.contains("User-00042"));
}
