//! End-to-end tests against a real server using a WebSocket client and HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use perceptor_server::{RelayServer, ServerConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    server: RelayServer,
    addr: SocketAddr,
    upload_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn connect(&self) -> WsStream {
        let (ws, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        ws
    }

    async fn status(&self) -> Value {
        reqwest::get(self.url("/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Poll `/api/status` until `n` connections are live.
    async fn wait_for_connections(&self, n: u64) -> Value {
        timeout(TIMEOUT, async {
            loop {
                let status = self.status().await;
                if status["totalConnections"] == n {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("connection count never reached")
    }

    async fn command(&self, id: &str, body: Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url(&format!("/api/command/{id}")))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

async fn boot(heartbeat_interval_ms: u64) -> TestServer {
    boot_with(|config| {
        config.heartbeat_interval_ms = heartbeat_interval_ms;
        config.heartbeat_timeout_ms = heartbeat_interval_ms;
    })
    .await
}

async fn boot_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().join("uploads");
    let mut config = ServerConfig {
        upload_dir: upload_dir.clone(),
        index_file: dir.path().join("index.html"),
        heartbeat_interval_ms: 0,
        ..ServerConfig::default()
    };
    configure(&mut config);
    let server = RelayServer::new(config);
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        server,
        addr,
        upload_dir,
        _dir: dir,
    }
}

/// Next text frame as JSON, skipping control frames.
async fn recv_json(ws: &mut WsStream) -> Value {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Connect, consume the configuration frame, and return the connection id.
async fn connect_ready(srv: &TestServer, expected_live: u64) -> (WsStream, String) {
    let mut ws = srv.connect().await;
    let config = recv_json(&mut ws).await;
    assert_eq!(config["type"], "clientConfig");
    let status = srv.wait_for_connections(expected_live).await;
    let id = status["connections"][expected_live as usize - 1]["id"]
        .as_str()
        .unwrap()
        .to_owned();
    (ws, id)
}

#[tokio::test]
async fn config_is_first_message_exactly_once() {
    let srv = boot(0).await;
    let mut ws = srv.connect().await;

    let first = recv_json(&mut ws).await;
    assert_eq!(first["type"], "clientConfig");
    assert_eq!(first["config"]["videoFormat"], "mp4");

    send_json(&mut ws, json!({"type": "test"})).await;
    let next = recv_json(&mut ws).await;
    assert_eq!(next, json!({"status": "success", "message": "Test message received"}));
}

#[tokio::test]
async fn binary_before_metadata_is_rejected() {
    let srv = boot(0).await;
    let (mut ws, _id) = connect_ready(&srv, 1).await;

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply, json!({"status": "error", "message": "Metadata not received yet"}));
    assert!(!srv.upload_dir.exists() || std::fs::read_dir(&srv.upload_dir).unwrap().next().is_none());
}

#[tokio::test]
async fn upload_round_trip_updates_status() {
    let srv = boot(0).await;
    let (mut ws, id) = connect_ready(&srv, 1).await;

    send_json(&mut ws, json!({"type": "clientInfo", "clientName": "Dock Cam"})).await;
    send_json(
        &mut ws,
        json!({"type": "upload", "filename": "a.mp4", "filesize": 3, "mimetype": "video/mp4"}),
    )
    .await;
    ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply, json!({"status": "success", "message": "Video uploaded successfully"}));
    assert_eq!(std::fs::read(srv.upload_dir.join("a.mp4")).unwrap(), vec![0, 1, 2]);

    let status = srv.status().await;
    assert_eq!(status["totalConnections"], 1);
    assert_eq!(
        status["connections"][0],
        json!({"id": id, "clientName": "Dock Cam", "lastFilename": "a.mp4", "lastFilesize": 3})
    );

    // A second payload needs fresh metadata.
    ws.send(Message::binary(vec![9u8])).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["message"], "Metadata not received yet");
}

#[tokio::test]
async fn protocol_errors_keep_the_connection_open() {
    let srv = boot(0).await;
    let (mut ws, _id) = connect_ready(&srv, 1).await;

    ws.send(Message::text("{not json")).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["message"], "Invalid JSON");

    send_json(&mut ws, json!({"type": "upload"})).await;
    assert_eq!(recv_json(&mut ws).await["message"], "Invalid upload metadata");

    send_json(&mut ws, json!({"type": "wave"})).await;
    assert_eq!(recv_json(&mut ws).await["message"], "Unknown message type");

    send_json(&mut ws, json!({"type": "upload", "filename": "../escape.mp4"})).await;
    assert_eq!(recv_json(&mut ws).await["message"], "Failed to write file");

    send_json(&mut ws, json!({"type": "test"})).await;
    assert_eq!(recv_json(&mut ws).await["status"], "success");
}

#[tokio::test]
async fn command_reaches_device() {
    let srv = boot(0).await;
    let (mut ws, id) = connect_ready(&srv, 1).await;

    let resp = srv.command(&id, json!({"command": "record", "message": "go"})).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"success": true, "message": "Command sent"}));

    assert_eq!(recv_json(&mut ws).await, json!({"command": "record", "message": "go"}));

    let resp = srv
        .command(&id, json!({"command": "uploadTimeRange", "startTime": 10, "endTime": 20}))
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        recv_json(&mut ws).await,
        json!({"command": "uploadTimeRange", "message": "", "startTime": 10, "endTime": 20})
    );
}

#[tokio::test]
async fn incomplete_time_range_never_reaches_device() {
    let srv = boot(0).await;
    let (mut ws, id) = connect_ready(&srv, 1).await;

    let resp = srv
        .command(&id, json!({"command": "uploadTimeRange", "startTime": 10}))
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"success": false, "error": "Missing startTime or endTime"}));

    let resp = reqwest::Client::new()
        .post(srv.url(&format!("/api/command/{id}")))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // The next frame the device sees is the reply to its own test message.
    send_json(&mut ws, json!({"type": "test"})).await;
    assert_eq!(recv_json(&mut ws).await["message"], "Test message received");
}

#[tokio::test]
async fn command_after_disconnect_is_not_found() {
    let srv = boot(0).await;
    let (mut ws, id) = connect_ready(&srv, 1).await;

    ws.close(None).await.unwrap();
    let _ = srv.wait_for_connections(0).await;

    let resp = srv.command(&id, json!({"command": "record"})).await;
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Connection not found or closed");
}

#[tokio::test]
async fn status_lists_connections_in_order() {
    let srv = boot(0).await;
    let (_ws1, id1) = connect_ready(&srv, 1).await;
    let (_ws2, id2) = connect_ready(&srv, 2).await;
    assert_ne!(id1, id2);

    let status = srv.status().await;
    assert_eq!(status["connections"][0]["id"], id1.as_str());
    assert_eq!(status["connections"][1]["id"], id2.as_str());
    assert_eq!(status["connections"][1]["clientName"], "Unknown Device");
    assert_eq!(status["connections"][1]["lastFilename"], Value::Null);
}

#[tokio::test]
async fn root_path_upgrades_websocket() {
    let srv = boot(0).await;
    let (mut ws, _) = connect_async(format!("ws://{}/", srv.addr)).await.unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "clientConfig");
}

#[tokio::test]
async fn health_and_config_endpoints() {
    let srv = boot(0).await;

    let health: Value = reqwest::get(srv.url("/api/health")).await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["protocols"], json!(["ws"]));

    let config: Value = reqwest::get(srv.url("/api/config")).await.unwrap().json().await.unwrap();
    assert_eq!(config["videoBufferMaxMB"], 16_000);
}

#[tokio::test]
async fn silent_peer_is_dropped_by_keep_alive() {
    let srv = boot(300).await;
    let (ws, _id) = connect_ready(&srv, 1).await;

    // Never reading means pings go unanswered.
    let _ = srv.wait_for_connections(0).await;
    drop(ws);
}

#[tokio::test]
async fn responsive_peer_survives_keep_alive() {
    let srv = boot(300).await;
    let (mut ws, _id) = connect_ready(&srv, 1).await;

    // Reading lets the client answer pings; flushing sends the queued pongs.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1_000);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(_))) = timeout(Duration::from_millis(50), ws.next()).await {
            ws.flush().await.unwrap();
        }
    }
    send_json(&mut ws, json!({"type": "test"})).await;
    assert_eq!(recv_json(&mut ws).await["message"], "Test message received");
    assert_eq!(srv.status().await["totalConnections"], 1);
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let srv = boot(0).await;
    let (mut ws, _id) = connect_ready(&srv, 1).await;

    srv.server.shutdown().shutdown();

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    timeout(TIMEOUT, async {
        while !srv.server.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry never emptied");
}

#[tokio::test]
async fn disconnect_mid_upload_keeps_partial_file() {
    let srv = boot(0).await;
    let (mut ws, _id) = connect_ready(&srv, 1).await;

    send_json(&mut ws, json!({"type": "upload", "filename": "partial.mp4"})).await;
    ws.close(None).await.unwrap();
    let status = srv.wait_for_connections(0).await;
    assert_eq!(status["connections"], json!([]));

    let partial = srv.upload_dir.join("partial.mp4");
    assert!(partial.exists());
    assert_eq!(std::fs::metadata(&partial).unwrap().len(), 0);
}

/// Commands big enough to fill the socket buffers of a peer that never reads.
fn bulky_command() -> Value {
    json!({"command": "record", "message": "x".repeat(1 << 20)})
}

#[tokio::test]
async fn peer_that_stops_reading_is_dropped_on_stalled_write() {
    let srv = boot_with(|config| config.write_timeout_ms = 300).await;
    // Held but never polled, so nothing is read from the socket.
    let (_ws, id) = connect_ready(&srv, 1).await;

    let mut stalled = None;
    for _ in 0..256 {
        let resp = timeout(TIMEOUT, srv.command(&id, bulky_command()))
            .await
            .expect("command never completed");
        if resp.status() != 200 {
            stalled = Some(resp);
            break;
        }
    }
    let resp = stalled.expect("socket never backed up");
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"success": false, "error": "Failed to send message"}));

    let _ = srv.wait_for_connections(0).await;
    let resp = srv.command(&id, json!({"command": "record"})).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn shutdown_drops_peer_that_stopped_reading() {
    let srv = boot_with(|config| config.write_timeout_ms = 600_000).await;
    let (_ws, id) = connect_ready(&srv, 1).await;

    let mut backed_up = false;
    for _ in 0..256 {
        match timeout(Duration::from_millis(500), srv.command(&id, bulky_command())).await {
            Ok(resp) => assert_eq!(resp.status(), 200),
            Err(_) => {
                backed_up = true;
                break;
            }
        }
    }
    assert!(backed_up, "socket never backed up");

    srv.server.shutdown().shutdown();
    timeout(TIMEOUT, async {
        while !srv.server.registry().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection still registered after shutdown");
}

#[tokio::test]
async fn concurrent_commands_and_replies_arrive_whole() {
    let srv = boot(0).await;
    let (mut ws, id) = connect_ready(&srv, 1).await;

    let commands: Vec<_> = (0..20)
        .map(|i| {
            let url = srv.url(&format!("/api/command/{id}"));
            tokio::spawn(async move {
                reqwest::Client::new()
                    .post(url)
                    .json(&json!({"command": "record", "message": "m".repeat(i * 1_000)}))
                    .send()
                    .await
                    .unwrap()
                    .status()
            })
        })
        .collect();
    for _ in 0..20 {
        send_json(&mut ws, json!({"type": "test"})).await;
    }

    let (mut replies, mut delivered) = (0, 0);
    for _ in 0..40 {
        let frame = recv_json(&mut ws).await;
        if frame["status"] == "success" {
            replies += 1;
        } else {
            assert_eq!(frame["command"], "record");
            delivered += 1;
        }
    }
    assert_eq!((replies, delivered), (20, 20));
    for handle in commands {
        assert_eq!(handle.await.unwrap(), 200);
    }
}
