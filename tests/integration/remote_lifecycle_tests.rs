//! Integration tests for a daemon connected to a remote authority:
//! registration, the running-state push and the shutting-down push made
//! before the channel closes and local state is cleared.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_steward::control::client::ControlClient;
use agent_steward::lifecycle::daemon::{Daemon, StartOutcome};
use agent_steward::lifecycle::shutdown::ShutdownSignal;
use agent_steward::models::machine::{DaemonState, DaemonStatus, MachineMetadata, ShutdownSource};
use agent_steward::sync::crypto::{decrypt_json, AesGcmCipher};
use agent_steward::sync::protocol::{Frame, EVENT_UPDATE_METADATA, EVENT_UPDATE_STATE};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use super::test_helpers::{test_config, test_deps};

const SECRET: [u8; 32] = [9; 32];
const TOKEN: &str = "remote-token";

/// What the fake authority observed, in arrival order.
#[derive(Debug)]
enum Seen {
    Registered {
        authorization: Option<String>,
        body: Value,
    },
    Update {
        event: String,
        data: Value,
        state_file_present: bool,
    },
    SocketClosed,
}

/// Serves `POST /v1/machines` and the `/v1/updates` socket on one port.
struct FakeAuthority {
    base_url: String,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl FakeAuthority {
    async fn start(state_path: PathBuf) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, seen) = mpsc::unbounded_channel();
        let state_path = Arc::new(state_path);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let state_path = Arc::clone(&state_path);
                tokio::spawn(async move {
                    if is_socket_upgrade(&stream).await {
                        serve_socket(stream, tx, &state_path).await;
                    } else {
                        serve_registration(stream, tx).await;
                    }
                });
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            seen,
        }
    }

    async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(10), self.seen.recv())
            .await
            .expect("authority observation in time")
            .expect("authority still running")
    }
}

async fn is_socket_upgrade(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 64];
    for _ in 0..200 {
        let n = stream.peek(&mut buf).await.unwrap_or(0);
        let head = String::from_utf8_lossy(&buf[..n]);
        if head.contains("\r\n") || n == buf.len() {
            return head.starts_with("GET /v1/updates");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn serve_registration(mut stream: TcpStream, tx: mpsc::UnboundedSender<Seen>) {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.expect("read request");
        assert!(n > 0, "request ended before headers");
        raw.extend_from_slice(&chunk[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let header = |name: &str| {
        head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_owned())
        })
    };
    let length: usize = header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while raw.len() < header_end + length {
        let n = stream.read(&mut chunk).await.expect("read body");
        assert!(n > 0, "request ended before body");
        raw.extend_from_slice(&chunk[..n]);
    }
    let body: Value =
        serde_json::from_slice(&raw[header_end..header_end + length]).expect("json body");

    let reply = json!({
        "machine": {
            "id": body["id"],
            "metadata": body["metadata"],
            "metadataVersion": 1,
            "daemonState": body["daemonState"],
            "daemonStateVersion": 1
        }
    })
    .to_string();
    let _ = tx.send(Seen::Registered {
        authorization: header("authorization"),
        body,
    });

    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
        reply.len()
    );
    stream
        .write_all(response.as_bytes())
        .await
        .expect("write response");
    let _ = stream.shutdown().await;
}

async fn serve_socket(stream: TcpStream, tx: mpsc::UnboundedSender<Seen>, state_path: &Path) {
    type HandshakeResult = std::result::Result<Response, ErrorResponse>;
    let callback = |_req: &Request, resp: Response| -> HandshakeResult { Ok(resp) };
    let mut socket = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .expect("websocket handshake");

    while let Some(Ok(message)) = socket.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(Frame::Event { event, ack_id, data }) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };
        if event != EVENT_UPDATE_STATE && event != EVENT_UPDATE_METADATA {
            continue;
        }
        let version = data["expectedVersion"].as_u64().unwrap_or(0) + 1;
        let _ = tx.send(Seen::Update {
            event,
            data,
            state_file_present: state_path.exists(),
        });
        if let Some(ack_id) = ack_id {
            let ack = Frame::Ack {
                ack_id,
                data: json!({"result": "success", "version": version}),
            };
            let text = serde_json::to_string(&ack).expect("encode ack");
            if socket.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    }
    let _ = tx.send(Seen::SocketClosed);
}

fn open_state(cipher: &AesGcmCipher, data: &Value) -> DaemonState {
    let sealed = data["daemonState"].as_str().expect("daemon state is sealed");
    decrypt_json(cipher, sealed).expect("daemon state opens")
}

#[tokio::test]
async fn remote_daemon_registers_pushes_state_and_announces_shutdown() {
    let home = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(home.path());
    let state_path = config.state_path();
    let lock_path = config.lock_path();
    let mut authority = FakeAuthority::start(state_path.clone()).await;
    config.server_url = Some(authority.base_url.clone());
    std::fs::write(
        config.credentials_path(),
        json!({"token": TOKEN, "secret": STANDARD.encode(SECRET)}).to_string(),
    )
    .expect("write credentials");
    let cipher = AesGcmCipher::new(&SECRET);

    let daemon = match Daemon::start(config, test_deps(home.path(), ShutdownSignal::new()))
        .await
        .expect("daemon starts")
    {
        StartOutcome::Running(daemon) => daemon,
        StartOutcome::AlreadyRunning { pid, .. } => panic!("unexpected running daemon {pid}"),
        StartOutcome::LockUnavailable => panic!("lock unexpectedly held"),
    };
    let pid = std::process::id();

    match authority.next().await {
        Seen::Registered {
            authorization,
            body,
        } => {
            assert_eq!(authorization.as_deref(), Some("Bearer remote-token"));
            let registered = open_state(&cipher, &body);
            assert_eq!(registered.status, DaemonStatus::Running);
            assert_eq!(registered.pid, Some(pid));
            let metadata: MachineMetadata = decrypt_json(
                &cipher,
                body["metadata"].as_str().expect("metadata is sealed"),
            )
            .expect("metadata opens");
            assert_eq!(metadata.cli_version, "0.3.0");
        }
        other => panic!("expected registration first, got {other:?}"),
    }

    let mut saw_running = false;
    let mut saw_metadata = false;
    while !(saw_running && saw_metadata) {
        match authority.next().await {
            Seen::Update { event, data, .. } if event == EVENT_UPDATE_STATE => {
                assert_eq!(data["expectedVersion"], 1);
                let state = open_state(&cipher, &data);
                assert_eq!(state.status, DaemonStatus::Running);
                assert_eq!(state.http_port, Some(daemon.port()));
                saw_running = true;
            }
            Seen::Update { event, .. } if event == EVENT_UPDATE_METADATA => saw_metadata = true,
            other => panic!("unexpected observation before shutdown: {other:?}"),
        }
    }

    ControlClient::new(daemon.port())
        .expect("client")
        .stop_daemon()
        .await
        .expect("stop accepted");
    let request = daemon.run_until_shutdown().await;
    assert_eq!(request.source, ShutdownSource::Local);

    let mut shutting_down = None;
    loop {
        match authority.next().await {
            Seen::Update {
                event,
                data,
                state_file_present,
            } if event == EVENT_UPDATE_STATE => {
                let state = open_state(&cipher, &data);
                if state.status == DaemonStatus::ShuttingDown {
                    shutting_down = Some((state, state_file_present));
                }
            }
            Seen::SocketClosed => break,
            Seen::Update { .. } => {}
            other => panic!("unexpected observation during shutdown: {other:?}"),
        }
    }

    let (state, state_file_present) =
        shutting_down.expect("shutting-down state pushed before the socket closed");
    assert_eq!(state.shutdown_source, Some(ShutdownSource::Local));
    assert!(state.shutdown_requested_at.is_some());
    assert_eq!(state.pid, Some(pid));
    assert!(
        state_file_present,
        "local state is cleared only after the push"
    );

    assert!(!state_path.exists());
    assert!(!lock_path.exists());
}
