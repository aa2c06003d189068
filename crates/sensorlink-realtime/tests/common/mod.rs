//! A small Phoenix server for integration tests.
//!
//! Speaks the v2 array serializer, auto-replies to joins, leaves, and
//! heartbeats (each switchable), and hands every accepted connection to the
//! test as a [`ServerConn`] for inspection and scripted pushes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use sensorlink_realtime::{ClientConfig, ClientEvent, SocketConfig};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Settings {
    pub auto_join: AtomicBool,
    pub auto_heartbeat: AtomicBool,
    pub auto_reply: AtomicBool,
}

pub struct MockServer {
    pub url: String,
    pub conns: mpsc::UnboundedReceiver<ServerConn>,
    pub settings: Arc<Settings>,
}

pub enum ServerCmd {
    Text(String),
    Close,
    Drop,
}

/// One accepted client connection. Dropping it drops the connection.
pub struct ServerConn {
    pub uri: String,
    frames: mpsc::UnboundedReceiver<Value>,
    cmds: mpsc::UnboundedSender<ServerCmd>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = Arc::new(Settings {
            auto_join: AtomicBool::new(true),
            auto_heartbeat: AtomicBool::new(true),
            auto_reply: AtomicBool::new(false),
        });
        let (conns_tx, conns) = mpsc::unbounded_channel();

        let accept_settings = settings.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_settings.clone(), conns_tx.clone()));
            }
        });

        Self {
            url: format!("ws://{addr}/socket/websocket"),
            conns,
            settings,
        }
    }

    pub fn set(&self, flag: impl Fn(&Settings) -> &AtomicBool, on: bool) {
        flag(&self.settings).store(on, Ordering::SeqCst);
    }

    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }
}

impl ServerConn {
    /// Next frame from the client, heartbeats included.
    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("no frame within timeout")
            .expect("connection closed")
    }

    /// Next frame with the given event, skipping others.
    pub async fn next_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame[3] == event {
                return frame;
            }
        }
    }

    pub fn push(&self, join_ref: Value, topic: &str, event: &str, payload: Value) {
        let text = json!([join_ref, null, topic, event, payload]).to_string();
        let _ = self.cmds.send(ServerCmd::Text(text));
    }

    pub fn raw(&self, text: &str) {
        let _ = self.cmds.send(ServerCmd::Text(text.to_string()));
    }

    /// Reply to a client frame, echoing its refs.
    pub fn reply(&self, to: &Value, status: &str, response: Value) {
        let text = json!([
            to[0],
            to[1],
            to[2],
            "phx_reply",
            {"status": status, "response": response}
        ])
        .to_string();
        let _ = self.cmds.send(ServerCmd::Text(text));
    }

    pub fn close(&self) {
        let _ = self.cmds.send(ServerCmd::Close);
    }

    pub fn drop_connection(&self) {
        let _ = self.cmds.send(ServerCmd::Drop);
    }
}

async fn serve(
    stream: TcpStream,
    settings: Arc<Settings>,
    conns_tx: mpsc::UnboundedSender<ServerConn>,
) {
    let (uri_tx, uri_rx) = oneshot::channel();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let _ = uri_tx.send(req.uri().to_string());
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let uri = uri_rx.await.unwrap_or_default();

    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (cmds, mut cmd_rx) = mpsc::unbounded_channel();
    let _ = conns_tx.send(ServerConn { uri, frames, cmds });

    let (mut sink, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    let auto = match frame[3].as_str() {
                        Some("heartbeat") => settings.auto_heartbeat.load(Ordering::SeqCst),
                        Some("phx_join") => settings.auto_join.load(Ordering::SeqCst),
                        Some("phx_leave") => true,
                        _ => settings.auto_reply.load(Ordering::SeqCst),
                    };
                    if auto {
                        let reply = json!([
                            frame[0],
                            frame[1],
                            frame[2],
                            "phx_reply",
                            {"status": "ok", "response": {}}
                        ]);
                        let _ = sink.send(Message::Text(reply.to_string().into())).await;
                    }
                    let _ = frames_tx.send(frame);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ServerCmd::Text(text)) => {
                    let _ = sink.send(Message::Text(text.into())).await;
                }
                Some(ServerCmd::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(ServerCmd::Drop) | None => break,
            },
        }
    }
}

/// A listener that answers every handshake with a bare HTTP status.
pub async fn rejecting_server(status: u16) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!("HTTP/1.1 {status} Rejected\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });
    (format!("ws://{addr}/socket/websocket"), attempts)
}

/// Socket timings scaled down for tests.
pub fn fast_socket() -> SocketConfig {
    SocketConfig {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(400),
        connect_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(100),
        jitter: false,
        ..SocketConfig::default()
    }
}

pub fn fast_client(url: &str) -> ClientConfig {
    ClientConfig {
        socket: fast_socket(),
        join_timeout: Duration::from_secs(2),
        push_timeout: Duration::from_secs(2),
        rejoin_delays: vec![Duration::from_millis(50)],
        ..ClientConfig::new(url)
    }
}

/// Wait for the first event matching `pred`.
pub async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("no matching event within timeout")
}
