//! Persistent, auto-reconnecting WebSocket channel to the remote authority.
//!
//! One background task owns the socket. Outbound frames go through an
//! unbounded queue that survives reconnects, so frames emitted while
//! disconnected are delivered after the next connect. After every connect
//! the task re-registers the RPC methods and sends a `machine-alive` ping,
//! then keeps pinging on its own interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::Backoff;
use super::protocol::{Frame, MachineAlive, EVENT_MACHINE_ALIVE};
use crate::{AppError, BoxFuture, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Event transport used by the sync client.
pub trait SyncTransport: Send + Sync {
    /// Queue a fire-and-forget event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the channel has been shut down.
    fn emit(&self, event: &str, data: Value) -> Result<()>;

    /// Send an event and wait up to `timeout` for its ack payload.
    fn emit_with_ack<'a>(
        &'a self,
        event: &'a str,
        data: Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Value>>;

    /// Close the channel and stop reconnecting.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Server side of the registered RPC methods.
pub trait RpcService: Send + Sync {
    /// Fully qualified method names to register on every connect.
    fn methods(&self) -> Vec<String>;

    /// Handle one request; `params` and the returned value are base64
    /// encrypted JSON.
    fn call(&self, method: String, params: String) -> BoxFuture<'_, Result<String>>;
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Remote authority base URL (`http(s)://…`).
    pub server_url: String,
    /// Bearer token.
    pub token: String,
    /// Machine identity.
    pub machine_id: String,
    /// Interval between `machine-alive` pings.
    pub keepalive_interval: Duration,
    /// Reconnect delay policy.
    pub reconnect: Backoff,
}

impl ChannelConfig {
    /// WebSocket URL of the machine-scoped update stream.
    #[must_use]
    pub fn socket_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_owned()
        };
        format!(
            "{base}/v1/updates?clientType=machine-scoped&machineId={}",
            self.machine_id
        )
    }
}

/// Handle to the background connection task.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: PendingAcks,
    next_ack: AtomicU64,
    ct: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

fn lock_pending(pending: &PendingAcks) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WsChannel {
    /// Start the connection task. Returns immediately; the first connect
    /// happens in the background.
    #[must_use]
    pub fn connect(config: ChannelConfig, service: Arc<dyn RpcService>) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::default();
        let ct = CancellationToken::new();

        let worker = Worker {
            config,
            service,
            pending: Arc::clone(&pending),
            outbound: outbound.clone(),
            ct: ct.clone(),
        };
        let span = info_span!("sync_channel", machine_id = %worker.config.machine_id);
        let task = tokio::spawn(worker.run(rx).instrument(span));

        Arc::new(Self {
            outbound,
            pending,
            next_ack: AtomicU64::new(1),
            ct,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }
}

impl SyncTransport for WsChannel {
    fn emit(&self, event: &str, data: Value) -> Result<()> {
        self.outbound
            .send(Frame::Event {
                event: event.to_owned(),
                ack_id: None,
                data,
            })
            .map_err(|_| AppError::Sync("channel is closed".into()))
    }

    fn emit_with_ack<'a>(
        &'a self,
        event: &'a str,
        data: Value,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let ack_id = self.next_ack.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            lock_pending(&self.pending).insert(ack_id, tx);

            let frame = Frame::Event {
                event: event.to_owned(),
                ack_id: Some(ack_id),
                data,
            };
            if self.outbound.send(frame).is_err() {
                lock_pending(&self.pending).remove(&ack_id);
                return Err(AppError::Sync("channel is closed".into()));
            }

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(_)) => Err(AppError::Sync(format!("{event} ack dropped"))),
                Err(_) => {
                    lock_pending(&self.pending).remove(&ack_id);
                    Err(AppError::Timeout(format!("{event} was not acknowledged")))
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.ct.cancel();
            let task = self.task.lock().await.take();
            if let Some(task) = task {
                if let Err(err) = task.await {
                    warn!(%err, "sync channel task failed");
                }
            }
            lock_pending(&self.pending).clear();
            info!("sync channel closed");
        })
    }
}

struct Worker {
    config: ChannelConfig,
    service: Arc<dyn RpcService>,
    pending: PendingAcks,
    outbound: mpsc::UnboundedSender<Frame>,
    ct: CancellationToken,
}

enum Disconnect {
    Cancelled,
    Lost,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Frame>) {
        let url = self.config.socket_url();
        loop {
            if self.ct.is_cancelled() {
                break;
            }
            match self.open(&url).await {
                Ok(socket) => {
                    info!("sync channel connected");
                    self.config.reconnect.reset();
                    if let Disconnect::Cancelled = self.serve(socket, &mut rx).await {
                        break;
                    }
                    warn!("sync channel disconnected");
                }
                Err(err) => warn!(%err, "sync channel connect failed"),
            }

            let delay = self.config.reconnect.next_delay();
            debug!(?delay, "reconnecting after delay");
            tokio::select! {
                () = self.ct.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        debug!("sync channel worker exiting");
    }

    async fn open(&self, url: &str) -> Result<Socket> {
        let mut request = url
            .into_client_request()
            .map_err(|err| AppError::Sync(format!("invalid sync url: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.token))
            .map_err(|err| AppError::Sync(format!("invalid token: {err}")))?;
        request.headers_mut().insert("Authorization", bearer);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| AppError::Sync(format!("connect failed: {err}")))?;
        Ok(socket)
    }

    async fn serve(
        &self,
        socket: Socket,
        rx: &mut mpsc::UnboundedReceiver<Frame>,
    ) -> Disconnect {
        let (mut writer, mut reader) = socket.split();

        let mut greeting: Vec<Frame> = self
            .service
            .methods()
            .into_iter()
            .map(|method| Frame::RpcRegister { method })
            .collect();
        greeting.push(self.alive_frame());
        for frame in greeting {
            if let Err(err) = send_frame(&mut writer, &frame).await {
                warn!(%err, "failed to send greeting");
                return Disconnect::Lost;
            }
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.tick().await;

        loop {
            tokio::select! {
                () = self.ct.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Disconnect::Cancelled;
                }
                _ = keepalive.tick() => {
                    if send_frame(&mut writer, &self.alive_frame()).await.is_err() {
                        return Disconnect::Lost;
                    }
                }
                Some(frame) = rx.recv() => {
                    if let Err(err) = send_frame(&mut writer, &frame).await {
                        warn!(%err, "failed to send frame");
                        return Disconnect::Lost;
                    }
                }
                incoming = reader.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text.to_string(),
                        Some(Ok(Message::Close(_))) | None => return Disconnect::Lost,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(%err, "sync channel read error");
                            return Disconnect::Lost;
                        }
                    };
                    self.handle_incoming(&text);
                }
            }
        }
    }

    fn handle_incoming(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "ignoring malformed frame");
                return;
            }
        };

        match frame {
            Frame::Ack { ack_id, data } => match lock_pending(&self.pending).remove(&ack_id) {
                Some(tx) => {
                    let _ = tx.send(data);
                }
                None => debug!(ack_id, "ack for unknown or expired event"),
            },
            Frame::RpcRequest { id, method, params } => {
                let service = Arc::clone(&self.service);
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let result = match service.call(method.clone(), params).await {
                        Ok(result) => result,
                        Err(err) => {
                            // An empty result tells the caller the reply could not be sealed.
                            warn!(method, %err, "rpc request failed");
                            String::new()
                        }
                    };
                    let _ = outbound.send(Frame::RpcResponse { id, result });
                });
            }
            Frame::Event { event, .. } => debug!(event, "ignoring server event"),
            Frame::RpcRegister { .. } | Frame::RpcResponse { .. } => {
                debug!("ignoring unexpected client-bound frame");
            }
        }
    }

    fn alive_frame(&self) -> Frame {
        let alive = MachineAlive {
            machine_id: self.config.machine_id.clone(),
            time: chrono::Utc::now().timestamp_millis(),
        };
        Frame::Event {
            event: EVENT_MACHINE_ALIVE.to_owned(),
            ack_id: None,
            data: serde_json::to_value(alive).unwrap_or(Value::Null),
        }
    }
}

async fn send_frame<S>(writer: &mut S, frame: &Frame) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame)
        .map_err(|err| AppError::Sync(format!("failed to encode frame: {err}")))?;
    writer
        .send(Message::Text(json.into()))
        .await
        .map_err(|err| AppError::Sync(format!("send failed: {err}")))
}
