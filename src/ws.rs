//! A request/response sub-protocol multiplexed over a single websocket, with
//! keep-alives and disconnect detection. Outgoing requests are matched to
//! responses by a random `u64` id, and incoming requests are handed to a
//! caller-supplied handler that must acknowledge exactly once.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::{WebSocketMessage, WebSocketRequestMessage, WebSocketResponseMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Close code for an operator-requested close. Reconnect logic must treat this as
/// intentional and not reconnect.
pub const CLOSE_CODE_NORMAL: u16 = 3000;
/// Close code used when a keep-alive ping goes unanswered.
pub const CLOSE_CODE_KEEPALIVE_TIMEOUT: u16 = 3001;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handed to a `RequestHandler` so it can acknowledge an inbound request exactly
/// once, from wherever in its handling logic that becomes possible.
#[derive(Clone)]
pub struct Responder {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    responded: Arc<AtomicBool>,
}

impl Responder {
    pub fn respond(&self, status: u16, message: impl Into<String>) -> Result<()> {
        if self.responded.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol(format!("request {} already responded to", self.id)));
        }
        let frame = WebSocketMessage::Response(WebSocketResponseMessage {
            id: self.id,
            status,
            message: message.into(),
            body: None,
        });
        let bytes = serde_json::to_vec(&frame)?;
        self.outbound
            .send(Message::Binary(bytes))
            .map_err(|_| Error::Disconnected("websocket writer closed".to_string()))
    }
}

/// Handles an inbound request. Implementations MUST call `responder.respond(..)`
/// exactly once. The resource awaits this call inline for every inbound frame, so
/// handling is serialized per resource (the receiver relies on this to avoid
/// racing decrypts against the same session).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: WebSocketRequestMessage, responder: Responder);
}

struct Pending {
    tx: oneshot::Sender<WebSocketResponseMessage>,
}

/// A connected request/response websocket.
pub struct WebSocketResource {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    next_id: AtomicU64,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl WebSocketResource {
    /// Connect to `url` and start the reader/writer/keep-alive tasks. Inbound
    /// requests are dispatched to `handler`; `keepalive_path` is GET'd on the
    /// inactivity timer (every 55s by default, configurable via `config`).
    pub async fn connect(
        url: &str,
        handler: Arc<dyn RequestHandler>,
        keepalive_path: &str,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Arc<Mutex<HashMap<u64, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));
        let activity = Arc::new(Notify::new());

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_outbound = outbound_tx.clone();
        let reader_activity = activity.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let Ok(frame) = frame else { break };
                reader_activity.notify_waiters();
                let bytes = match frame {
                    Message::Binary(b) => b,
                    Message::Text(t) => t.into_bytes(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(parsed) = serde_json::from_slice::<WebSocketMessage>(&bytes) else {
                    warn!("dropping unparseable websocket frame");
                    continue;
                };
                match parsed {
                    WebSocketMessage::Response(resp) => {
                        if let Some(pending) = reader_pending.lock().await.remove(&resp.id) {
                            let _ = pending.tx.send(resp);
                        }
                    }
                    WebSocketMessage::Request(req) => {
                        let responder = Responder {
                            id: req.id,
                            outbound: reader_outbound.clone(),
                            responded: Arc::new(AtomicBool::new(false)),
                        };
                        handler.handle(req, responder).await;
                    }
                }
            }
        });

        let keepalive_outbound = outbound_tx.clone();
        let keepalive_pending = pending.clone();
        let keepalive_closing = closing.clone();
        let keepalive_activity = activity.clone();
        let keepalive_path = keepalive_path.to_string();
        let keepalive_interval = config.keepalive_interval;
        let keepalive_disconnect_timeout = config.keepalive_disconnect_timeout;
        let keepalive_id_seed = AtomicU64::new(1);
        let keepalive_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(keepalive_interval) => {}
                    _ = keepalive_activity.notified() => { continue; }
                }
                if keepalive_closing.load(Ordering::SeqCst) {
                    break;
                }
                let id = keepalive_id_seed.fetch_add(1, Ordering::SeqCst) | (1 << 63);
                let (tx, rx) = oneshot::channel();
                keepalive_pending.lock().await.insert(id, Pending { tx });
                let frame = WebSocketMessage::Request(WebSocketRequestMessage {
                    id,
                    verb: "GET".to_string(),
                    path: keepalive_path.clone(),
                    body: None,
                });
                let Ok(bytes) = serde_json::to_vec(&frame) else { continue };
                if keepalive_outbound.send(Message::Binary(bytes)).is_err() {
                    break;
                }
                match tokio::time::timeout(keepalive_disconnect_timeout, rx).await {
                    Ok(_) => debug!("keepalive ack received"),
                    Err(_) => {
                        warn!("keepalive timed out, closing socket");
                        keepalive_pending.lock().await.remove(&id);
                        let close = Message::Close(Some(CloseFrame {
                            code: CLOSE_CODE_KEEPALIVE_TIMEOUT.into(),
                            reason: "keepalive timeout".into(),
                        }));
                        let _ = keepalive_outbound.send(close);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            pending,
            next_id: AtomicU64::new(1),
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
            keepalive_task: Mutex::new(Some(keepalive_task)),
            closing,
        })
    }

    /// Send a request and await the matched response.
    pub async fn send_request(&self, verb: &str, path: &str, body: Option<Vec<u8>>) -> Result<WebSocketResponseMessage> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, Pending { tx });

        let frame = WebSocketMessage::Request(WebSocketRequestMessage {
            id,
            verb: verb.to_string(),
            path: path.to_string(),
            body,
        });
        let bytes = serde_json::to_vec(&frame)?;
        self.outbound
            .send(Message::Binary(bytes))
            .map_err(|_| Error::Disconnected("websocket writer closed".to_string()))?;

        rx.await.map_err(|_| Error::Disconnected("websocket closed before response arrived".to_string()))
    }

    /// Operator-requested close. Uses code 3000 so reconnect logic knows not to retry.
    pub async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let close = Message::Close(Some(CloseFrame { code: CLOSE_CODE_NORMAL.into(), reason: "".into() }));
        let _ = self.outbound.send(close);
        if let Some(h) = self.keepalive_task.lock().await.take() {
            h.abort();
        }
    }

    /// Block until the reader task (the connection) has ended.
    pub async fn closed(&self) {
        if let Some(h) = self.reader_task.lock().await.take() {
            let _ = h.await;
        }
        if let Some(h) = self.writer_task.lock().await.take() {
            h.abort();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
