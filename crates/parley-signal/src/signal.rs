use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use parley_common::SignalMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionId, Registry};
use crate::router::{Flow, MessageRouter};

pub const DEFAULT_OUTBOX_CAPACITY: usize = 128;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Send half of one connection's outbox. Cheap to clone and safe to use from
/// any task; the connection's writer task owns the socket.
#[derive(Debug, Clone)]
pub struct Signaler {
    tx: mpsc::Sender<SignalMessage>,
}

impl Signaler {
    pub fn new(tx: mpsc::Sender<SignalMessage>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SignalMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue without waiting. `false` if the outbox is full or the writer is
    /// gone.
    pub fn try_send(&self, signal: SignalMessage) -> bool {
        self.tx.try_send(signal).is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    pub outbox_capacity: usize,
    pub max_message_bytes: usize,
    pub max_connections: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// WebSocket front of the message router.
#[derive(Debug)]
pub struct Gateway {
    router: MessageRouter,
    limits: GatewayLimits,
    active: AtomicUsize,
}

impl Gateway {
    pub fn new(router: MessageRouter, limits: GatewayLimits) -> Self {
        Self {
            router,
            limits,
            active: AtomicUsize::new(0),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim one of `max_connections` slots. The check and the increment are
    /// a single atomic step, so concurrent upgrades cannot overshoot.
    pub fn try_reserve(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.limits.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max).then_some(active + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            gateway: self.clone(),
        })
    }
}

/// A counted connection. Releases its slot when dropped, including when the
/// upgrade never completes.
#[derive(Debug)]
pub struct ConnectionSlot {
    gateway: Arc<Gateway>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.gateway.active.fetch_sub(1, Ordering::AcqRel);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let Some(slot) = gateway.try_reserve() else {
        warn!("refusing connection from {}: connection limit reached", addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let max_bytes = gateway.limits.max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(socket, slot, addr))
        .into_response()
}

async fn handle_socket(stream: WebSocket, slot: ConnectionSlot, addr: SocketAddr) {
    let gateway = slot.gateway.clone();
    let connection = ConnectionId::new();
    info!("client connecting from {} as {}", addr, connection);

    let (sender, mut receiver) = stream.split();
    let (signaler, rx) = Signaler::channel(gateway.limits.outbox_capacity);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let mut writer = tokio::spawn(write_outbox(
        sender,
        rx,
        gateway.router.registry().clone(),
        connection,
        disconnect_tx,
    ));

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                debug!("writer for {} stopped", connection);
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!("read error from {}: {}", addr, err);
                        break;
                    }
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        warn!("binary frame from {}, closing", addr);
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > gateway.limits.max_message_bytes {
                    warn!("oversized frame ({} bytes) from {}, closing", text.len(), addr);
                    break;
                }

                let signal = match SignalMessage::decode(&text) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!("invalid signaling frame from {}: {}", addr, err);
                        break;
                    }
                };

                if gateway.router.dispatch(connection, &signaler, signal).await == Flow::Close {
                    break;
                }
            }
        }
    }

    gateway.router.disconnect(connection).await;
    info!("client disconnected: {} ({})", addr, connection);

    // The registry no longer holds a clone, so dropping ours lets the writer
    // flush what is queued and send a close frame.
    drop(signaler);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    drop(slot);
}

/// Drain `rx` onto the socket. A failed write marks the session stale and
/// wakes the read loop through `disconnect_tx`; a closed outbox ends with a
/// close frame.
async fn write_outbox<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<SignalMessage>,
    registry: Arc<Registry>,
    connection: ConnectionId,
    disconnect_tx: mpsc::Sender<()>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(signal) = rx.recv().await {
        let text = match signal.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("dropping unencodable {} message: {}", signal.kind, err);
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            debug!("write to {} failed: {}", connection, err);
            registry.mark_stale(connection).await;
            let _ = disconnect_tx.try_send(());
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}
