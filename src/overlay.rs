use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type ClientId = u64;
type ClientMap = Arc<Mutex<HashMap<ClientId, mpsc::UnboundedSender<WsMessage>>>>;

/// Everything the browser overlay can be told, JSON-tagged on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEvent {
    VoteProgress {
        command: String,
        count: u32,
        threshold: u32,
    },
    ThresholdReached {
        command: String,
        threshold: u32,
    },
    VoteReset {
        command: String,
    },
}

/// What vote handling needs from the overlay transport: who is listening and
/// a way to tell them things.
pub trait OverlayChannel {
    fn listener_count(&self) -> usize;
    fn broadcast(&self, event: &OverlayEvent);
}

/// WebSocket fan-out to connected overlay pages. Cheap to clone; all clones
/// share the client registry.
#[derive(Clone, Default)]
pub struct OverlayServer {
    clients: ClientMap,
    next_client_id: Arc<AtomicU64>,
}

impl OverlayServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the listener and spawns the accept loop. Returns the bound port
    /// (useful when `port` is 0).
    pub async fn start(&self, port: u16) -> Result<u16> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("could not bind overlay port {port}"))?;
        let bound_port = listener.local_addr()?.port();
        tracing::info!("overlay channel listening on ws://127.0.0.1:{bound_port}");

        let clients = Arc::clone(&self.clients);
        let next_client_id = Arc::clone(&self.next_client_id);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let id = next_client_id.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(%addr, id, "overlay client connecting");
                        tokio::spawn(client_task(stream, id, Arc::clone(&clients)));
                    }
                    Err(e) => {
                        tracing::warn!("overlay accept failed: {e}");
                    }
                }
            }
        });

        Ok(bound_port)
    }
}

impl OverlayChannel for OverlayServer {
    /// Number of currently connected overlay pages.
    fn listener_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Sends `event` to every connected client. Clients whose channel is gone
    /// are dropped from the registry.
    fn broadcast(&self, event: &OverlayEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("could not serialize overlay event: {e}");
                return;
            }
        };

        let mut clients = self.clients.lock();
        clients.retain(|id, tx| {
            let alive = tx.send(WsMessage::Text(payload.clone())).is_ok();
            if !alive {
                tracing::debug!(id = *id, "dropping disconnected overlay client");
            }
            alive
        });
    }
}

async fn client_task(stream: TcpStream, id: ClientId, clients: ClientMap) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(id, "overlay websocket handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    clients.lock().insert(id, tx);
    tracing::info!(id, "overlay client connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(WsMessage::Ping(payload))) => {
                    if sink.send(WsMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // overlay pages have nothing to tell us
                Some(Err(e)) => {
                    tracing::debug!(id, "overlay client read failed: {e}");
                    break;
                }
            },
        }
    }

    clients.lock().remove(&id);
    tracing::info!(id, "overlay client disconnected");
}
