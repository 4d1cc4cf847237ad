//! Realtime channel over a WebSocket.
//!
//! Frames are JSON text `{ "event": "todo:add" | "todo:update" | "todo:delete", "payload": ... }`.
//! The connection task reconnects with jittered exponential backoff. Events
//! missed while disconnected are not replayed; the engine recovers them with a
//! full refresh.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{RemoteError, Result};
use todosync_core::constants::backoff_delay;
use todosync_core::sync::{RealtimeChannel, RemoteEvent};

const INBOUND_CAPACITY: usize = 256;

pub struct WebSocketRealtime {
    inbound: broadcast::Sender<RemoteEvent>,
    outbound: mpsc::UnboundedSender<RemoteEvent>,
    connected: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketRealtime {
    /// Start the connection task for `url` (`ws://` or `wss://`).
    pub fn connect(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(RemoteError::invalid_request(format!(
                "realtime url must use ws:// or wss://, got '{}'",
                url
            )));
        }

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let task = tokio::spawn(run_connection(
            url,
            inbound.clone(),
            outbound_rx,
            connected_tx,
        ));

        Ok(Self {
            inbound,
            outbound,
            connected,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn shutdown(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl Drop for WebSocketRealtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RealtimeChannel for WebSocketRealtime {
    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.inbound.subscribe()
    }

    fn publish(&self, event: RemoteEvent) {
        if self.outbound.send(event).is_err() {
            debug!("[Realtime] Connection task stopped, dropping publication");
        }
    }

    fn connection_state(&self) -> Option<watch::Receiver<bool>> {
        Some(self.connected.clone())
    }
}

async fn run_connection(
    url: String,
    inbound: broadcast::Sender<RemoteEvent>,
    mut outbound: mpsc::UnboundedReceiver<RemoteEvent>,
    connected: watch::Sender<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        let mut dropped = 0usize;
        while outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                "[Realtime] Dropped {} publications made while disconnected",
                dropped
            );
        }

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                attempt = 0;
                info!("[Realtime] Connected to {}", url);
                connected.send_replace(true);
                let closed_by_owner = pump_socket(socket, &inbound, &mut outbound).await;
                connected.send_replace(false);
                if closed_by_owner {
                    return;
                }
                warn!("[Realtime] Connection to {} lost", url);
            }
            Err(err) => {
                debug!("[Realtime] Connect to {} failed: {}", url, err);
            }
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!("[Realtime] Reconnecting in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Relay frames until the socket drops. Returns true when every handle is gone.
async fn pump_socket<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    inbound: &broadcast::Sender<RemoteEvent>,
    outbound: &mut mpsc::UnboundedReceiver<RemoteEvent>,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RemoteEvent>(&text) {
                    Ok(event) => {
                        debug!("[Realtime] {:?} for item {}", event.kind(), event.item_id());
                        let _ = inbound.send(event);
                    }
                    Err(err) => debug!("[Realtime] Ignoring unrecognized frame: {}", err),
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("[Realtime] Socket error: {}", err);
                    return false;
                }
            },
            publication = outbound.recv() => match publication {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("[Realtime] Failed to encode event for {}: {}", event.item_id(), err);
                            continue;
                        }
                    };
                    if let Err(err) = write.send(Message::Text(text)).await {
                        warn!("[Realtime] Failed to publish event: {}", err);
                        return false;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return true;
                }
            },
        }
    }
}
