//! Contracts for the remote record service and its realtime channel.

use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::sync_model::RemoteEvent;
use crate::errors::Result;
use crate::items::Item;

/// CRUD surface of the remote record service.
///
/// Implementations return the server-confirmed item for create/update; the
/// server may normalize fields. Failures map onto the core error taxonomy.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Item>>;
    async fn create(&self, item: &Item) -> Result<Item>;
    async fn update(&self, item: &Item) -> Result<Item>;
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Lightweight liveness check used by the connectivity monitor.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

/// Persistent realtime subscription plus outbound publication of this
/// client's confirmed mutations.
pub trait RealtimeChannel: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent>;
    fn publish(&self, event: RemoteEvent);

    /// Link state, for channels that can drop and reconnect.
    fn connection_state(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// In-process realtime hub. Every publication is delivered to every
/// subscriber, including the publisher.
#[derive(Debug, Clone)]
pub struct LocalRealtimeHub {
    sender: broadcast::Sender<RemoteEvent>,
    connected: Arc<watch::Sender<bool>>,
}

impl LocalRealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (connected, _) = watch::channel(true);
        Self {
            sender,
            connected: Arc::new(connected),
        }
    }

    /// Simulate the link dropping or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

impl Default for LocalRealtimeHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RealtimeChannel for LocalRealtimeHub {
    fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: RemoteEvent) {
        if self.sender.send(event).is_err() {
            debug!("[Realtime] Dropped local publication: no subscribers");
        }
    }

    fn connection_state(&self) -> Option<watch::Receiver<bool>> {
        Some(self.connected.subscribe())
    }
}
