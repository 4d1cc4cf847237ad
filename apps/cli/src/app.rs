//! Wiring of storage, remote client, connectivity monitor and engine.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use todosync_core::sync::{
    ConnectivityMonitor, NetworkSignal, SyncEngine, SyncEngineConfig, SyncEngineDeps,
};
use todosync_remote::{ItemsApiClient, WebSocketRealtime};
use todosync_storage_sqlite::SqliteKeyValueStore;

pub struct App {
    pub engine: SyncEngine,
    pub monitor: ConnectivityMonitor,
    realtime: Arc<WebSocketRealtime>,
    // Process-level reachability. A terminal has no OS reachability feed, so
    // the health probe alone decides.
    _network: NetworkSignal,
    settle_timeout: Duration,
    connect_wait: Duration,
}

impl App {
    pub async fn start(config: &Config) -> Result<Self> {
        let store = SqliteKeyValueStore::open(&config.db_path).with_context(|| {
            format!("failed to open cache database '{}'", config.db_path.display())
        })?;

        let remote_config = config.remote();
        let remote = Arc::new(ItemsApiClient::new(&remote_config));
        let realtime = Arc::new(
            WebSocketRealtime::connect(remote_config.realtime_url())
                .context("invalid realtime url")?,
        );

        let network = NetworkSignal::new(true);
        let monitor_config = config.monitor();
        let monitor = ConnectivityMonitor::start(network.subscribe(), remote.clone(), monitor_config);

        let engine = SyncEngine::start(
            SyncEngineDeps {
                store: Arc::new(store),
                remote,
                realtime: realtime.clone(),
                can_sync: monitor.subscribe(),
            },
            SyncEngineConfig::default(),
        )
        .await
        .context("failed to start sync engine")?;

        Ok(Self {
            engine,
            monitor,
            realtime,
            _network: network,
            settle_timeout: config.settle_timeout(),
            connect_wait: monitor_config.probe_timeout + Duration::from_millis(500),
        })
    }

    /// Give the first health probe a chance to report before acting.
    pub async fn wait_for_sync(&self) -> bool {
        let mut can_sync = self.engine.subscribe_can_sync();
        let ready = matches!(
            tokio::time::timeout(self.connect_wait, can_sync.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        if !ready {
            debug!("Record service not reachable, working offline");
        }
        ready
    }

    /// Wait, bounded, until queued work has been sent.
    pub async fn flush(&self) {
        let outcome = tokio::time::timeout(self.settle_timeout, async {
            self.engine.settle().await?;
            if self.engine.can_sync() && !self.engine.pending_actions().await?.is_empty() {
                let report = self.engine.sync_now().await?;
                debug!(
                    "Drain cycle {}: {} confirmed, {} retained",
                    report.cycle, report.confirmed, report.retained
                );
            }
            Ok::<_, todosync_core::Error>(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Sync incomplete: {}", err),
            Err(_) => warn!(
                "Sync still running after {:?}; pending changes stay queued",
                self.settle_timeout
            ),
        }
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        self.monitor.shutdown();
        self.realtime.shutdown();
    }
}
