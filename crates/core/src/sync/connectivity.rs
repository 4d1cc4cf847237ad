//! Connectivity monitor: network reachability AND remote liveness.

use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use super::remote::HealthProbe;
use super::sync_model::SyncStatus;
use crate::constants::{HEALTH_POLL_INTERVAL, HEALTH_PROBE_TIMEOUT};

/// Event-driven network reachability source.
///
/// Platform glue (OS reachability callbacks) drives it with `set_online`;
/// the monitor only listens.
#[derive(Debug, Clone)]
pub struct NetworkSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl NetworkSignal {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: HEALTH_POLL_INTERVAL,
            probe_timeout: HEALTH_PROBE_TIMEOUT,
        }
    }
}

struct MonitorState {
    status: watch::Sender<SyncStatus>,
    can_sync: watch::Sender<bool>,
}

impl MonitorState {
    fn update(&self, apply: impl FnOnce(&mut SyncStatus)) {
        self.status.send_modify(apply);
        let status = *self.status.borrow();
        let next = status.can_sync();
        let flipped = self.can_sync.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if flipped {
            info!(
                "[Connectivity] can_sync={} (online={}, remote_reachable={})",
                next, status.online, status.remote_reachable
            );
        }
    }
}

/// Combines the two signals into `can_sync` and notifies only on edges.
pub struct ConnectivityMonitor {
    state: Arc<MonitorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Start listening to `network` and polling `probe`. The first probe runs immediately.
    pub fn start(
        mut network: watch::Receiver<bool>,
        probe: Arc<dyn HealthProbe>,
        config: MonitorConfig,
    ) -> Self {
        let initial = SyncStatus {
            online: *network.borrow_and_update(),
            remote_reachable: false,
        };
        let (status, _) = watch::channel(initial);
        let (can_sync, _) = watch::channel(initial.can_sync());
        let state = Arc::new(MonitorState { status, can_sync });

        let network_state = Arc::clone(&state);
        let network_task = tokio::spawn(async move {
            while network.changed().await.is_ok() {
                let online = *network.borrow_and_update();
                debug!("[Connectivity] Network reachability changed: online={}", online);
                network_state.update(|status| status.online = online);
            }
        });

        let probe_state = Arc::clone(&state);
        let probe_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match timeout(config.probe_timeout, probe.probe()).await {
                    Ok(Ok(())) => true,
                    Ok(Err(err)) => {
                        debug!("[Connectivity] Health probe failed: {}", err);
                        false
                    }
                    Err(_) => {
                        debug!(
                            "[Connectivity] Health probe timed out after {:?}",
                            config.probe_timeout
                        );
                        false
                    }
                };
                probe_state.update(|status| status.remote_reachable = reachable);
            }
        });

        Self {
            state,
            tasks: Mutex::new(vec![network_task, probe_task]),
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.state.status.borrow()
    }

    pub fn can_sync(&self) -> bool {
        *self.state.can_sync.borrow()
    }

    /// Edge-only `can_sync` notifications.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.can_sync.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.state.status.subscribe()
    }

    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedProbe {
        healthy: AtomicBool,
        hang: AtomicBool,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(healthy),
                hang: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::RemoteUnreachable("probe failed".into()))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn can_sync_requires_network_and_liveness() {
        let network = NetworkSignal::new(true);
        let probe = ScriptedProbe::new(true);
        let monitor =
            ConnectivityMonitor::start(network.subscribe(), probe.clone(), MonitorConfig::default());
        let mut rx = monitor.subscribe();
        assert!(!*rx.borrow());

        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.status().remote_reachable);

        network.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.status().online);
        assert!(monitor.status().remote_reachable);

        network.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn notifies_only_on_edges() {
        let network = NetworkSignal::new(true);
        let probe = ScriptedProbe::new(true);
        let monitor =
            ConnectivityMonitor::start(network.subscribe(), probe.clone(), MonitorConfig::default());
        let mut rx = monitor.subscribe();
        rx.changed().await.unwrap();
        rx.borrow_and_update();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 6);
        assert!(!rx.has_changed().unwrap());

        probe.healthy.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_counts_as_unreachable() {
        let network = NetworkSignal::new(true);
        let probe = ScriptedProbe::new(true);
        let monitor =
            ConnectivityMonitor::start(network.subscribe(), probe.clone(), MonitorConfig::default());
        let mut rx = monitor.subscribe();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        probe.hang.store(true, Ordering::SeqCst);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.status().remote_reachable);
        assert!(monitor.status().online);
    }
}
