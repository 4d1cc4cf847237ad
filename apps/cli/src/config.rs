use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use todosync_core::sync::MonitorConfig;
use todosync_remote::RemoteClientConfig;

/// Connection and storage settings, from flags or `TODOSYNC_*` variables.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Base URL of the record service
    #[arg(
        long,
        env = "TODOSYNC_API_URL",
        default_value = "http://localhost:3000",
        global = true
    )]
    pub api_url: String,

    /// Realtime endpoint (defaults to ws://<api host>/realtime)
    #[arg(long, env = "TODOSYNC_REALTIME_URL", global = true)]
    pub realtime_url: Option<String>,

    /// SQLite file holding the local cache and pending queue
    #[arg(
        long,
        env = "TODOSYNC_DB_PATH",
        default_value = "todosync.db",
        value_name = "PATH",
        global = true
    )]
    pub db_path: PathBuf,

    #[arg(
        long,
        env = "TODOSYNC_HEALTH_INTERVAL_SECS",
        default_value_t = 5,
        global = true
    )]
    pub health_interval_secs: u64,

    #[arg(
        long,
        env = "TODOSYNC_HEALTH_TIMEOUT_MS",
        default_value_t = 2000,
        global = true
    )]
    pub health_timeout_ms: u64,

    /// How long one-shot commands wait for sync to finish before exiting
    #[arg(long, default_value_t = 10, global = true)]
    pub settle_timeout_secs: u64,
}

impl Config {
    pub fn remote(&self) -> RemoteClientConfig {
        let mut remote = RemoteClientConfig::new(self.api_url.clone());
        remote.realtime_url = self.realtime_url.clone();
        remote
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.health_interval_secs.max(1)),
            probe_timeout: Duration::from_millis(self.health_timeout_ms.max(1)),
        }
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.settle_timeout_secs)
    }
}
