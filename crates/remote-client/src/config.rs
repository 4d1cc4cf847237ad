use std::time::Duration;

/// Default timeout for CRUD requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the record service.
#[derive(Debug, Clone)]
pub struct RemoteClientConfig {
    /// Base URL of the record service, e.g. `http://localhost:3000`.
    pub base_url: String,
    /// Realtime endpoint. Derived from `base_url` when unset.
    pub realtime_url: Option<String>,
    /// Collection route, relative to `base_url`.
    pub collection_path: String,
    /// Liveness route, relative to `base_url`.
    pub health_path: String,
    pub request_timeout: Duration,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            realtime_url: None,
            collection_path: "/todos".to_string(),
            health_path: "/".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RemoteClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// `ws(s)://host[:port]/realtime` unless overridden.
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let socket_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime", socket_base)
    }
}
