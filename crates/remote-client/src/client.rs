//! HTTP client for the todo record service.
//!
//! Plain JSON over REST: `GET/POST {collection}`, `PUT/DELETE {collection}/{id}`,
//! and a `GET` on the health route for liveness.

use async_trait::async_trait;
use log::debug;
use serde::de::DeserializeOwned;

use crate::config::RemoteClientConfig;
use crate::error::{RemoteError, Result};
use crate::types::{ApiErrorResponse, HealthResponse};
use todosync_core::errors::Error as CoreError;
use todosync_core::items::Item;
use todosync_core::sync::{HealthProbe, RemoteStore};

const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the record service.
#[derive(Debug, Clone)]
pub struct ItemsApiClient {
    client: reqwest::Client,
    base_url: String,
    collection_path: String,
    health_path: String,
}

impl ItemsApiClient {
    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Remote] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Remote] Response error ({}): {}", status, preview);
    }

    pub fn new(config: &RemoteClientConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            collection_path: normalize_path(&config.collection_path),
            health_path: normalize_path(&config.health_path),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}{}", self.base_url, self.collection_path)
    }

    fn item_url(&self, id: &str) -> Result<String> {
        if id.trim().is_empty() {
            return Err(RemoteError::invalid_request("item id is required"));
        }
        Ok(format!(
            "{}/{}",
            self.collection_url().trim_end_matches('/'),
            urlencoding::encode(id)
        ))
    }

    /// Read the body, turning non-2xx statuses into `RemoteError::Api`.
    async fn read_body(response: reqwest::Response) -> Result<(reqwest::StatusCode, String)> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .ok()
                .and_then(|error| error.summary())
                .unwrap_or_else(|| format!("Request failed: {}", body));
            return Err(RemoteError::api(status.as_u16(), message));
        }
        Ok((status, body))
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let (status, body) = Self::read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[Remote] Failed to deserialize response ({}). Body: {}, Error: {}",
                status,
                body,
                e
            );
            RemoteError::Json(e)
        })
    }

    /// GET the full collection.
    pub async fn fetch_items(&self) -> Result<Vec<Item>> {
        let url = self.collection_url();
        debug!("[Remote] GET {}", url);
        let response = self.client.get(&url).send().await?;
        Self::parse_response(response).await
    }

    /// POST a new item; returns the stored item.
    pub async fn create_item(&self, item: &Item) -> Result<Item> {
        let url = self.collection_url();
        debug!("[Remote] POST {} (item {})", url, item.id);
        let response = self.client.post(&url).json(item).send().await?;
        Self::parse_response(response).await
    }

    /// PUT a full replacement. `None` when the service answered `null`,
    /// which is how it reports a missing record.
    pub async fn update_item(&self, item: &Item) -> Result<Option<Item>> {
        let url = self.item_url(&item.id)?;
        debug!("[Remote] PUT {}", url);
        let response = self.client.put(&url).json(item).send().await?;
        Self::parse_response(response).await
    }

    pub async fn delete_item(&self, id: &str) -> Result<()> {
        let url = self.item_url(id)?;
        debug!("[Remote] DELETE {}", url);
        let response = self.client.delete(&url).send().await?;
        Self::read_body(response).await.map(|_| ())
    }

    pub async fn check_health(&self) -> Result<()> {
        let url = format!("{}{}", self.base_url, self.health_path);
        let response = self.client.get(&url).send().await?;
        let health: HealthResponse = Self::parse_response(response).await?;
        if !health.is_ok() {
            return Err(RemoteError::Unhealthy(format!("status '{}'", health.status)));
        }
        Ok(())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[async_trait]
impl RemoteStore for ItemsApiClient {
    async fn list_all(&self) -> todosync_core::Result<Vec<Item>> {
        Ok(self.fetch_items().await?)
    }

    async fn create(&self, item: &Item) -> todosync_core::Result<Item> {
        Ok(self.create_item(item).await?)
    }

    async fn update(&self, item: &Item) -> todosync_core::Result<Item> {
        self.update_item(item)
            .await?
            .ok_or_else(|| CoreError::NotFound(item.id.clone()))
    }

    async fn remove(&self, id: &str) -> todosync_core::Result<()> {
        Ok(self.delete_item(id).await?)
    }
}

#[async_trait]
impl HealthProbe for ItemsApiClient {
    async fn probe(&self) -> todosync_core::Result<()> {
        self.check_health().await.map_err(|err| match CoreError::from(err) {
            CoreError::NetworkUnavailable(message) => CoreError::NetworkUnavailable(message),
            other => CoreError::RemoteUnreachable(other.to_string()),
        })
    }
}
