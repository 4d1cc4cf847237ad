//! Remote record service client: REST over `reqwest` and the realtime channel
//! over `tokio-tungstenite`.

pub mod client;
pub mod config;
pub mod error;
pub mod realtime;
mod types;

pub use client::ItemsApiClient;
pub use config::RemoteClientConfig;
pub use error::{RemoteError, Result};
pub use realtime::WebSocketRealtime;
