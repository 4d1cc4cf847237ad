//! Offline-first sync core for a todo collection.
//!
//! Local intents apply immediately and are confirmed against a remote record
//! service when connectivity allows; unconfirmed mutations survive restarts in
//! a durable queue and are replayed in order.

pub mod constants;
pub mod errors;
pub mod items;
pub mod storage;
pub mod sync;

pub use errors::{Error, Result, SyncRetryClass};
pub use items::{Item, ItemDraft, ItemPatch, Priority};
pub use storage::{DurableCache, KeyValueStore, MemoryKeyValueStore};
pub use sync::{
    ConnectivityMonitor, LocalRealtimeHub, MonitorConfig, NetworkSignal, SyncEngine,
    SyncEngineConfig, SyncEngineDeps,
};
