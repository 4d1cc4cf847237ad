//! SQLite-backed key-value persistence for the durable cache.

mod errors;
mod kv_store;

pub use errors::StorageError;
pub use kv_store::SqliteKeyValueStore;
