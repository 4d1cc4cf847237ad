//! Offline-first sync: pending queue, connectivity, remote contracts and the
//! reconciliation engine.

mod connectivity;
mod engine;
mod pending_queue;
mod remote;
mod sync_model;

pub use connectivity::*;
pub use engine::{SyncEngine, SyncEngineConfig, SyncEngineDeps};
pub use pending_queue::*;
pub use remote::*;
pub use sync_model::*;

#[cfg(test)]
mod tests;
