//! Shared constants for the sync core.

use std::time::Duration;

/// Cache key holding the serialized item collection.
pub const ITEMS_CACHE_KEY: &str = "TODOS";

/// Cache key holding the serialized pending-action queue.
pub const PENDING_QUEUE_KEY: &str = "OFFLINE_QUEUE";

/// Cache key holding actions sent straight to the remote and not yet answered.
pub const IN_FLIGHT_KEY: &str = "OFFLINE_QUEUE_IN_FLIGHT";

/// Suffix of the key an unreadable cache entry is copied to before it is replaced.
pub const CORRUPT_ENTRY_SUFFIX: &str = ".corrupt";

/// Maximum length of an item's text, in characters.
pub const MAX_ITEM_TEXT_CHARS: usize = 200;

/// Remote liveness probe cadence.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound for a single liveness probe. Kept well under the poll interval.
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Mailbox depth for the engine actor.
pub const ENGINE_MAILBOX_CAPACITY: usize = 256;

/// Realtime reconnect backoff bounds.
pub const REALTIME_BASE_BACKOFF_MS: u64 = 500;
pub const REALTIME_MAX_BACKOFF_MS: u64 = 30_000;

/// Backoff with jitter for reconnect loops: base * 2^attempt, capped, plus up to 20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let exp = attempt.min(8);
    let backoff = REALTIME_BASE_BACKOFF_MS
        .saturating_mul(1_u64 << exp)
        .min(REALTIME_MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
    Duration::from_millis(backoff.saturating_add(jitter))
}
