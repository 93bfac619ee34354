//! Engine-wide constants
//!
//! Defaults for relay budgets, pagination and cache lifetimes. Most of them
//! can be overridden through [`crate::config::EngineConfig`].

/// Relays queried when no configuration is supplied
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol", "wss://relay.primal.net"];

/// Time budget for a single relay in the per-relay fallback path
pub const RELAY_BUDGET_MS: u64 = 2_000;

/// Timeout for the unified multi-relay query
pub const UNIFIED_QUERY_TIMEOUT_MS: u64 = 4_000;

/// Time given to the relay pool to establish connections on startup
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Events requested per page of a reply query
pub const PAGE_SIZE: usize = 100;

/// Upper bound on events collected for one BFS level
pub const MAX_EVENTS_PER_LEVEL: usize = 200;

/// Maximum number of ids placed in a single `#e` filter.
/// Larger frontiers are split and queried concurrently.
pub const MAX_FILTER_REFS: usize = 100;

/// BFS depth used when the caller does not pick one
pub const DEFAULT_MAX_DEPTH: usize = 6;

/// Resolution worker round-trip limit
pub const WORKER_TIMEOUT_MS: u64 = 30_000;

/// Safety bound on ancestor hops during root discovery
pub const MAX_ROOT_WALK_DEPTH: usize = 32;

/// Memoized root lookups kept before the oldest are evicted
pub const ROOT_CACHE_CAPACITY: usize = 10_000;

/// Persisted trees older than this are discarded on load (6 hours, one session)
pub const TREE_MAX_AGE_SECS: u64 = 6 * 60 * 60;

/// Trees untouched in memory for this long are dropped by garbage collection
pub const TREE_IDLE_SECS: u64 = 30 * 60;

/// Key prefix for persisted trees in the key-value substrate
pub const TREE_KEY_PREFIX: &str = "thread-tree:";

// Nostr event kinds
pub mod kinds {
    /// Text note; the only kind that participates in threading
    pub const TEXT_NOTE: u16 = 1;
}
