/// Application name
pub const APP_NAME: &str = "Rencontre";

/// Maximum chat message length in characters
pub const MAX_MESSAGE_CHARS: usize = 5_000;

/// Default capacity of the ingestion queue (messages held before the
/// oldest unwritten one is dropped)
pub const DEFAULT_QUEUE_CAPACITY: usize = 2_000;

/// Default grace period the pipeline waits for its queue to drain on
/// shutdown, in seconds
pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 5;

/// Maximum entries kept in a per-chat history cache list
pub const HISTORY_CACHE_CAP: usize = 200;

/// Sliding expiration of a per-chat history cache list, in seconds (24 h)
pub const HISTORY_TTL_SECS: u64 = 86_400;

/// Default page size for history replay on join
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;

/// How long a backplane reachability verdict is trusted before the next
/// live probe, in seconds
pub const BACKPLANE_PROBE_TTL_SECS: u64 = 30;

/// Default HTTP/WebSocket listen port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
