use std::time::Duration;

/// Size of one content chunk. Files are stored and transferred in units of
/// this many bytes; the last chunk of a file may be shorter.
pub const CHUNK_SIZE: u32 = 1024 * 1024;

/// UDP port the tracker listens on unless overridden.
pub const DEFAULT_TRACKER_PORT: u16 = 6881;

/// Largest payload that fits in one UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// A peer silent for longer than this is evicted from the directory.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(120);

/// Cadence of the tracker's eviction sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// How often a peer re-announces its full inventory.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// How often a peer sends a liveness heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for one tracker request/response exchange.
pub const TRACKER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per tracker exchange, with linear backoff in between.
pub const TRACKER_MAX_ATTEMPTS: u32 = 3;

/// Attempts per chunk per candidate peer, with linear backoff in between.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TCP_CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const TCP_SERVER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard deadline on a single download task's fetch pool.
pub const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(300);

/// Simultaneous download tasks per node.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Concurrent chunk fetchers within one download task.
pub const FETCHERS_PER_DOWNLOAD: usize = 3;

/// Wait after a filesystem write event before ingesting the file.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);
