/// Application name
pub const APP_NAME: &str = "pairchat";

/// Wire protocol version, sent in the TCP hello
pub const PROTOCOL_VERSION: &str = "/pairchat/1.0.0";

/// Primary connection attempt timeout in milliseconds
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 5_000;

/// Matchmaker poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Dial jitter bounds in milliseconds (inclusive)
pub const DEFAULT_JITTER_MIN_MS: u64 = 50;
pub const DEFAULT_JITTER_MAX_MS: u64 = 250;

/// Period after which the failed-candidate cooldown set is cleared
pub const DEFAULT_COOLDOWN_CLEAR_MS: u64 = 10_000;

/// Offline relay poll interval in milliseconds
pub const DEFAULT_RELAY_POLL_MS: u64 = 15_000;

/// Vanish-mode message lifetime in milliseconds
pub const DEFAULT_VANISH_MS: u64 = 5_000;

/// Minimum spacing between friend lastSeen refreshes
pub const DEFAULT_LAST_SEEN_DEBOUNCE_MS: u64 = 60_000;

/// Maximum number of recent peers kept
pub const DEFAULT_RECENT_PEERS_LIMIT: usize = 50;

/// Maximum encoded frame size accepted by stream transports (16 MiB, media included)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
