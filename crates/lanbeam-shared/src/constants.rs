/// Application name
pub const APP_NAME: &str = "Lanbeam";

/// Protocol version reported by the registry `/info` endpoint
pub const PROTOCOL_VERSION: &str = "lanbeam/1";

/// Default TCP port of the presence registry
pub const DEFAULT_REGISTRY_PORT: u16 = 3000;

/// Path of the presence WebSocket on the registry
pub const REGISTRY_WS_PATH: &str = "/ws";

/// Maximum size of one data-channel chunk in bytes (16 KiB)
pub const CHUNK_SIZE: usize = 16_384;

/// Pause inserted after every chunk on the send path
pub const CHUNK_DELAY_MS: u64 = 5;

/// How long a scan waits before reporting that nothing was found
pub const SCAN_TIMEOUT_SECS: u64 = 5;

/// Deadline for a single registry connection attempt
pub const CONNECT_TIMEOUT_MS: u64 = 7_000;

/// Automatic reconnection attempts after an established link drops
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed backoff between reconnection attempts
pub const RECONNECT_DELAY_MS: u64 = 1_000;

/// Minimum window between two throughput samples
pub const PROGRESS_SAMPLE_MS: u64 = 1_000;

/// Delay before a completed progress record is dropped
pub const PROGRESS_CLEANUP_SECS: u64 = 5;

/// Maximum presence message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;
