//! System-wide default constants.
//!
//! Centralises the timing and retry numbers the uplink relies on.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Dispatcher
// ============================================================================

/// Sleep between queue polls when there is nothing to deliver (seconds).
pub const IDLE_SLEEP_SECS: u64 = 30;

/// Sleep between retries while no transport is usable (seconds).
pub const OUTAGE_SLEEP_SECS: u64 = 300;

/// Continuous outage after which a forced reboot is requested (seconds).
///
/// 259 200 = 3 days.
pub const OUTAGE_REBOOT_AFTER_SECS: u64 = 259_200;

// ============================================================================
// Remote Session
// ============================================================================

/// Connection attempts before a session is reported unavailable.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Per-attempt connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Pause between failed connect attempts (seconds).
pub const CONNECT_RETRY_DELAY_SECS: u64 = 5;

/// Timeout for a single remote command or SFTP put (seconds).
pub const TRANSFER_TIMEOUT_SECS: u64 = 120;

/// I/O stall timeout handed to the directory sync utility (seconds).
pub const SYNC_IO_TIMEOUT_SECS: u64 = 5;

/// Hard ceiling on one bulk sync run (seconds). 1 800 = 30 min.
pub const SYNC_DEADLINE_SECS: u64 = 1_800;

/// Non-default SSH port of the archive server.
pub const SERVER_PORT: u16 = 2222;

// ============================================================================
// Connectivity
// ============================================================================

/// Echo requests sent per reachability target.
pub const PING_COUNT: u32 = 2;

/// Per-target ping deadline (seconds).
pub const PING_TIMEOUT_SECS: u64 = 5;

/// Public host used to decide whether the internet is reachable.
pub const PUBLIC_REACHABILITY_TARGET: &str = "8.8.8.8";

// ============================================================================
// Diagnostics
// ============================================================================

/// Maximum wait for the diagnostic log lock before falling back to console (seconds).
pub const LOG_LOCK_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Codec
// ============================================================================

/// zstd level for low-res payloads. Cellular bytes are expensive, CPU is not.
pub const ZSTD_LEVEL: i32 = 19;
