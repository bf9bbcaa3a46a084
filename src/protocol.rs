//! Shared HTTP surface constants for the manifest server and client

// Routes
pub const MANIFEST_ROUTE: &str = "/";
pub const FILE_ROUTE_PREFIX: &str = "/file/";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTETS: &str = "application/octet-stream";

// Default transfer buffer (256KB): bounded memory per transfer regardless of file size
pub const DEFAULT_TRANSFER_BUFFER: usize = 256 * 1024;

// Default attempts per file before it is reported as permanently failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

// Centralized timeout constants shared by config defaults
pub mod timeouts {
    // Manifest fetch should be quick; the manifest is small
    pub const MANIFEST_SECS: u64 = 10;

    // Connection establishment timeout
    pub const CONNECT_SECS: u64 = 10;

    // Whole-transfer ceiling for a single file
    pub const TRANSFER_SECS: u64 = 600;

    // Progress tick interval for reporting (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;

    // Base delay between attempts on the same file (ms), multiplied by attempt count
    pub const RETRY_BACKOFF_MS: u64 = 250;
}
