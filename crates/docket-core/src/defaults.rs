//! Centralized default constants for the docket pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Configuration structs fall back to these when the matching environment
//! variable is unset.

// =============================================================================
// WORKER
// =============================================================================

/// Maximum parse/run jobs executing concurrently per worker.
pub const MAX_CONCURRENT_JOBS: usize = 4;

/// Capacity of the worker's job channel.
pub const JOB_QUEUE_CAPACITY: usize = 1024;

// =============================================================================
// RETRY
// =============================================================================

/// Attempts per capability call (first call included).
pub const MAX_ATTEMPTS: u32 = 3;

/// Base backoff delay between attempts.
pub const RETRY_BASE_MS: u64 = 500;

/// Upper bound on a single backoff delay.
pub const RETRY_MAX_MS: u64 = 30_000;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Parser capability timeout.
pub const PARSE_TIMEOUT_SECS: u64 = 300;

/// Schema-execution capability timeout.
pub const RUN_TIMEOUT_SECS: u64 = 600;

/// Timeout for HTTP capability health checks.
pub const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// EVENTS
// =============================================================================

/// Broadcast buffer per notifier; slower subscribers observe `Lagged`.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Envelope payload version.
pub const EVENT_PAYLOAD_VERSION: u32 = 1;

/// SSE keep-alive interval.
pub const SSE_KEEPALIVE_SECS: u64 = 15;

/// WebSocket ping interval.
pub const WS_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum pooled connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Minimum idle pooled connections.
pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Seconds to wait for a pooled connection.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Seconds an idle pooled connection is kept.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Seconds before a pooled connection is recycled.
pub const DB_MAX_LIFETIME_SECS: u64 = 1800;

// =============================================================================
// SERVER
// =============================================================================

/// Bind host for the HTTP server.
pub const SERVER_HOST: &str = "0.0.0.0";

/// Bind port for the HTTP server.
pub const SERVER_PORT: u16 = 3000;

/// Requests allowed per bucket per rate-limit period.
pub const RATE_LIMIT_REQUESTS: u32 = 100;

/// Rate-limit period in seconds.
pub const RATE_LIMIT_PERIOD_SECS: u64 = 60;

/// Root directory the markdown parser resolves locators against.
pub const STORAGE_ROOT: &str = "./storage";

// =============================================================================
// REPRESENTATIONS & SCHEMAS
// =============================================================================

/// Representation schema version written by the built-in parsers.
pub const REPRESENTATION_SCHEMA_VERSION: &str = "1";

/// Maximum length of a schema ref slug.
pub const SCHEMA_REF_MAX_LEN: usize = 64;

/// Slug used when a schema carries neither `$id` nor `title`.
pub const SCHEMA_REF_FALLBACK: &str = "schema";
