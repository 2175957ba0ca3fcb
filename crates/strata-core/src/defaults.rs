//! Centralized default constants for the strata pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Every `from_env()` constructor falls back to these when a variable is
//! unset or unparsable.

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Maximum execution attempts per job (the first run counts as an attempt).
pub const JOB_RETRY_ATTEMPTS: i32 = 3;

/// Base delay before a retryable failure becomes eligible for re-claim.
pub const JOB_RETRY_BACKOFF_MS: u64 = 5_000;

/// Upper bound for exponential backoff.
pub const JOB_RETRY_BACKOFF_MAX_MS: u64 = 300_000;

/// Interval between scheduler sweeps of the durable queue, and the idle
/// wait of a dispatch loop with an empty ready queue.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Maximum number of due jobs loaded per type in one sweep.
pub const JOB_SWEEP_BATCH: i64 = 100;

/// A job that stays `processing` longer than this under one claim is
/// considered orphaned and is reclaimed.
pub const JOB_LIVENESS_SECS: u64 = 900;

/// Interval between stale-job reaper runs.
pub const JOB_REAP_INTERVAL_SECS: u64 = 60;

/// Handler execution timeout. Exceeding it is a retryable failure.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Pool size for text extraction (lightweight).
pub const JOB_CONCURRENCY_TEXT_EXTRACTION: usize = 4;

/// Pool size for thumbnail generation (CPU heavy).
pub const JOB_CONCURRENCY_THUMBNAIL_GENERATION: usize = 2;

/// Pool size for summary generation (external AI call, rate limited upstream).
pub const JOB_CONCURRENCY_SUMMARY_GENERATION: usize = 1;

// =============================================================================
// EVENTS
// =============================================================================

/// Buffer size of the in-process broadcast channel behind every event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Redis pub/sub channel carrying job lifecycle events.
pub const EVENT_BUS_CHANNEL: &str = "strata:job-events";

/// Delay before the Redis listener reconnects after a dropped connection.
pub const EVENT_BUS_RECONNECT_SECS: u64 = 5;

/// Bounded outbound queue per client connection in the notification gateway.
pub const GATEWAY_CONNECTION_QUEUE: usize = 64;

/// WebSocket keepalive ping interval.
pub const GATEWAY_PING_INTERVAL_SECS: u64 = 30;

// =============================================================================
// STORAGE
// =============================================================================

/// Default per-owner storage quota (1 GiB).
pub const STORAGE_QUOTA_BYTES: i64 = 1024 * 1024 * 1024;

/// Default lifetime of a signed content URL.
pub const SIGNED_URL_TTL_SECS: u64 = 3_600;

/// Extension used when the uploaded filename carries none.
pub const DEFAULT_BLOB_EXTENSION: &str = "bin";

// =============================================================================
// DERIVATION
// =============================================================================

/// Longest edge of generated thumbnails, in pixels.
pub const THUMBNAIL_MAX_EDGE: u32 = 256;

/// Maximum characters of extracted text sent to the summarizer.
pub const SUMMARY_INPUT_MAX_CHARS: usize = 12_000;

/// Timeout for external extraction commands (pdftotext, tesseract).
pub const EXTRACTION_CMD_TIMEOUT_SECS: u64 = 120;

// =============================================================================
// PROGRESS
// =============================================================================

/// Progress reported for a job that is processing without an explicit value.
pub const PROGRESS_PROCESSING: i32 = 50;

/// Progress reported for a completed job.
pub const PROGRESS_COMPLETE: i32 = 100;
