//! Worker and ingest configuration.

use std::str::FromStr;
use std::time::Duration;

use strata_core::{defaults, JobType};

use crate::retry::RetryPolicy;

/// Parse an environment variable, falling back to `default` when unset or invalid.
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Boolean flag where anything but `false`/`0` counts as enabled.
pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v != "false" && v != "0"
        })
        .unwrap_or(default)
}

/// Configuration for the job worker pools.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to run worker pools in this process.
    pub enabled: bool,
    /// Pool size for text extraction.
    pub text_extraction_concurrency: usize,
    /// Pool size for thumbnail generation.
    pub thumbnail_generation_concurrency: usize,
    /// Pool size for summary generation.
    pub summary_generation_concurrency: usize,
    /// Idle wait and sweep period in milliseconds.
    pub poll_interval_ms: u64,
    /// Handler timeout in seconds.
    pub job_timeout_secs: u64,
    /// How long a job may stay processing under one claim.
    pub liveness_secs: u64,
    /// Reaper period in seconds.
    pub reap_interval_secs: u64,
    pub retry: RetryPolicy,
    /// Enqueue a summary after text extraction produces text.
    pub summary_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            text_extraction_concurrency: defaults::JOB_CONCURRENCY_TEXT_EXTRACTION,
            thumbnail_generation_concurrency: defaults::JOB_CONCURRENCY_THUMBNAIL_GENERATION,
            summary_generation_concurrency: defaults::JOB_CONCURRENCY_SUMMARY_GENERATION,
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            liveness_secs: defaults::JOB_LIVENESS_SECS,
            reap_interval_secs: defaults::JOB_REAP_INTERVAL_SECS,
            retry: RetryPolicy::default(),
            summary_enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_CONCURRENCY_TEXT_EXTRACTION` | `4` | Text extraction pool size |
    /// | `JOB_CONCURRENCY_THUMBNAIL_GENERATION` | `2` | Thumbnail pool size |
    /// | `JOB_CONCURRENCY_SUMMARY_GENERATION` | `1` | Summary pool size |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Idle wait and sweep period |
    /// | `JOB_TIMEOUT_SECS` | `300` | Handler timeout |
    /// | `JOB_LIVENESS_SECS` | `900` | Stale-processing threshold |
    /// | `JOB_REAP_INTERVAL_SECS` | `60` | Reaper period |
    /// | `SUMMARY_ENABLED` | `true` | Follow-up summary jobs |
    ///
    /// Retry settings are read by [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("JOB_WORKER_ENABLED", true),
            text_extraction_concurrency: env_parse(
                "JOB_CONCURRENCY_TEXT_EXTRACTION",
                defaults::JOB_CONCURRENCY_TEXT_EXTRACTION,
            )
            .max(1),
            thumbnail_generation_concurrency: env_parse(
                "JOB_CONCURRENCY_THUMBNAIL_GENERATION",
                defaults::JOB_CONCURRENCY_THUMBNAIL_GENERATION,
            )
            .max(1),
            summary_generation_concurrency: env_parse(
                "JOB_CONCURRENCY_SUMMARY_GENERATION",
                defaults::JOB_CONCURRENCY_SUMMARY_GENERATION,
            )
            .max(1),
            poll_interval_ms: env_parse("JOB_POLL_INTERVAL_MS", defaults::JOB_POLL_INTERVAL_MS)
                .max(1),
            job_timeout_secs: env_parse("JOB_TIMEOUT_SECS", defaults::JOB_TIMEOUT_SECS).max(1),
            liveness_secs: env_parse("JOB_LIVENESS_SECS", defaults::JOB_LIVENESS_SECS).max(1),
            reap_interval_secs: env_parse(
                "JOB_REAP_INTERVAL_SECS",
                defaults::JOB_REAP_INTERVAL_SECS,
            )
            .max(1),
            retry: RetryPolicy::from_env(),
            summary_enabled: env_flag("SUMMARY_ENABLED", true),
        }
    }

    /// Pool size for one job type.
    pub fn concurrency_for(&self, job_type: JobType) -> usize {
        match job_type {
            JobType::TextExtraction => self.text_extraction_concurrency,
            JobType::ThumbnailGeneration => self.thumbnail_generation_concurrency,
            JobType::SummaryGeneration => self.summary_generation_concurrency,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    /// Set the pool size for one job type.
    pub fn with_concurrency(mut self, job_type: JobType, permits: usize) -> Self {
        let permits = permits.max(1);
        match job_type {
            JobType::TextExtraction => self.text_extraction_concurrency = permits,
            JobType::ThumbnailGeneration => self.thumbnail_generation_concurrency = permits,
            JobType::SummaryGeneration => self.summary_generation_concurrency = permits,
        }
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    pub fn with_liveness(mut self, secs: u64) -> Self {
        self.liveness_secs = secs;
        self
    }

    pub fn with_reap_interval(mut self, secs: u64) -> Self {
        self.reap_interval_secs = secs.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_summary_enabled(mut self, enabled: bool) -> Self {
        self.summary_enabled = enabled;
        self
    }
}

/// Configuration for the ingest service.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Reject uploads that would exceed the owner's quota.
    pub quota_enabled: bool,
    /// Per-owner quota in bytes.
    pub quota_bytes: i64,
    /// Attempt ceiling stamped on every job created by ingest.
    pub max_attempts: i32,
    /// Allow folder summary requests.
    pub summary_enabled: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            quota_enabled: false,
            quota_bytes: defaults::STORAGE_QUOTA_BYTES,
            max_attempts: defaults::JOB_RETRY_ATTEMPTS,
            summary_enabled: true,
        }
    }
}

impl IngestConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `STORAGE_QUOTA_ENABLED` | `false` | Quota enforcement |
    /// | `STORAGE_QUOTA_BYTES` | `1073741824` | Per-owner quota |
    /// | `JOB_RETRY_ATTEMPTS` | `3` | Max attempts per job |
    /// | `SUMMARY_ENABLED` | `true` | Folder summary requests |
    pub fn from_env() -> Self {
        Self {
            quota_enabled: env_flag("STORAGE_QUOTA_ENABLED", false),
            quota_bytes: env_parse("STORAGE_QUOTA_BYTES", defaults::STORAGE_QUOTA_BYTES).max(0),
            max_attempts: env_parse("JOB_RETRY_ATTEMPTS", defaults::JOB_RETRY_ATTEMPTS).max(1),
            summary_enabled: env_flag("SUMMARY_ENABLED", true),
        }
    }

    pub fn with_quota(mut self, quota_bytes: i64) -> Self {
        self.quota_enabled = true;
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_summary_enabled(mut self, enabled: bool) -> Self {
        self.summary_enabled = enabled;
        self
    }
}
