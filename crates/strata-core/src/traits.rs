//! Core traits for strata abstractions.
//!
//! These traits define the interfaces for pluggable components:
//! - Job and document repositories (Postgres or in-memory)
//! - Content stores (local filesystem or remote object storage)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Durable job queue. The single source of truth for job state.
///
/// Every mutation after insert is a single-row conditional update, so
/// concurrent workers in any number of processes never double-claim and
/// terminal jobs are never touched again.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new `pending` job, eligible immediately.
    async fn insert(&self, job: NewJob) -> Result<Job>;

    /// Claim one job: `pending -> processing`.
    ///
    /// Succeeds only while the job is `pending`, due (`run_after <= now`) and
    /// under its attempt ceiling. Increments `attempts`, sets `claimed_at`,
    /// and sets `started_at` only if it was never set. Returns `None` when
    /// another claimant won or the job is not claimable.
    async fn claim(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Due `pending` jobs of one type in `(priority desc, created_at asc)` order.
    async fn list_due(&self, job_type: JobType, limit: i64) -> Result<Vec<Job>>;

    /// `processing -> complete`. Returns `None` if the job was no longer processing.
    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<Option<Job>>;

    /// `processing -> pending` with a backoff instant. Returns `None` if the
    /// job was no longer processing.
    async fn requeue(
        &self,
        job_id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// `processing -> failed`. Returns `None` if the job was no longer processing.
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Job>>;

    /// Record explicit progress for a processing job. Returns whether a row changed.
    async fn update_progress(&self, job_id: Uuid, percent: i32) -> Result<bool>;

    /// Reclaim jobs stuck in `processing` longer than `liveness`.
    ///
    /// Jobs with attempts remaining return to `pending`; exhausted ones
    /// become `failed`. Returns every reclaimed job in its new state.
    async fn reclaim_stale(&self, liveness: Duration) -> Result<Vec<Job>>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Jobs for the given ids; unknown ids are skipped.
    async fn get_many(&self, job_ids: &[Uuid]) -> Result<Vec<Job>>;

    /// All jobs targeting one entity, oldest first.
    async fn list_for_target(&self, target_id: Uuid) -> Result<Vec<Job>>;

    async fn queue_stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// DOCUMENT REPOSITORY
// =============================================================================

/// Documents and the per-owner storage usage counter.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Dedup lookup.
    async fn find_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<Document>>;

    /// Insert a document. Returns `None` when `(owner_id, content_hash)`
    /// already exists.
    async fn insert(&self, doc: NewDocument) -> Result<Option<Document>>;

    async fn get(&self, id: Uuid) -> Result<Option<Document>>;

    /// Returns whether a row was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn list_in_folder(&self, folder_id: Uuid) -> Result<Vec<Document>>;

    /// Mirror a job status onto the document's per-type status field.
    async fn set_derived_status(
        &self,
        id: Uuid,
        job_type: JobType,
        status: DerivedStatus,
    ) -> Result<()>;

    /// Overwrite the extracted text.
    async fn set_extracted_text(&self, id: Uuid, text: &str) -> Result<()>;

    /// Overwrite the thumbnail path.
    async fn set_thumbnail(&self, id: Uuid, path: &str) -> Result<()>;

    /// Overwrite the summary.
    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()>;

    /// Atomically add `bytes` to the owner's usage if the result stays
    /// within `quota`. Returns the new usage, or `None` if rejected.
    async fn try_charge_storage(&self, owner_id: Uuid, bytes: i64, quota: i64)
        -> Result<Option<i64>>;

    /// Unconditional atomic increment. Returns the new usage.
    async fn add_storage_used(&self, owner_id: Uuid, bytes: i64) -> Result<i64>;

    /// Compensating decrement after a charged upload failed. Never goes below zero.
    async fn release_storage(&self, owner_id: Uuid, bytes: i64) -> Result<()>;

    async fn storage_used(&self, owner_id: Uuid) -> Result<i64>;
}

// =============================================================================
// CONTENT STORE
// =============================================================================

/// Content-addressable blob storage.
///
/// Implementations are interchangeable; how URLs are produced (signed
/// query parameters, presigned object URLs) is theirs to decide.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store bytes under their hash-derived path. Writing identical content
    /// twice is a no-op.
    async fn put(&self, data: &[u8], ext: &str) -> Result<StoredBlob>;

    /// Read a blob. Missing blobs are `Error::NotFound`.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete a blob. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn metadata(&self, path: &str) -> Result<BlobMetadata>;

    /// Time-limited URL for fetching the blob.
    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
