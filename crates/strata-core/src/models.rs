//! Core data models for strata.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults::{PROGRESS_COMPLETE, PROGRESS_PROCESSING};
use crate::error::Error;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Type of derivation work. Determines the handler and the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Extract plain text from the stored blob
    TextExtraction,
    /// Render a bounded-size preview image
    ThumbnailGeneration,
    /// Produce an AI summary from extracted text
    SummaryGeneration,
}

impl JobType {
    /// Every job type, in pool start-up order.
    pub const ALL: [JobType; 3] = [
        JobType::TextExtraction,
        JobType::ThumbnailGeneration,
        JobType::SummaryGeneration,
    ];

    /// Default priority for this job type (higher = more urgent)
    pub fn default_priority(&self) -> i32 {
        match self {
            // Text unlocks search and the summary follow-up
            JobType::TextExtraction => 5,
            JobType::ThumbnailGeneration => 3,
            JobType::SummaryGeneration => 1,
        }
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TextExtraction => "text_extraction",
            JobType::ThumbnailGeneration => "thumbnail_generation",
            JobType::SummaryGeneration => "summary_generation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_extraction" => Ok(JobType::TextExtraction),
            "thumbnail_generation" => Ok(JobType::ThumbnailGeneration),
            "summary_generation" => Ok(JobType::SummaryGeneration),
            other => Err(Error::InvalidInput(format!("unknown job type: {other}"))),
        }
    }
}

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    /// `complete` and `failed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "complete" => Ok(JobStatus::Complete),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// Kind of entity a job derives data for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Document,
    Folder,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Document => "document",
            TargetType::Folder => "folder",
        }
    }
}

impl FromStr for TargetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(TargetType::Document),
            "folder" => Ok(TargetType::Folder),
            other => Err(Error::InvalidInput(format!("unknown target type: {other}"))),
        }
    }
}

/// A queued unit of derivation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    /// Retry ceiling captured from configuration when the job was inserted.
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub result: Option<JsonValue>,
    /// Last explicitly reported progress percentage.
    pub progress: Option<i32>,
    /// Upload batch correlation id, echoed on every event for this job.
    pub session_id: Option<String>,
    /// Earliest instant the job may be claimed (backoff).
    pub run_after: DateTime<Utc>,
    /// When the current claim was taken; anchors the liveness window.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Target id when the job derives data for a document.
    pub fn document_id(&self) -> Option<Uuid> {
        (self.target_type == TargetType::Document).then_some(self.target_id)
    }

    /// Target id when the job derives data for a folder.
    pub fn folder_id(&self) -> Option<Uuid> {
        (self.target_type == TargetType::Folder).then_some(self.target_id)
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether a claim attempted at `now` can succeed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now && self.has_attempts_remaining()
    }
}

/// Request to insert a new pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub priority: i32,
    pub max_attempts: i32,
    pub session_id: Option<String>,
}

impl NewJob {
    /// Job deriving data for a single document, at the type's default priority.
    pub fn for_document(job_type: JobType, document_id: Uuid, max_attempts: i32) -> Self {
        Self {
            job_type,
            target_type: TargetType::Document,
            target_id: document_id,
            priority: job_type.default_priority(),
            max_attempts,
            session_id: None,
        }
    }

    /// Job deriving data for a whole folder.
    pub fn for_folder(job_type: JobType, folder_id: Uuid, max_attempts: i32) -> Self {
        Self {
            job_type,
            target_type: TargetType::Folder,
            target_id: folder_id,
            priority: job_type.default_priority(),
            max_attempts,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Job read model served to polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: JobType,
    pub target_type: TargetType,
    pub target_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            target_type: job.target_type,
            target_id: job.target_id,
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            error_message: job.error_message.clone(),
            result: job.result.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// One row of a batch status read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
}

impl JobStatusSummary {
    /// Progress implied by a status when nothing was reported explicitly.
    pub fn synthesized_progress(status: JobStatus) -> i32 {
        match status {
            JobStatus::Complete => PROGRESS_COMPLETE,
            JobStatus::Processing => PROGRESS_PROCESSING,
            JobStatus::Pending | JobStatus::Failed => 0,
        }
    }
}

impl From<&Job> for JobStatusSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job
                .progress
                .unwrap_or_else(|| Self::synthesized_progress(job.status)),
        }
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

// =============================================================================
// DOCUMENTS
// =============================================================================

/// Per-type derived status mirrored onto the document row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedStatus {
    #[default]
    None,
    Pending,
    Complete,
    Failed,
}

impl DerivedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DerivedStatus::None => "none",
            DerivedStatus::Pending => "pending",
            DerivedStatus::Complete => "complete",
            DerivedStatus::Failed => "failed",
        }
    }
}

impl FromStr for DerivedStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DerivedStatus::None),
            "pending" => Ok(DerivedStatus::Pending),
            "complete" => Ok(DerivedStatus::Complete),
            "failed" => Ok(DerivedStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown derived status: {other}"))),
        }
    }
}

impl From<JobStatus> for DerivedStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending | JobStatus::Processing => DerivedStatus::Pending,
            JobStatus::Complete => DerivedStatus::Complete,
            JobStatus::Failed => DerivedStatus::Failed,
        }
    }
}

/// An uploaded artifact, unique per owner and content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub filename: String,
    pub mime_type: String,
    /// Hex SHA-256 of the full content.
    pub content_hash: String,
    pub storage_path: String,
    pub size_bytes: i64,
    pub text_status: DerivedStatus,
    pub thumbnail_status: DerivedStatus,
    pub summary_status: DerivedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    pub thumbnail_path: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Mirrored status of the latest job of the given type.
    pub fn derived_status(&self, job_type: JobType) -> DerivedStatus {
        match job_type {
            JobType::TextExtraction => self.text_status,
            JobType::ThumbnailGeneration => self.thumbnail_status,
            JobType::SummaryGeneration => self.summary_status,
        }
    }
}

/// Request to insert a new document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: Uuid,
    pub folder_id: Option<Uuid>,
    pub filename: String,
    pub mime_type: String,
    pub content_hash: String,
    pub storage_path: String,
    pub size_bytes: i64,
}

/// Identity and placement of an upload.
#[derive(Debug, Clone)]
pub struct OwnerContext {
    pub owner_id: Uuid,
    pub folder_id: Option<Uuid>,
    /// Client-chosen upload batch id.
    pub session_id: Option<String>,
}

impl OwnerContext {
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            owner_id,
            folder_id: None,
            session_id: None,
        }
    }

    pub fn with_folder(mut self, folder_id: Option<Uuid>) -> Self {
        self.folder_id = folder_id;
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document: Document,
    /// Jobs created for this upload. Empty on the dedup fast path.
    pub jobs: Vec<JobRecord>,
    pub deduplicated: bool,
}

// =============================================================================
// CONTENT STORE
// =============================================================================

/// A blob persisted by a content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlob {
    /// Store-relative path, `ab/cd/<hash>.<ext>`.
    pub path: String,
    pub size: i64,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub size: i64,
    pub modified_at: DateTime<Utc>,
}
