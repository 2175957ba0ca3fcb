//! Job handler contract and the per-type handler set.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use strata_core::{ContentStore, DocumentRepository, Error, Job, JobType};

use crate::handlers::{Summarizer, SummaryHandler, TextExtractionHandler, ThumbnailHandler};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The claimed job.
    pub job: Job,
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress. Values are clamped to `0..=100`.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent.clamp(0, 100), message);
        }
    }

    /// Target document, if this job targets one.
    pub fn document_id(&self) -> Option<Uuid> {
        self.job.document_id()
    }

    /// Target folder, if this job targets one.
    pub fn folder_id(&self) -> Option<Uuid> {
        self.job.folder_id()
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Permanent failure; the job will not run again.
    Failed(String),
    /// Retryable failure; the job runs again after backoff while attempts remain.
    Retry(String),
}

impl JobResult {
    /// Classify a collaborator error by whether it can heal on its own.
    pub fn from_error(error: &Error) -> Self {
        if error.is_transient() {
            JobResult::Retry(error.to_string())
        } else {
            JobResult::Failed(error.to_string())
        }
    }
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler processes.
    fn job_type(&self) -> JobType;

    /// Execute the job. Must be idempotent: a job may run more than once.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Check if this handler can process the given job type.
    fn can_handle(&self, job_type: JobType) -> bool {
        self.job_type() == job_type
    }
}

/// Exactly one handler per job type.
#[derive(Clone)]
pub struct HandlerSet {
    text_extraction: Arc<dyn JobHandler>,
    thumbnail_generation: Arc<dyn JobHandler>,
    summary_generation: Arc<dyn JobHandler>,
}

impl HandlerSet {
    /// Build a set from explicit handlers.
    ///
    /// Returns `Error::Config` if a handler sits in the wrong slot.
    pub fn new(
        text_extraction: Arc<dyn JobHandler>,
        thumbnail_generation: Arc<dyn JobHandler>,
        summary_generation: Arc<dyn JobHandler>,
    ) -> strata_core::Result<Self> {
        let set = Self {
            text_extraction,
            thumbnail_generation,
            summary_generation,
        };
        for job_type in JobType::ALL {
            if !set.handler_for(job_type).can_handle(job_type) {
                return Err(Error::Config(format!(
                    "handler registered for {job_type} cannot handle it"
                )));
            }
        }
        Ok(set)
    }

    /// The production handlers.
    pub fn standard(
        documents: Arc<dyn DocumentRepository>,
        store: Arc<dyn ContentStore>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            text_extraction: Arc::new(TextExtractionHandler::new(
                documents.clone(),
                store.clone(),
            )),
            thumbnail_generation: Arc::new(ThumbnailHandler::new(documents.clone(), store)),
            summary_generation: Arc::new(SummaryHandler::new(documents, summarizer)),
        }
    }

    /// Replace the handler for the type it declares.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        match handler.job_type() {
            JobType::TextExtraction => self.text_extraction = handler,
            JobType::ThumbnailGeneration => self.thumbnail_generation = handler,
            JobType::SummaryGeneration => self.summary_generation = handler,
        }
        self
    }

    pub fn handler_for(&self, job_type: JobType) -> &Arc<dyn JobHandler> {
        match job_type {
            JobType::TextExtraction => &self.text_extraction,
            JobType::ThumbnailGeneration => &self.thumbnail_generation,
            JobType::SummaryGeneration => &self.summary_generation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::Utc;
    use strata_core::{JobStatus, TargetType};

    struct Fixed(JobType, JobResult);

    #[async_trait]
    impl JobHandler for Fixed {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn execute(&self, ctx: JobContext) -> JobResult {
            ctx.report_progress(150, Some("over"));
            self.1.clone()
        }
    }

    fn job(job_type: JobType) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            job_type,
            target_type: TargetType::Document,
            target_id: Uuid::now_v7(),
            status: JobStatus::Processing,
            priority: job_type.default_priority(),
            attempts: 1,
            max_attempts: 3,
            error_message: None,
            result: None,
            progress: None,
            session_id: None,
            run_after: now,
            claimed_at: Some(now),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    fn fixed(job_type: JobType) -> Arc<dyn JobHandler> {
        Arc::new(Fixed(job_type, JobResult::Success(None)))
    }

    #[tokio::test]
    async fn test_progress_is_clamped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = JobContext::new(job(JobType::TextExtraction))
            .with_progress_callback(move |p, _| sink.lock().unwrap().push(p));

        let handler = Fixed(JobType::TextExtraction, JobResult::Success(None));
        assert_eq!(handler.execute(ctx).await, JobResult::Success(None));
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_context_target_accessors() {
        let job = job(JobType::ThumbnailGeneration);
        let ctx = JobContext::new(job.clone());
        assert_eq!(ctx.document_id(), Some(job.target_id));
        assert_eq!(ctx.folder_id(), None);
    }

    #[test]
    fn test_from_error_classification() {
        assert!(matches!(
            JobResult::from_error(&Error::Storage("connection reset".into())),
            JobResult::Retry(_)
        ));
        assert!(matches!(
            JobResult::from_error(&Error::InvalidInput("bad image".into())),
            JobResult::Failed(_)
        ));
    }

    #[test]
    fn test_handler_set_rejects_misplaced_handler() {
        let result = HandlerSet::new(
            fixed(JobType::TextExtraction),
            fixed(JobType::SummaryGeneration),
            fixed(JobType::SummaryGeneration),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_with_handler_replaces_slot() {
        let set = HandlerSet::new(
            fixed(JobType::TextExtraction),
            fixed(JobType::ThumbnailGeneration),
            fixed(JobType::SummaryGeneration),
        )
        .unwrap();
        let replacement = fixed(JobType::ThumbnailGeneration);
        let set = set.with_handler(replacement.clone());
        assert!(Arc::ptr_eq(
            set.handler_for(JobType::ThumbnailGeneration),
            &replacement
        ));
        for job_type in JobType::ALL {
            assert!(set.handler_for(job_type).can_handle(job_type));
        }
    }
}
