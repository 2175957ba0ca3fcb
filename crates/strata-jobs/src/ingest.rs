//! Upload ingest: dedup, quota, blob write, document row, and job planning.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::{
    compute_content_hash, extension_for, storage_path_for, ContentStore, DerivedStatus, Document,
    DocumentRepository, Error, IngestOutcome, Job, JobRecord, JobRepository, JobType, NewDocument,
    NewJob, OwnerContext, Result,
};

use crate::config::IngestConfig;
use crate::scheduler::Scheduler;

/// Image types that cannot be rasterized into a thumbnail.
const NON_RASTER_IMAGES: [&str; 3] = ["image/svg+xml", "image/x-icon", "image/vnd.microsoft.icon"];

/// Job types to run for a freshly stored document, by mime type.
pub fn plan_jobs(mime_type: &str) -> Vec<JobType> {
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let thumbnail = mime == "application/pdf"
        || (mime.starts_with("image/") && !NON_RASTER_IMAGES.contains(&mime.as_str()));
    if thumbnail {
        vec![JobType::TextExtraction, JobType::ThumbnailGeneration]
    } else {
        vec![JobType::TextExtraction]
    }
}

/// Turns uploads into stored documents and queued derivation jobs.
pub struct IngestService {
    documents: Arc<dyn DocumentRepository>,
    jobs: Arc<dyn JobRepository>,
    store: Arc<dyn ContentStore>,
    scheduler: Arc<Scheduler>,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        jobs: Arc<dyn JobRepository>,
        store: Arc<dyn ContentStore>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            documents,
            jobs,
            store,
            scheduler,
            config: IngestConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IngestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Store an upload and queue its derivation jobs.
    ///
    /// Identical content from the same owner resolves to the existing
    /// document with no new jobs, no write, and no quota charge.
    ///
    /// # Errors
    /// - `InvalidInput` for empty content
    /// - `QuotaExceeded` when quota is enabled and the upload does not fit
    /// - storage or database errors; the document row, a blob this upload
    ///   created, and any quota charge are removed before returning
    pub async fn ingest(
        &self,
        owner: &OwnerContext,
        data: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<IngestOutcome> {
        if data.is_empty() {
            return Err(Error::InvalidInput("uploaded file is empty".to_string()));
        }

        let hash = compute_content_hash(data);
        if let Some(existing) = self.documents.find_by_hash(owner.owner_id, &hash).await? {
            debug!(owner_id = %owner.owner_id, document_id = %existing.id, "Duplicate upload");
            return Ok(deduplicated(existing));
        }

        let size = data.len() as i64;
        let charged = self.charge_quota(owner.owner_id, size).await?;

        // A blob that already exists may back another owner's document
        let ext = extension_for(filename, mime_type);
        let blob_is_new = !self
            .store
            .exists(&storage_path_for(&hash, &ext))
            .await
            .unwrap_or(true);

        let stored = self
            .store_document(owner, data, filename, mime_type, &hash, &ext, blob_is_new)
            .await;
        let document = match stored {
            Ok(Some(document)) => document,
            Ok(None) => {
                // A concurrent identical upload won the insert
                self.release_charge(owner.owner_id, charged).await;
                let existing = self
                    .documents
                    .find_by_hash(owner.owner_id, &hash)
                    .await?
                    .ok_or_else(|| Error::Internal(format!("document for {hash} vanished")))?;
                return Ok(deduplicated(existing));
            }
            Err(e) => {
                self.release_charge(owner.owner_id, charged).await;
                return Err(e);
            }
        };

        let jobs = match self
            .queue_jobs(&document, &plan_jobs(mime_type), owner.session_id.clone())
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                // Without its jobs the document would dedup every retry into a dead end
                warn!(error = %e, document_id = %document.id, "Failed to queue jobs, rolling back upload");
                self.roll_back(&document, blob_is_new, charged).await;
                return Err(e);
            }
        };

        if charged.is_none() {
            if let Err(e) = self.documents.add_storage_used(owner.owner_id, size).await {
                warn!(error = %e, owner_id = %owner.owner_id, "Failed to record storage usage");
            }
        }

        info!(
            owner_id = %owner.owner_id,
            document_id = %document.id,
            size,
            jobs = jobs.len(),
            "Document ingested"
        );

        let document = self.documents.get(document.id).await?.unwrap_or(document);
        Ok(IngestOutcome {
            document,
            jobs: jobs.iter().map(JobRecord::from).collect(),
            deduplicated: false,
        })
    }

    /// Queue a summary of every document in a folder.
    pub async fn request_folder_summary(
        &self,
        folder_id: Uuid,
        session_id: Option<String>,
    ) -> Result<JobRecord> {
        if !self.config.summary_enabled {
            return Err(Error::InvalidInput("summaries are disabled".to_string()));
        }
        if self.documents.list_in_folder(folder_id).await?.is_empty() {
            return Err(Error::NotFound(format!("folder {folder_id} has no documents")));
        }

        let job = self
            .jobs
            .insert(
                NewJob::for_folder(JobType::SummaryGeneration, folder_id, self.config.max_attempts)
                    .with_session(session_id),
            )
            .await?;
        self.offer(&job).await;
        info!(%folder_id, job_id = %job.id, "Folder summary requested");
        Ok(JobRecord::from(&job))
    }

    /// Reserve quota before any write. Returns the charged bytes, if charged.
    async fn charge_quota(&self, owner_id: Uuid, size: i64) -> Result<Option<i64>> {
        if !self.config.quota_enabled {
            return Ok(None);
        }
        match self
            .documents
            .try_charge_storage(owner_id, size, self.config.quota_bytes)
            .await?
        {
            Some(_) => Ok(Some(size)),
            None => {
                let used = self.documents.storage_used(owner_id).await?;
                warn!(%owner_id, used, requested = size, quota = self.config.quota_bytes, "Storage quota exceeded");
                Err(Error::QuotaExceeded {
                    owner_id,
                    used,
                    requested: size,
                    quota: self.config.quota_bytes,
                })
            }
        }
    }

    async fn release_charge(&self, owner_id: Uuid, charged: Option<i64>) {
        let Some(bytes) = charged else {
            return;
        };
        if let Err(e) = self.documents.release_storage(owner_id, bytes).await {
            warn!(error = %e, %owner_id, bytes, "Failed to release storage charge");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_document(
        &self,
        owner: &OwnerContext,
        data: &[u8],
        filename: &str,
        mime_type: &str,
        hash: &str,
        ext: &str,
        blob_is_new: bool,
    ) -> Result<Option<Document>> {
        let blob = self.store.put(data, ext).await?;
        debug!(path = %blob.path, backend = self.store.backend_name(), "Blob stored");
        let path = blob.path.clone();
        let inserted = self
            .documents
            .insert(NewDocument {
                owner_id: owner.owner_id,
                folder_id: owner.folder_id,
                filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                content_hash: hash.to_string(),
                storage_path: blob.path,
                size_bytes: blob.size,
            })
            .await;
        if inserted.is_err() && blob_is_new {
            if let Err(e) = self.store.delete(&path).await {
                warn!(error = %e, path = %path, "Failed to delete orphaned blob");
            }
        }
        inserted
    }

    /// Undo a stored document whose jobs could not be queued.
    ///
    /// Job rows inserted before the failure stay; they fail as target missing.
    async fn roll_back(&self, document: &Document, blob_is_new: bool, charged: Option<i64>) {
        if let Err(e) = self.documents.delete(document.id).await {
            warn!(error = %e, document_id = %document.id, "Failed to delete document during rollback");
        }
        if blob_is_new {
            if let Err(e) = self.store.delete(&document.storage_path).await {
                warn!(error = %e, path = %document.storage_path, "Failed to delete blob during rollback");
            }
        }
        self.release_charge(document.owner_id, charged).await;
    }

    async fn queue_jobs(
        &self,
        document: &Document,
        plan: &[JobType],
        session_id: Option<String>,
    ) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(plan.len());
        for &job_type in plan {
            let job = self
                .jobs
                .insert(
                    NewJob::for_document(job_type, document.id, self.config.max_attempts)
                        .with_session(session_id.clone()),
                )
                .await?;
            // Marked before the job can run, so the worker's terminal mirror always lands last
            self.documents
                .set_derived_status(document.id, job_type, DerivedStatus::Pending)
                .await?;
            jobs.push(job);
        }
        for job in &jobs {
            self.offer(job).await;
        }
        Ok(jobs)
    }

    /// Hand a job to the scheduler; the sweep picks it up if this fails.
    async fn offer(&self, job: &Job) {
        if let Err(e) = self.scheduler.enqueue(job).await {
            warn!(error = %e, job_id = %job.id, "Failed to enqueue job, sweep will retry");
        }
    }
}

fn deduplicated(document: Document) -> IngestOutcome {
    IngestOutcome {
        document,
        jobs: Vec::new(),
        deduplicated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_for_plain_text() {
        assert_eq!(plan_jobs("text/plain"), vec![JobType::TextExtraction]);
        assert_eq!(plan_jobs("application/zip"), vec![JobType::TextExtraction]);
    }

    #[test]
    fn test_plan_for_raster_images_and_pdf() {
        let both = vec![JobType::TextExtraction, JobType::ThumbnailGeneration];
        assert_eq!(plan_jobs("image/png"), both);
        assert_eq!(plan_jobs("IMAGE/JPEG"), both);
        assert_eq!(plan_jobs("application/pdf"), both);
    }

    #[test]
    fn test_plan_for_non_raster_images() {
        assert_eq!(plan_jobs("image/svg+xml"), vec![JobType::TextExtraction]);
        assert_eq!(plan_jobs("image/x-icon"), vec![JobType::TextExtraction]);
    }
}
