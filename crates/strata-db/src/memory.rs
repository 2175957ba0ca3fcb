//! In-memory repositories.
//!
//! Same contracts as the Postgres repositories, backed by a mutex-guarded
//! map. Used by unit and integration tests across the workspace and by
//! single-process deployments that do not need durability.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use strata_core::{
    new_v7, DerivedStatus, Document, DocumentRepository, Error, Job, JobRepository, JobStatus,
    JobType, NewDocument, NewJob, QueueStats, Result,
};

use crate::jobs::WORKER_LOST_MESSAGE;

/// In-memory [`JobRepository`].
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move a job's claim anchor, e.g. to simulate a worker that died long ago.
    pub async fn set_claimed_at(&self, job_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        job.claimed_at = Some(at);
        Ok(())
    }

    /// Apply `update` only when the job is currently `processing`.
    async fn update_processing<F>(&self, job_id: Uuid, update: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job) + Send,
    {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                update(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }
}

fn sorted_by_queue_order(mut jobs: Vec<Job>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    jobs
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: new_v7(),
            job_type: new.job_type,
            target_type: new.target_type,
            target_id: new.target_id,
            status: JobStatus::Pending,
            priority: new.priority,
            attempts: 0,
            max_attempts: new.max_attempts,
            error_message: None,
            result: None,
            progress: None,
            session_id: new.session_id,
            run_after: now,
            claimed_at: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_claimable(now) => {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.claimed_at = Some(now);
                job.started_at.get_or_insert(now);
                job.progress = None;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_due(&self, job_type: JobType, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let due: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.job_type == job_type && job.is_claimable(now))
            .cloned()
            .collect();
        let mut due = sorted_by_queue_order(due);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<Option<Job>> {
        self.update_processing(job_id, |job| {
            job.status = JobStatus::Complete;
            job.result = result;
            job.progress = Some(strata_core::defaults::PROGRESS_COMPLETE);
            job.error_message = None;
            job.completed_at = Some(Utc::now());
            job.claimed_at = None;
        })
        .await
    }

    async fn requeue(
        &self,
        job_id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let error = error.to_string();
        self.update_processing(job_id, |job| {
            job.status = JobStatus::Pending;
            job.error_message = Some(error);
            job.run_after = run_after;
            job.claimed_at = None;
            job.progress = None;
        })
        .await
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Job>> {
        let error = error.to_string();
        self.update_processing(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error);
            job.completed_at = Some(Utc::now());
            job.claimed_at = None;
        })
        .await
    }

    async fn update_progress(&self, job_id: Uuid, percent: i32) -> Result<bool> {
        let updated = self
            .update_processing(job_id, |job| job.progress = Some(percent.clamp(0, 100)))
            .await?;
        Ok(updated.is_some())
    }

    async fn reclaim_stale(&self, liveness: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let liveness = chrono::Duration::from_std(liveness)
            .map_err(|e| Error::Config(format!("liveness window out of range: {e}")))?;
        let cutoff = now - liveness;

        let mut reclaimed = Vec::new();
        let mut jobs = self.jobs.lock().await;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.claimed_at.is_some_and(|claimed| claimed < cutoff);
            if !stale {
                continue;
            }
            if job.has_attempts_remaining() {
                job.status = JobStatus::Pending;
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
            job.error_message = Some(WORKER_LOST_MESSAGE.to_string());
            job.run_after = now;
            job.claimed_at = None;
            job.progress = None;
            reclaimed.push(job.clone());
        }
        Ok(reclaimed)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().await.get(&job_id).cloned())
    }

    async fn get_many(&self, job_ids: &[Uuid]) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(job_ids.iter().filter_map(|id| jobs.get(id).cloned()).collect())
    }

    async fn list_for_target(&self, target_id: Uuid) -> Result<Vec<Job>> {
        let mut found: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.target_id == target_id)
            .cloned()
            .collect();
        found.sort_by_key(|job| (job.created_at, job.id));
        Ok(found)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats {
            total: jobs.len() as i64,
            ..QueueStats::default()
        };
        for job in jobs.values() {
            let recent = job.completed_at.is_some_and(|at| at > hour_ago);
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Complete if recent => stats.completed_last_hour += 1,
                JobStatus::Failed if recent => stats.failed_last_hour += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

/// In-memory [`DocumentRepository`] with storage usage counters.
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: Mutex<HashMap<Uuid, Document>>,
    usage: Mutex<HashMap<Uuid, i64>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.documents.lock().await.len()
    }

    async fn update<F>(&self, id: Uuid, update: F) -> Result<()>
    where
        F: FnOnce(&mut Document) + Send,
    {
        let mut documents = self.documents.lock().await;
        let doc = documents.get_mut(&id).ok_or(Error::DocumentNotFound(id))?;
        update(doc);
        doc.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn find_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<Document>> {
        Ok(self
            .documents
            .lock()
            .await
            .values()
            .find(|doc| doc.owner_id == owner_id && doc.content_hash == content_hash)
            .cloned())
    }

    async fn insert(&self, new: NewDocument) -> Result<Option<Document>> {
        let mut documents = self.documents.lock().await;
        let duplicate = documents
            .values()
            .any(|doc| doc.owner_id == new.owner_id && doc.content_hash == new.content_hash);
        if duplicate {
            return Ok(None);
        }

        let now = Utc::now();
        let doc = Document {
            id: new_v7(),
            owner_id: new.owner_id,
            folder_id: new.folder_id,
            filename: new.filename,
            mime_type: new.mime_type,
            content_hash: new.content_hash,
            storage_path: new.storage_path,
            size_bytes: new.size_bytes,
            text_status: DerivedStatus::None,
            thumbnail_status: DerivedStatus::None,
            summary_status: DerivedStatus::None,
            extracted_text: None,
            thumbnail_path: None,
            summary: None,
            created_at: now,
            updated_at: now,
        };
        documents.insert(doc.id, doc.clone());
        Ok(Some(doc))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.lock().await.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.documents.lock().await.remove(&id).is_some())
    }

    async fn list_in_folder(&self, folder_id: Uuid) -> Result<Vec<Document>> {
        let mut found: Vec<Document> = self
            .documents
            .lock()
            .await
            .values()
            .filter(|doc| doc.folder_id == Some(folder_id))
            .cloned()
            .collect();
        found.sort_by_key(|doc| (doc.created_at, doc.id));
        Ok(found)
    }

    async fn set_derived_status(
        &self,
        id: Uuid,
        job_type: JobType,
        status: DerivedStatus,
    ) -> Result<()> {
        self.update(id, |doc| match job_type {
            JobType::TextExtraction => doc.text_status = status,
            JobType::ThumbnailGeneration => doc.thumbnail_status = status,
            JobType::SummaryGeneration => doc.summary_status = status,
        })
        .await
    }

    async fn set_extracted_text(&self, id: Uuid, text: &str) -> Result<()> {
        let text = text.to_string();
        self.update(id, |doc| doc.extracted_text = Some(text)).await
    }

    async fn set_thumbnail(&self, id: Uuid, path: &str) -> Result<()> {
        let path = path.to_string();
        self.update(id, |doc| doc.thumbnail_path = Some(path)).await
    }

    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()> {
        let summary = summary.to_string();
        self.update(id, |doc| doc.summary = Some(summary)).await
    }

    async fn try_charge_storage(
        &self,
        owner_id: Uuid,
        bytes: i64,
        quota: i64,
    ) -> Result<Option<i64>> {
        let mut usage = self.usage.lock().await;
        let used = usage.entry(owner_id).or_insert(0);
        if *used + bytes > quota {
            return Ok(None);
        }
        *used += bytes;
        Ok(Some(*used))
    }

    async fn add_storage_used(&self, owner_id: Uuid, bytes: i64) -> Result<i64> {
        let mut usage = self.usage.lock().await;
        let used = usage.entry(owner_id).or_insert(0);
        *used += bytes;
        Ok(*used)
    }

    async fn release_storage(&self, owner_id: Uuid, bytes: i64) -> Result<()> {
        let mut usage = self.usage.lock().await;
        if let Some(used) = usage.get_mut(&owner_id) {
            *used = (*used - bytes).max(0);
        }
        Ok(())
    }

    async fn storage_used(&self, owner_id: Uuid) -> Result<i64> {
        Ok(self.usage.lock().await.get(&owner_id).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use strata_core::TargetType;

    fn new_job(job_type: JobType, priority: i32) -> NewJob {
        NewJob::for_document(job_type, Uuid::now_v7(), 3).with_priority(priority)
    }

    fn new_document(owner_id: Uuid, hash: &str) -> NewDocument {
        NewDocument {
            owner_id,
            folder_id: None,
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            content_hash: hash.to_string(),
            storage_path: format!("ab/cd/{hash}.pdf"),
            size_bytes: 10,
        }
    }

    #[tokio::test]
    async fn test_insert_starts_pending() {
        let repo = InMemoryJobRepository::new();
        let job = repo
            .insert(new_job(JobType::TextExtraction, 5).with_session(Some("s1".into())))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.target_type, TargetType::Document);
        assert_eq!(job.session_id.as_deref(), Some("s1"));
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_claim_sets_started_once() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();

        let claimed = repo.claim(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        let first_start = claimed.started_at.unwrap();

        repo.requeue(job.id, "transient", Utc::now()).await.unwrap().unwrap();
        let reclaimed = repo.claim(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.started_at, Some(first_start));
    }

    #[tokio::test]
    async fn test_claim_respects_run_after() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();
        repo.claim(job.id).await.unwrap().unwrap();
        repo.requeue(job.id, "later", Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert!(repo.claim(job.id).await.unwrap().is_none());
        assert!(repo.list_due(JobType::TextExtraction, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let repo = Arc::new(InMemoryJobRepository::new());
        let job = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();

        let id = job.id;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move { repo.claim(id).await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.get(job.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_terminal_updates_are_conditional() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();

        // Not processing yet
        assert!(repo.complete(job.id, None).await.unwrap().is_none());

        repo.claim(job.id).await.unwrap().unwrap();
        let done = repo.complete(job.id, None).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.progress, Some(100));

        assert!(repo.fail(job.id, "late").await.unwrap().is_none());
        assert!(repo.requeue(job.id, "late", Utc::now()).await.unwrap().is_none());
        assert!(!repo.update_progress(job.id, 10).await.unwrap());
        assert_eq!(repo.get(job.id).await.unwrap().unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_list_due_orders_priority_then_fifo() {
        let repo = InMemoryJobRepository::new();
        let low = repo.insert(new_job(JobType::TextExtraction, 1)).await.unwrap();
        let high_first = repo.insert(new_job(JobType::TextExtraction, 9)).await.unwrap();
        let high_second = repo.insert(new_job(JobType::TextExtraction, 9)).await.unwrap();
        repo.insert(new_job(JobType::ThumbnailGeneration, 10)).await.unwrap();

        let due = repo.list_due(JobType::TextExtraction, 10).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_first.id, high_second.id, low.id]);
    }

    #[tokio::test]
    async fn test_reclaim_stale_requeues_or_fails() {
        let repo = InMemoryJobRepository::new();
        let retryable = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();
        let exhausted = repo
            .insert(NewJob::for_document(JobType::TextExtraction, Uuid::now_v7(), 1))
            .await
            .unwrap();
        let fresh = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();

        for id in [retryable.id, exhausted.id, fresh.id] {
            repo.claim(id).await.unwrap().unwrap();
        }
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        repo.set_claimed_at(retryable.id, long_ago).await.unwrap();
        repo.set_claimed_at(exhausted.id, long_ago).await.unwrap();

        let reclaimed = repo.reclaim_stale(Duration::from_secs(900)).await.unwrap();
        assert_eq!(reclaimed.len(), 2);

        let retryable = repo.get(retryable.id).await.unwrap().unwrap();
        assert_eq!(retryable.status, JobStatus::Pending);
        assert_eq!(retryable.attempts, 1);

        let exhausted = repo.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.status, JobStatus::Failed);
        assert_eq!(exhausted.error_message.as_deref(), Some(WORKER_LOST_MESSAGE));
        assert!(exhausted.completed_at.is_some());

        assert_eq!(repo.get(fresh.id).await.unwrap().unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_get_many_skips_unknown() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(new_job(JobType::TextExtraction, 5)).await.unwrap();
        let found = repo.get_many(&[job.id, Uuid::now_v7()]).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_document_unique_per_owner_hash() {
        let repo = InMemoryDocumentRepository::new();
        let owner = Uuid::now_v7();

        assert!(repo.insert(new_document(owner, "abcd")).await.unwrap().is_some());
        assert!(repo.insert(new_document(owner, "abcd")).await.unwrap().is_none());
        // Another owner may store the same bytes
        assert!(repo.insert(new_document(Uuid::now_v7(), "abcd")).await.unwrap().is_some());
        assert_eq!(repo.count().await, 2);
    }

    #[tokio::test]
    async fn test_derived_status_missing_document() {
        let repo = InMemoryDocumentRepository::new();
        let err = repo
            .set_derived_status(Uuid::nil(), JobType::TextExtraction, DerivedStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_storage_charge_and_release() {
        let repo = InMemoryDocumentRepository::new();
        let owner = Uuid::now_v7();

        assert_eq!(repo.try_charge_storage(owner, 60, 100).await.unwrap(), Some(60));
        assert_eq!(repo.try_charge_storage(owner, 50, 100).await.unwrap(), None);
        assert_eq!(repo.storage_used(owner).await.unwrap(), 60);

        repo.release_storage(owner, 60).await.unwrap();
        assert_eq!(repo.storage_used(owner).await.unwrap(), 0);
        repo.release_storage(owner, 10).await.unwrap();
        assert_eq!(repo.storage_used(owner).await.unwrap(), 0);
    }
}
