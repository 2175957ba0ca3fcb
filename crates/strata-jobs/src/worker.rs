//! Job worker pools: dispatch, execution, retry, and stale reclaim.
//!
//! Each job type gets its own dispatch loop bounded by a semaphore. A loop
//! only takes a candidate once it holds a permit, so a full pool never
//! blocks other types. Claims go through the repository's conditional
//! update; the scheduler only suggests what to try next.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use strata_core::{
    DerivedStatus, DocumentRepository, Error, EventBus, Job, JobEvent, JobRepository, JobStatus,
    JobType, NewJob, Result, TargetType,
};

use crate::config::WorkerConfig;
use crate::handler::{HandlerSet, JobContext, JobResult};
use crate::scheduler::Scheduler;

/// Handle for controlling a running worker.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the loops, but does not wait for in-flight jobs.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    scheduler: Arc<Scheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Whether any worker loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stop taking new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Job worker shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.close();

        let mut panicked = 0;
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = ?e, "Worker loop panicked");
                panicked += 1;
            }
        }
        info!("Job worker stopped");
        if panicked > 0 {
            return Err(Error::Internal(format!("{panicked} worker loop(s) panicked")));
        }
        Ok(())
    }
}

/// Job worker that executes derivation jobs.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    documents: Arc<dyn DocumentRepository>,
    bus: Arc<dyn EventBus>,
    scheduler: Arc<Scheduler>,
    handlers: HandlerSet,
    config: WorkerConfig,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        documents: Arc<dyn DocumentRepository>,
        bus: Arc<dyn EventBus>,
        scheduler: Arc<Scheduler>,
        handlers: HandlerSet,
    ) -> Self {
        Self {
            jobs,
            documents,
            bus,
            scheduler,
            handlers,
            config: WorkerConfig::default(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the dispatch, sweep, and reap loops.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = self.scheduler.clone();

        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return WorkerHandle {
                shutdown_tx,
                scheduler,
                tasks: Vec::new(),
            };
        }

        info!(
            text_extraction = self.config.text_extraction_concurrency,
            thumbnail_generation = self.config.thumbnail_generation_concurrency,
            summary_generation = self.config.summary_generation_concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            liveness_secs = self.config.liveness_secs,
            max_attempts = self.config.retry.max_attempts,
            "Job worker started"
        );

        let worker = Arc::new(self);
        let mut tasks = Vec::new();
        for job_type in JobType::ALL {
            tasks.push(tokio::spawn(
                worker.clone().dispatch_loop(job_type, shutdown_rx.clone()),
            ));
        }
        tasks.push(tokio::spawn(worker.clone().sweep_loop(shutdown_rx.clone())));
        tasks.push(tokio::spawn(worker.reap_loop(shutdown_rx)));

        WorkerHandle {
            shutdown_tx,
            scheduler,
            tasks,
        }
    }

    #[instrument(skip(self, shutdown))]
    async fn dispatch_loop(self: Arc<Self>, job_type: JobType, mut shutdown: watch::Receiver<bool>) {
        let permits = self.config.concurrency_for(job_type);
        let semaphore = Arc::new(Semaphore::new(permits));
        let poll_interval = self.config.poll_interval();
        debug!(%job_type, permits, "Dispatch loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Hold a slot before taking a candidate so nothing waits behind a full pool
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.claim_next(job_type).await {
                Some(job) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.execute_job(job).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = self.scheduler.wait_for_work(job_type, poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        // Wait for in-flight jobs of this type
        let _ = semaphore.acquire_many(permits as u32).await;
        debug!(%job_type, "Dispatch loop stopped");
    }

    /// Claim the next candidate of a type, skipping candidates another worker won.
    async fn claim_next(&self, job_type: JobType) -> Option<Job> {
        while let Some(job_id) = self.scheduler.next_due(job_type).await {
            match self.jobs.claim(job_id).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => debug!(%job_id, "Candidate not claimable, skipping"),
                Err(e) => {
                    // The sweep will offer it again
                    error!(error = ?e, %job_id, "Failed to claim job");
                    return None;
                }
            }
        }
        None
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.sweep().await {
                        warn!(error = %e, "Scheduler sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn reap_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.reap_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.reap_stale().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Return orphaned processing jobs to the queue, or fail them when exhausted.
    async fn reap_stale(&self) {
        let reclaimed = match self.jobs.reclaim_stale(self.config.liveness()).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                warn!(error = %e, "Stale job reclaim failed");
                return;
            }
        };
        if reclaimed.is_empty() {
            return;
        }

        info!(count = reclaimed.len(), "Reclaimed stale jobs");
        for job in reclaimed {
            match job.status {
                JobStatus::Pending => {
                    if let Err(e) = self.scheduler.enqueue(&job).await {
                        warn!(error = %e, job_id = %job.id, "Failed to enqueue reclaimed job");
                    }
                }
                JobStatus::Failed => {
                    warn!(job_id = %job.id, job_type = %job.job_type, "Stale job exhausted its attempts");
                    self.mirror_status(&job).await;
                    self.publish(JobEvent::failed(&job)).await;
                }
                _ => {}
            }
        }
    }

    /// Execute a single claimed job and record its outcome.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn execute_job(&self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;

        info!(%job_id, %job_type, attempt = job.attempts, max_attempts = job.max_attempts, "Processing job");
        self.publish(JobEvent::started(&job)).await;

        // Progress is persisted and published in report order, before the terminal event
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<i32>();
        let forwarder = {
            let jobs = self.jobs.clone();
            let bus = self.bus.clone();
            let snapshot = job.clone();
            tokio::spawn(async move {
                while let Some(percent) = progress_rx.recv().await {
                    match jobs.update_progress(snapshot.id, percent).await {
                        Ok(true) => {
                            if let Err(e) = bus.publish(JobEvent::progress(&snapshot, percent)).await {
                                warn!(error = %e, job_id = %snapshot.id, "Failed to publish progress");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, job_id = %snapshot.id, "Failed to record progress"),
                    }
                }
            })
        };

        let ctx = JobContext::new(job.clone()).with_progress_callback(move |percent, message| {
            if let Some(message) = message {
                debug!(%job_id, percent, progress_message = message, "Job progress");
            }
            let _ = progress_tx.send(percent);
        });

        let handler = self.handlers.handler_for(job_type).clone();
        let timeout = self.config.job_timeout();
        let result = match tokio::time::timeout(timeout, handler.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%job_id, %job_type, "Job exceeded timeout of {}s", timeout.as_secs());
                JobResult::Retry(format!("Job exceeded timeout of {}s", timeout.as_secs()))
            }
        };

        if let Err(e) = forwarder.await {
            warn!(error = ?e, %job_id, "Progress forwarder panicked");
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            JobResult::Success(data) => match self.jobs.complete(job_id, data).await {
                Ok(Some(done)) => {
                    info!(%job_id, %job_type, duration_ms, "Job completed successfully");
                    self.mirror_status(&done).await;
                    self.enqueue_follow_ups(&done).await;
                    self.publish(JobEvent::complete(&done)).await;
                }
                Ok(None) => warn!(%job_id, %job_type, "Job no longer processing, completion dropped"),
                Err(e) => error!(error = ?e, %job_id, "Failed to mark job as completed"),
            },
            JobResult::Retry(reason) if job.attempts < job.max_attempts => {
                let delay = self.config.retry.delay_for(job.attempts);
                let run_after = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                match self.jobs.requeue(job_id, &reason, run_after).await {
                    Ok(Some(requeued)) => {
                        warn!(
                            %job_id,
                            %job_type,
                            error = %reason,
                            attempt = job.attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            duration_ms,
                            "Job failed, will retry"
                        );
                        if let Err(e) = self.scheduler.enqueue(&requeued).await {
                            warn!(error = %e, %job_id, "Failed to enqueue retry");
                        }
                    }
                    Ok(None) => warn!(%job_id, %job_type, "Job no longer processing, retry dropped"),
                    Err(e) => error!(error = ?e, %job_id, "Failed to requeue job"),
                }
            }
            JobResult::Retry(reason) | JobResult::Failed(reason) => {
                match self.jobs.fail(job_id, &reason).await {
                    Ok(Some(failed)) => {
                        warn!(
                            %job_id,
                            %job_type,
                            error = %reason,
                            attempts = failed.attempts,
                            duration_ms,
                            "Job failed"
                        );
                        self.mirror_status(&failed).await;
                        self.publish(JobEvent::failed(&failed)).await;
                    }
                    Ok(None) => warn!(%job_id, %job_type, "Job no longer processing, failure dropped"),
                    Err(e) => error!(error = ?e, %job_id, "Failed to mark job as failed"),
                }
            }
        }
    }

    /// Copy a terminal job status onto its document.
    async fn mirror_status(&self, job: &Job) {
        let Some(document_id) = job.document_id() else {
            return;
        };
        match self
            .documents
            .set_derived_status(document_id, job.job_type, DerivedStatus::from(job.status))
            .await
        {
            Ok(()) => {}
            Err(Error::DocumentNotFound(_)) => {
                debug!(%document_id, job_id = %job.id, "Document gone, status not mirrored");
            }
            Err(e) => warn!(error = %e, %document_id, job_id = %job.id, "Failed to mirror job status"),
        }
    }

    /// Summaries follow text extraction that produced text.
    async fn enqueue_follow_ups(&self, job: &Job) {
        if job.job_type != JobType::TextExtraction
            || job.target_type != TargetType::Document
            || !self.config.summary_enabled
        {
            return;
        }
        let chars = job
            .result
            .as_ref()
            .and_then(|r| r.get("chars"))
            .and_then(|c| c.as_u64())
            .unwrap_or(0);
        if chars == 0 {
            return;
        }

        let new_job = NewJob::for_document(
            JobType::SummaryGeneration,
            job.target_id,
            self.config.retry.max_attempts,
        )
        .with_session(job.session_id.clone());
        let summary = match self.jobs.insert(new_job).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, document_id = %job.target_id, "Failed to create summary job");
                return;
            }
        };
        debug!(job_id = %summary.id, document_id = %job.target_id, "Queued summary job");

        if let Err(e) = self
            .documents
            .set_derived_status(job.target_id, JobType::SummaryGeneration, DerivedStatus::Pending)
            .await
        {
            debug!(error = %e, document_id = %job.target_id, "Failed to mark summary pending");
        }
        if let Err(e) = self.scheduler.enqueue(&summary).await {
            warn!(error = %e, job_id = %summary.id, "Failed to enqueue summary job");
        }
    }

    async fn publish(&self, event: JobEvent) {
        let event_type = event.event_type.as_str();
        let job_id = event.job_id;
        if let Err(e) = self.bus.publish(event).await {
            warn!(error = %e, event_type, %job_id, "Failed to publish job event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use std::time::Duration;
    use strata_core::{JobEventType, LocalEventBus};
    use strata_db::{InMemoryDocumentRepository, InMemoryJobRepository};
    use uuid::Uuid;

    use crate::handler::JobHandler;

    struct Outcome(JobType, JobResult);

    #[async_trait]
    impl JobHandler for Outcome {
        fn job_type(&self) -> JobType {
            self.0
        }

        async fn execute(&self, ctx: JobContext) -> JobResult {
            ctx.report_progress(50, None);
            self.1.clone()
        }
    }

    fn handlers(text: JobResult) -> HandlerSet {
        HandlerSet::new(
            Arc::new(Outcome(JobType::TextExtraction, text)),
            Arc::new(Outcome(JobType::ThumbnailGeneration, JobResult::Success(None))),
            Arc::new(Outcome(JobType::SummaryGeneration, JobResult::Success(None))),
        )
        .unwrap()
    }

    struct Harness {
        jobs: Arc<InMemoryJobRepository>,
        bus: LocalEventBus,
        worker: JobWorker,
    }

    fn harness(text: JobResult, config: WorkerConfig) -> Harness {
        let jobs = Arc::new(InMemoryJobRepository::new());
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let bus = LocalEventBus::new(64);
        let scheduler = Arc::new(Scheduler::new(jobs.clone()));
        let worker = JobWorker::new(
            jobs.clone(),
            documents,
            Arc::new(bus.clone()),
            scheduler,
            handlers(text),
        )
        .with_config(config);
        Harness { jobs, bus, worker }
    }

    async fn claimed(jobs: &InMemoryJobRepository, max_attempts: i32) -> Job {
        let job = jobs
            .insert(NewJob::for_document(JobType::TextExtraction, Uuid::now_v7(), max_attempts))
            .await
            .unwrap();
        jobs.claim(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_success_publishes_ordered_events() {
        let h = harness(JobResult::Success(None), WorkerConfig::default());
        let mut rx = h.bus.subscribe();
        let job = claimed(&h.jobs, 3).await;

        h.worker.execute_job(job.clone()).await;

        let kinds: Vec<JobEventType> = (0..3).map(|_| rx.try_recv().unwrap().event_type).collect();
        assert_eq!(
            kinds,
            vec![JobEventType::Started, JobEventType::Progress, JobEventType::Complete]
        );
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.progress, Some(100));
    }

    #[tokio::test]
    async fn test_retry_requeues_with_backoff_and_no_terminal_event() {
        let config = WorkerConfig::default()
            .with_retry(crate::RetryPolicy::default().with_backoff_ms(60_000));
        let h = harness(JobResult::Retry("flaky".into()), config);
        let mut rx = h.bus.subscribe();
        let job = claimed(&h.jobs, 3).await;

        h.worker.execute_job(job.clone()).await;

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.error_message.as_deref(), Some("flaky"));
        assert!(stored.run_after > Utc::now() + chrono::Duration::seconds(30));
        assert!(h.jobs.claim(job.id).await.unwrap().is_none());

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(
                event.event_type,
                JobEventType::Complete | JobEventType::Failed
            ));
        }
    }

    #[tokio::test]
    async fn test_retry_on_last_attempt_fails() {
        let h = harness(JobResult::Retry("still flaky".into()), WorkerConfig::default());
        let mut rx = h.bus.subscribe();
        let job = claimed(&h.jobs, 1).await;

        h.worker.execute_job(job.clone()).await;

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(last.event_type, JobEventType::Failed);
        assert_eq!(last.error_message.as_deref(), Some("still flaky"));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        struct Slow;

        #[async_trait]
        impl JobHandler for Slow {
            fn job_type(&self) -> JobType {
                JobType::TextExtraction
            }

            async fn execute(&self, _ctx: JobContext) -> JobResult {
                tokio::time::sleep(Duration::from_secs(30)).await;
                JobResult::Success(None)
            }
        }

        let mut h = harness(JobResult::Success(None), WorkerConfig::default().with_job_timeout(1));
        h.worker.handlers = h.worker.handlers.clone().with_handler(Arc::new(Slow));
        let job = claimed(&h.jobs, 3).await;

        h.worker.execute_job(job.clone()).await;

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.error_message.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_disabled_worker_starts_nothing() {
        let h = harness(JobResult::Success(None), WorkerConfig::default().with_enabled(false));
        let handle = h.worker.start();
        assert!(!handle.is_running());
        handle.shutdown().await.unwrap();
    }
}
