//! In-memory ready queues in front of the durable job table.
//!
//! Entries are hints. The repository's conditional claim decides who runs a
//! job; a stale or duplicate hint just loses the claim. The periodic sweep
//! reloads due `pending` rows, so a lost enqueue only delays a job.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use strata_core::defaults::JOB_SWEEP_BATCH;
use strata_core::{Error, Job, JobRepository, JobType, Result};

/// Queue entry; the heap yields the highest priority, then the oldest job.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    id: Uuid,
    priority: i32,
    created_at: DateTime<Utc>,
    run_after: DateTime<Utc>,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed entry ordered by eligibility time.
#[derive(Debug, PartialEq, Eq)]
struct Delayed(Entry);

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .run_after
            .cmp(&other.0.run_after)
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct ReadyQueue {
    ready: BinaryHeap<Entry>,
    delayed: BinaryHeap<Reverse<Delayed>>,
    /// Latest `run_after` per queued job. Heap entries that disagree are stale.
    queued: HashMap<Uuid, DateTime<Utc>>,
}

impl ReadyQueue {
    fn is_current(&self, entry: &Entry) -> bool {
        self.queued.get(&entry.id) == Some(&entry.run_after)
    }

    /// Returns false when the job was already queued with the same `run_after`.
    fn push(&mut self, entry: Entry, now: DateTime<Utc>) -> bool {
        if self.queued.get(&entry.id) == Some(&entry.run_after) {
            return false;
        }
        self.queued.insert(entry.id, entry.run_after);
        if entry.run_after <= now {
            self.ready.push(entry);
        } else {
            self.delayed.push(Reverse(Delayed(entry)));
        }
        true
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(Reverse(Delayed(head))) = self.delayed.peek() {
            if head.run_after > now {
                break;
            }
            if let Some(Reverse(Delayed(entry))) = self.delayed.pop() {
                if self.is_current(&entry) {
                    self.ready.push(entry);
                }
            }
        }
    }

    fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Uuid> {
        self.promote_due(now);
        while let Some(entry) = self.ready.pop() {
            if self.is_current(&entry) {
                self.queued.remove(&entry.id);
                return Some(entry.id);
            }
        }
        None
    }

    /// Time until the earliest delayed entry becomes due.
    fn next_wakeup(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.delayed
            .peek()
            .map(|Reverse(Delayed(entry))| (entry.run_after - now).to_std().unwrap_or_default())
    }
}

struct TypeQueue {
    state: Mutex<ReadyQueue>,
    notify: Notify,
}

impl TypeQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReadyQueue::default()),
            notify: Notify::new(),
        }
    }
}

/// One ready queue per job type, fed by enqueue and by sweeping the repository.
pub struct Scheduler {
    jobs: Arc<dyn JobRepository>,
    text_extraction: TypeQueue,
    thumbnail_generation: TypeQueue,
    summary_generation: TypeQueue,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new(jobs: Arc<dyn JobRepository>) -> Self {
        Self {
            jobs,
            text_extraction: TypeQueue::new(),
            thumbnail_generation: TypeQueue::new(),
            summary_generation: TypeQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn queue(&self, job_type: JobType) -> &TypeQueue {
        match job_type {
            JobType::TextExtraction => &self.text_extraction,
            JobType::ThumbnailGeneration => &self.thumbnail_generation,
            JobType::SummaryGeneration => &self.summary_generation,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Offer a pending job to its type's queue.
    ///
    /// Duplicate offers for the same job and eligibility time are coalesced.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Job("scheduler is closed".to_string()));
        }
        let queue = self.queue(job.job_type);
        let added = queue.state.lock().await.push(
            Entry {
                id: job.id,
                priority: job.priority,
                created_at: job.created_at,
                run_after: job.run_after,
            },
            Utc::now(),
        );
        if added {
            queue.notify.notify_one();
        }
        Ok(())
    }

    /// Next due candidate for a job type, highest priority first, FIFO within a priority.
    pub async fn next_due(&self, job_type: JobType) -> Option<Uuid> {
        self.queue(job_type).state.lock().await.pop_due(Utc::now())
    }

    /// Sleep until work may be available: an enqueue, the earliest delayed
    /// entry becoming due, or `max_wait`, whichever comes first.
    pub async fn wait_for_work(&self, job_type: JobType, max_wait: Duration) {
        if self.is_closed() {
            return;
        }
        let queue = self.queue(job_type);
        let wait = match queue.state.lock().await.next_wakeup(Utc::now()) {
            Some(wakeup) => wakeup.min(max_wait),
            None => max_wait,
        };
        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    /// Reload due `pending` jobs from the repository. Returns how many were new.
    pub async fn sweep(&self) -> Result<usize> {
        let mut added = 0;
        for job_type in JobType::ALL {
            let due = self.jobs.list_due(job_type, JOB_SWEEP_BATCH).await?;
            if due.is_empty() {
                continue;
            }
            let queue = self.queue(job_type);
            let now = Utc::now();
            let mut state = queue.state.lock().await;
            let before = added;
            for job in &due {
                let entry = Entry {
                    id: job.id,
                    priority: job.priority,
                    created_at: job.created_at,
                    run_after: job.run_after,
                };
                if state.push(entry, now) {
                    added += 1;
                }
            }
            drop(state);
            if added > before {
                queue.notify.notify_one();
            }
        }
        if added > 0 {
            debug!(added, "Scheduler sweep queued jobs");
        }
        Ok(added)
    }

    /// Queued candidates for a job type, due or not.
    pub async fn len(&self, job_type: JobType) -> usize {
        self.queue(job_type).state.lock().await.queued.len()
    }

    /// Stop accepting work and wake every waiting dispatch loop.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        for job_type in JobType::ALL {
            self.queue(job_type).notify.notify_waiters();
        }
    }
}
