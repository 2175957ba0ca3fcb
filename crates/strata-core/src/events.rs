//! Job lifecycle events and the event bus abstraction.
//!
//! Workers publish one [`JobEvent`] per meaningful transition. Every bus
//! implementation fans events into a local `tokio::sync::broadcast` channel,
//! so consumers (the notification gateway, tests) subscribe the same way
//! regardless of whether events arrive in-process or over Redis.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::defaults::EVENT_BUS_CAPACITY;
use crate::error::Result;
use crate::models::{Job, JobStatus, JobType};

/// Wire name of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobEventType {
    #[serde(rename = "job:started")]
    Started,
    #[serde(rename = "job:progress")]
    Progress,
    #[serde(rename = "job:complete")]
    Complete,
    #[serde(rename = "job:failed")]
    Failed,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Started => "job:started",
            JobEventType::Progress => "job:progress",
            JobEventType::Complete => "job:complete",
            JobEventType::Failed => "job:failed",
        }
    }
}

/// Bus payload. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub job_id: Uuid,
    pub job_type: JobType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn from_job(event_type: JobEventType, job: &Job) -> Self {
        Self {
            event_type,
            job_id: job.id,
            job_type: job.job_type,
            document_id: job.document_id(),
            folder_id: job.folder_id(),
            session_id: job.session_id.clone(),
            status: job.status,
            progress: None,
            error_message: None,
            result: None,
            timestamp: Utc::now(),
        }
    }

    /// A worker claimed the job.
    pub fn started(job: &Job) -> Self {
        Self::from_job(JobEventType::Started, job)
    }

    /// The handler reported progress.
    pub fn progress(job: &Job, percent: i32) -> Self {
        let mut event = Self::from_job(JobEventType::Progress, job);
        event.status = JobStatus::Processing;
        event.progress = Some(percent);
        event
    }

    /// The job reached `complete`.
    pub fn complete(job: &Job) -> Self {
        let mut event = Self::from_job(JobEventType::Complete, job);
        event.progress = Some(crate::defaults::PROGRESS_COMPLETE);
        event.result = job.result.clone();
        event
    }

    /// The job reached `failed`.
    pub fn failed(job: &Job) -> Self {
        let mut event = Self::from_job(JobEventType::Failed, job);
        event.error_message = job.error_message.clone();
        event
    }
}

/// Publish/subscribe channel for job lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every subscriber, local or remote.
    async fn publish(&self, event: JobEvent) -> Result<()>;

    /// Subscribe to events. Each subscriber gets its own independent stream.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus backed by a broadcast channel.
#[derive(Clone)]
pub struct LocalEventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl LocalEventBus {
    /// Create a new event bus with the given buffer capacity.
    ///
    /// Recommended: 256 for production, 32 for tests.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to local subscribers only. Dropped silently when nobody listens.
    pub fn emit(&self, event: JobEvent) {
        tracing::debug!(
            event_type = event.event_type.as_str(),
            job_id = %event.job_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(event);
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        self.emit(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetType;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            job_type: JobType::ThumbnailGeneration,
            target_type: TargetType::Document,
            target_id: Uuid::now_v7(),
            status: JobStatus::Processing,
            priority: 3,
            attempts: 1,
            max_attempts: 3,
            error_message: None,
            result: None,
            progress: None,
            session_id: Some("batch-1".to_string()),
            run_after: now,
            claimed_at: Some(now),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&JobEventType::Complete).unwrap();
        assert_eq!(json, "\"job:complete\"");
        let parsed: JobEventType = serde_json::from_str("\"job:progress\"").unwrap();
        assert_eq!(parsed, JobEventType::Progress);
    }

    #[test]
    fn test_event_payload_shape() {
        let job = job();
        let event = JobEvent::started(&job);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "job:started");
        assert_eq!(json["job_id"], job.id.to_string());
        assert_eq!(json["document_id"], job.target_id.to_string());
        assert_eq!(json["session_id"], "batch-1");
        assert_eq!(json["status"], "processing");
        assert!(json.get("folder_id").is_none());
        assert!(json.get("error_message").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_failed_event_carries_error() {
        let mut job = job();
        job.status = JobStatus::Failed;
        job.error_message = Some("unsupported format".to_string());
        let event = JobEvent::failed(&job);
        assert_eq!(event.event_type, JobEventType::Failed);
        assert_eq!(event.error_message.as_deref(), Some("unsupported format"));
    }

    #[test]
    fn test_event_deserializes_from_wire() {
        let job = job();
        let json = serde_json::to_string(&JobEvent::progress(&job, 40)).unwrap();
        let back: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.progress, Some(40));
        assert_eq!(back.job_id, job.id);
    }

    #[tokio::test]
    async fn test_local_bus_fan_out() {
        let bus = LocalEventBus::new(32);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let event = JobEvent::started(&job());
        bus.publish(event.clone()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalEventBus::new(8);
        assert!(bus.publish(JobEvent::started(&job())).await.is_ok());
    }
}
