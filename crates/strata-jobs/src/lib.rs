//! # strata-jobs
//!
//! Derivation pipeline for strata documents.
//!
//! This crate provides:
//! - Ingest with content-hash dedup and storage quota enforcement
//! - Per-type ready queues fed by enqueue and a periodic durable sweep
//! - Bounded worker pools that claim, execute, retry and reap jobs
//! - Handlers for text extraction, thumbnails and summaries
//! - A Redis-backed event bus for multi-process deployments
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use strata_jobs::{HandlerSet, JobWorker, Scheduler, WorkerConfig};
//!
//! let scheduler = Arc::new(Scheduler::new(jobs.clone()));
//! let handlers = HandlerSet::standard(documents.clone(), store.clone(), summarizer);
//!
//! let handle = JobWorker::new(jobs, documents, bus, scheduler, handlers)
//!     .with_config(WorkerConfig::from_env())
//!     .start();
//!
//! // Graceful shutdown: waits for in-flight jobs
//! handle.shutdown().await;
//! ```

pub mod bus;
pub mod config;
pub mod handler;
pub mod handlers;
pub mod ingest;
pub mod retry;
pub mod scheduler;
pub mod worker;

// Re-export core types
pub use strata_core::*;

pub use bus::RedisEventBus;
pub use config::{IngestConfig, WorkerConfig};
pub use handler::{HandlerSet, JobContext, JobHandler, JobResult};
pub use handlers::{
    OpenAiSummarizer, SummaryHandler, Summarizer, TextExtractionHandler, ThumbnailHandler,
    TARGET_MISSING_MESSAGE,
};
pub use ingest::{plan_jobs, IngestService};
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use worker::{JobWorker, WorkerHandle};
