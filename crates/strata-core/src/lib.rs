//! # strata-core
//!
//! Core types, traits, and abstractions for the strata document pipeline.
//!
//! This crate provides the foundational data structures (jobs, documents,
//! job events) and the repository, content-store, and event-bus traits that
//! the database, job, and API crates implement or consume.

pub mod content;
pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use content::{compute_content_hash, extension_for, storage_path_for};
pub use error::{Error, Result};
pub use events::{EventBus, JobEvent, JobEventType, LocalEventBus};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
