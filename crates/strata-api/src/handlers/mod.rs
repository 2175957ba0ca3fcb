//! HTTP and WebSocket handlers for strata-api.

pub mod documents;
pub mod jobs;
pub mod ws;

pub use documents::{get_document, request_folder_summary, upload_document, OWNER_HEADER};
pub use jobs::{batch_status, get_job, health};
pub use ws::ws_handler;
