//! Thumbnail generation for raster images and PDFs.

use std::io::{Cursor, Write};
use std::sync::Arc;

use async_trait::async_trait;
use image::ImageFormat;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use strata_core::defaults::{EXTRACTION_CMD_TIMEOUT_SECS, PROGRESS_PROCESSING, THUMBNAIL_MAX_EDGE};
use strata_core::{ContentStore, DocumentRepository, Error, JobType, Result};

use super::{blob_read_failure, load_document, run_cmd_with_timeout, TARGET_MISSING_MESSAGE};
use crate::handler::{JobContext, JobHandler, JobResult};

/// Renders a PNG thumbnail no larger than `max_edge` on either side.
///
/// Thumbnails are stored content-addressed, so regenerating one for the
/// same source lands on the same path.
pub struct ThumbnailHandler {
    documents: Arc<dyn DocumentRepository>,
    store: Arc<dyn ContentStore>,
    max_edge: u32,
}

impl ThumbnailHandler {
    pub fn new(documents: Arc<dyn DocumentRepository>, store: Arc<dyn ContentStore>) -> Self {
        Self {
            documents,
            store,
            max_edge: THUMBNAIL_MAX_EDGE,
        }
    }

    /// Set the longest thumbnail edge in pixels (default: 256).
    pub fn with_max_edge(mut self, max_edge: u32) -> Self {
        self.max_edge = max_edge.max(1);
        self
    }

    async fn render(&self, mime_type: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let source = if mime_type.eq_ignore_ascii_case("application/pdf") {
            rasterize_first_page(&data, self.max_edge).await?
        } else {
            data
        };

        let max_edge = self.max_edge;
        tokio::task::spawn_blocking(move || encode_thumbnail(&source, max_edge))
            .await
            .map_err(|e| Error::Internal(format!("thumbnail task failed: {e}")))?
    }
}

/// Decode an image, shrink it to fit `max_edge`, and encode as PNG.
fn encode_thumbnail(data: &[u8], max_edge: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)
        .map_err(|e| Error::InvalidInput(format!("cannot decode image: {e}")))?;
    let thumb = img.thumbnail(max_edge, max_edge);
    let mut out = Cursor::new(Vec::new());
    thumb
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::Internal(format!("cannot encode thumbnail: {e}")))?;
    Ok(out.into_inner())
}

/// Render page one of a PDF to PNG with `pdftoppm`.
async fn rasterize_first_page(data: &[u8], max_edge: u32) -> Result<Vec<u8>> {
    if data.len() < 4 || &data[0..4] != b"%PDF" {
        return Err(Error::InvalidInput(
            "not a valid PDF (missing %PDF header)".to_string(),
        ));
    }
    let mut tmpfile = NamedTempFile::new()
        .map_err(|e| Error::Internal(format!("Failed to create temp file: {e}")))?;
    tmpfile
        .write_all(data)
        .map_err(|e| Error::Internal(format!("Failed to write temp file: {e}")))?;

    run_cmd_with_timeout(
        Command::new("pdftoppm")
            .arg("-png")
            .arg("-singlefile")
            .arg("-f")
            .arg("1")
            .arg("-scale-to")
            .arg(max_edge.to_string())
            .arg(tmpfile.path()),
        EXTRACTION_CMD_TIMEOUT_SECS,
    )
    .await
}

#[async_trait]
impl JobHandler for ThumbnailHandler {
    fn job_type(&self) -> JobType {
        JobType::ThumbnailGeneration
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let doc = match load_document(self.documents.as_ref(), ctx.document_id()).await {
            Ok(doc) => doc,
            Err(outcome) => return outcome,
        };

        let data = match self.store.get(&doc.storage_path).await {
            Ok(data) => data,
            Err(e) => return blob_read_failure(&doc.storage_path, e),
        };
        ctx.report_progress(PROGRESS_PROCESSING, Some("Rendering thumbnail"));

        let png = match self.render(&doc.mime_type, data).await {
            Ok(png) => png,
            Err(e) => return JobResult::from_error(&e),
        };

        let blob = match self.store.put(&png, "png").await {
            Ok(blob) => blob,
            Err(e) => return JobResult::from_error(&e),
        };
        debug!(document_id = %doc.id, path = %blob.path, size = blob.size, "Thumbnail stored");

        match self.documents.set_thumbnail(doc.id, &blob.path).await {
            Ok(()) => JobResult::Success(Some(json!({
                "path": blob.path,
                "size": blob.size,
            }))),
            Err(Error::DocumentNotFound(_)) => {
                JobResult::Failed(TARGET_MISSING_MESSAGE.to_string())
            }
            Err(e) => JobResult::from_error(&e),
        }
    }
}
