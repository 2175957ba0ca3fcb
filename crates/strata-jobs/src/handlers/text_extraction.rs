//! Text extraction: native decoding for text formats, `pdftotext` for PDFs,
//! `tesseract` OCR for raster images.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use strata_core::defaults::{EXTRACTION_CMD_TIMEOUT_SECS, PROGRESS_PROCESSING};
use strata_core::{ContentStore, DocumentRepository, Error, JobType, Result};

use super::{blob_read_failure, load_document, run_cmd_with_timeout};
use crate::handler::{JobContext, JobHandler, JobResult};

/// How text is pulled out of a given mime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Native,
    Pdf,
    Ocr,
}

impl Method {
    fn for_mime(mime_type: &str) -> Option<Self> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime.starts_with("text/")
            || mime == "application/json"
            || mime == "application/xml"
            || mime == "application/javascript"
            || mime == "application/x-yaml"
            || mime == "image/svg+xml"
            || mime.ends_with("+json")
            || mime.ends_with("+xml")
        {
            Some(Method::Native)
        } else if mime == "application/pdf" {
            Some(Method::Pdf)
        } else if mime.starts_with("image/") {
            Some(Method::Ocr)
        } else {
            None
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Method::Native => "native",
            Method::Pdf => "pdftotext",
            Method::Ocr => "ocr",
        }
    }
}

/// Extracts plain text from a document's stored content.
pub struct TextExtractionHandler {
    documents: Arc<dyn DocumentRepository>,
    store: Arc<dyn ContentStore>,
}

impl TextExtractionHandler {
    pub fn new(documents: Arc<dyn DocumentRepository>, store: Arc<dyn ContentStore>) -> Self {
        Self { documents, store }
    }

    async fn extract(method: Method, data: &[u8], filename: &str) -> Result<String> {
        match method {
            Method::Native => Ok(String::from_utf8_lossy(data).into_owned()),
            Method::Pdf => {
                if data.len() < 4 || &data[0..4] != b"%PDF" {
                    return Err(Error::InvalidInput(format!(
                        "File '{filename}' is not a valid PDF (missing %PDF header)"
                    )));
                }
                let tmpfile = write_temp(data)?;
                let stdout = run_cmd_with_timeout(
                    Command::new("pdftotext").arg(tmpfile.path()).arg("-"),
                    EXTRACTION_CMD_TIMEOUT_SECS,
                )
                .await?;
                Ok(String::from_utf8_lossy(&stdout).into_owned())
            }
            Method::Ocr => {
                let tmpfile = write_temp(data)?;
                let stdout = run_cmd_with_timeout(
                    Command::new("tesseract").arg(tmpfile.path()).arg("stdout"),
                    EXTRACTION_CMD_TIMEOUT_SECS,
                )
                .await?;
                Ok(String::from_utf8_lossy(&stdout).into_owned())
            }
        }
    }
}

fn write_temp(data: &[u8]) -> Result<NamedTempFile> {
    let mut tmpfile = NamedTempFile::new()
        .map_err(|e| Error::Internal(format!("Failed to create temp file: {e}")))?;
    tmpfile
        .write_all(data)
        .map_err(|e| Error::Internal(format!("Failed to write temp file: {e}")))?;
    Ok(tmpfile)
}

#[async_trait]
impl JobHandler for TextExtractionHandler {
    fn job_type(&self) -> JobType {
        JobType::TextExtraction
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let doc = match load_document(self.documents.as_ref(), ctx.document_id()).await {
            Ok(doc) => doc,
            Err(outcome) => return outcome,
        };

        let Some(method) = Method::for_mime(&doc.mime_type) else {
            return JobResult::Failed(format!(
                "unsupported content type for text extraction: {}",
                doc.mime_type
            ));
        };

        let data = match self.store.get(&doc.storage_path).await {
            Ok(data) => data,
            Err(e) => return blob_read_failure(&doc.storage_path, e),
        };
        ctx.report_progress(PROGRESS_PROCESSING, Some("Extracting text"));

        let text = match Self::extract(method, &data, &doc.filename).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => return JobResult::from_error(&e),
        };
        let chars = text.chars().count();
        debug!(document_id = %doc.id, method = method.as_str(), chars, "Text extracted");

        if let Err(e) = self.documents.set_extracted_text(doc.id, &text).await {
            return match e {
                Error::DocumentNotFound(_) => {
                    JobResult::Failed(super::TARGET_MISSING_MESSAGE.to_string())
                }
                other => JobResult::from_error(&other),
            };
        }

        JobResult::Success(Some(json!({
            "chars": chars,
            "method": method.as_str(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strata_core::{Job, JobStatus, NewDocument, TargetType};
    use strata_db::{FilesystemContentStore, InMemoryDocumentRepository};
    use uuid::Uuid;

    #[test]
    fn test_method_selection() {
        assert_eq!(Method::for_mime("text/plain"), Some(Method::Native));
        assert_eq!(
            Method::for_mime("text/markdown; charset=utf-8"),
            Some(Method::Native)
        );
        assert_eq!(Method::for_mime("application/ld+json"), Some(Method::Native));
        assert_eq!(Method::for_mime("image/svg+xml"), Some(Method::Native));
        assert_eq!(Method::for_mime("application/pdf"), Some(Method::Pdf));
        assert_eq!(Method::for_mime("image/png"), Some(Method::Ocr));
        assert_eq!(Method::for_mime("application/zip"), None);
    }

    fn job_for(document_id: Uuid) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::now_v7(),
            job_type: JobType::TextExtraction,
            target_type: TargetType::Document,
            target_id: document_id,
            status: JobStatus::Processing,
            priority: 5,
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

    async fn setup(
        content: &[u8],
        mime_type: &str,
    ) -> (
        tempfile::TempDir,
        Arc<InMemoryDocumentRepository>,
        TextExtractionHandler,
        Uuid,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FilesystemContentStore::new(
            dir.path(),
            "http://localhost/files",
            b"secret".to_vec(),
        ));
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let blob = store.put(content, "bin").await.unwrap();
        let doc = documents
            .insert(NewDocument {
                owner_id: Uuid::now_v7(),
                folder_id: None,
                filename: "input".to_string(),
                mime_type: mime_type.to_string(),
                content_hash: blob.hash.clone(),
                storage_path: blob.path.clone(),
                size_bytes: blob.size,
            })
            .await
            .unwrap()
            .unwrap();
        let handler = TextExtractionHandler::new(documents.clone(), store);
        (dir, documents, handler, doc.id)
    }

    #[tokio::test]
    async fn test_extracts_plain_text() {
        let (_dir, documents, handler, doc_id) =
            setup(b"  hello strata\n", "text/plain").await;

        let result = handler.execute(JobContext::new(job_for(doc_id))).await;
        let JobResult::Success(Some(value)) = result else {
            panic!("expected success, got {result:?}");
        };
        assert_eq!(value["chars"], 12);
        assert_eq!(value["method"], "native");

        let doc = documents.get(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.extracted_text.as_deref(), Some("hello strata"));
    }

    #[tokio::test]
    async fn test_rerun_overwrites_text() {
        let (_dir, documents, handler, doc_id) = setup(b"same", "text/plain").await;
        documents.set_extracted_text(doc_id, "stale").await.unwrap();

        handler.execute(JobContext::new(job_for(doc_id))).await;
        handler.execute(JobContext::new(job_for(doc_id))).await;

        let doc = documents.get(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.extracted_text.as_deref(), Some("same"));
    }

    #[tokio::test]
    async fn test_unsupported_type_is_permanent() {
        let (_dir, _documents, handler, doc_id) = setup(b"PK\x03\x04", "application/zip").await;
        let result = handler.execute(JobContext::new(job_for(doc_id))).await;
        assert!(matches!(result, JobResult::Failed(msg) if msg.contains("application/zip")));
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_permanent() {
        let (_dir, _documents, handler, doc_id) = setup(b"not a pdf", "application/pdf").await;
        let result = handler.execute(JobContext::new(job_for(doc_id))).await;
        assert!(matches!(result, JobResult::Failed(msg) if msg.contains("%PDF")));
    }

    #[tokio::test]
    async fn test_deleted_document_fails_with_stable_message() {
        let (_dir, documents, handler, doc_id) = setup(b"gone", "text/plain").await;
        documents.delete(doc_id).await.unwrap();

        let result = handler.execute(JobContext::new(job_for(doc_id))).await;
        assert_eq!(
            result,
            JobResult::Failed(super::super::TARGET_MISSING_MESSAGE.to_string())
        );
    }
}
