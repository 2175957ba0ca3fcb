//! Handlers for each derivation job type.
//!
//! Each handler loads its target fresh, does its work, and overwrites the
//! derived field on the document, so running a job twice is harmless.

mod summary;
mod text_extraction;
mod thumbnail;

use std::time::Duration;

use tokio::process::Command;
use uuid::Uuid;

use strata_core::{Document, DocumentRepository, Error, Result};

use crate::handler::JobResult;

pub use summary::{OpenAiSummarizer, SummaryHandler, Summarizer};
pub use text_extraction::TextExtractionHandler;
pub use thumbnail::ThumbnailHandler;

/// Failure message when the job's target was deleted before execution.
pub const TARGET_MISSING_MESSAGE: &str = "target no longer exists";

/// Load the target document or produce the terminal outcome for the job.
async fn load_document(
    documents: &dyn DocumentRepository,
    document_id: Option<Uuid>,
) -> std::result::Result<Document, JobResult> {
    let Some(id) = document_id else {
        return Err(JobResult::Failed(
            "job does not target a document".to_string(),
        ));
    };
    match documents.get(id).await {
        Ok(Some(doc)) => Ok(doc),
        Ok(None) => Err(JobResult::Failed(TARGET_MISSING_MESSAGE.to_string())),
        Err(e) => Err(JobResult::from_error(&e)),
    }
}

/// Map a blob read failure: a missing blob will not reappear, anything else might.
fn blob_read_failure(path: &str, error: Error) -> JobResult {
    match error {
        Error::NotFound(_) => JobResult::Failed(format!("stored content missing: {path}")),
        other => JobResult::from_error(&other),
    }
}

/// Run an external tool with a timeout, returning stdout bytes.
///
/// The child is killed if the timeout elapses.
async fn run_cmd_with_timeout(cmd: &mut Command, timeout_secs: u64) -> Result<Vec<u8>> {
    cmd.kill_on_drop(true);
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| Error::Job(format!("External command timed out after {timeout_secs}s")))?
        .map_err(|e| Error::Internal(format!("Failed to execute command: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::InvalidInput(format!(
            "Command failed (exit {}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_blob_is_permanent() {
        let result = blob_read_failure("ab/cd/x.txt", Error::NotFound("ab/cd/x.txt".into()));
        assert!(matches!(result, JobResult::Failed(msg) if msg.contains("ab/cd/x.txt")));
    }

    #[test]
    fn test_storage_error_is_retryable() {
        let result = blob_read_failure("ab/cd/x.txt", Error::Storage("timeout".into()));
        assert!(matches!(result, JobResult::Retry(_)));
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let result = run_cmd_with_timeout(
            &mut Command::new("strata-definitely-not-a-real-binary"),
            5,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timeout_returns_job_error_promptly() {
        let start = std::time::Instant::now();
        let result = run_cmd_with_timeout(Command::new("sleep").arg("30"), 1).await;
        assert!(matches!(result, Err(Error::Job(msg)) if msg.contains("timed out after 1s")));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timed_out_command_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let result = run_cmd_with_timeout(Command::new("sh").arg("-c").arg(&script), 1).await;
        assert!(matches!(result, Err(Error::Job(_))));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        // Gone, or a zombie awaiting reaping
        let mut alive = true;
        for _ in 0..50 {
            match std::fs::read_to_string(&stat) {
                Err(_) => alive = false,
                Ok(s) => alive = !s.contains(") Z "),
            }
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "sleep outlived its timeout");
    }
}
