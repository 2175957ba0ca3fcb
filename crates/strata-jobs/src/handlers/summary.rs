//! Summaries for documents and folders through an OpenAI-compatible
//! chat completions endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use strata_core::defaults::{PROGRESS_PROCESSING, SUMMARY_INPUT_MAX_CHARS};
use strata_core::{DocumentRepository, Error, JobType, Result, TargetType};

use super::{load_document, TARGET_MISSING_MESSAGE};
use crate::handler::{JobContext, JobHandler, JobResult};

/// Default base URL of the summary endpoint.
pub const DEFAULT_SUMMARY_API_URL: &str = "http://localhost:11434/v1";

/// Default summary model.
pub const DEFAULT_SUMMARY_MODEL: &str = "llama3.2";

const SUMMARY_REQUEST_TIMEOUT_SECS: u64 = 120;

const SYSTEM_PROMPT: &str = "You write concise, factual summaries. Reply with the summary only.";

/// Produces a summary for a block of text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Summarizer backed by `POST {base_url}/chat/completions`.
pub struct OpenAiSummarizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiSummarizer {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(SUMMARY_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        }
    }

    /// Create from environment variables.
    ///
    /// Uses `SUMMARY_API_URL`, `SUMMARY_MODEL` and the optional `SUMMARY_API_KEY`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("SUMMARY_API_URL")
            .unwrap_or_else(|_| DEFAULT_SUMMARY_API_URL.to_string());
        let model =
            std::env::var("SUMMARY_MODEL").unwrap_or_else(|_| DEFAULT_SUMMARY_MODEL.to_string());
        let summarizer = Self::new(base_url, model);
        match std::env::var("SUMMARY_API_KEY") {
            Ok(key) if !key.is_empty() => summarizer.with_api_key(key),
            _ => summarizer,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: text,
                },
            ],
            stream: false,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("summary endpoint returned {status}: {}", body.trim());
            // Rate limits and server errors heal on their own; other 4xx do not.
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    Error::Request(message)
                } else {
                    Error::InvalidInput(message)
                },
            );
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|summary| !summary.is_empty())
            .ok_or_else(|| Error::Request("summary endpoint returned no content".to_string()))
    }
}

/// Keep at most `max_chars` characters, cutting on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Summarizes a document's extracted text, or every document in a folder.
pub struct SummaryHandler {
    documents: Arc<dyn DocumentRepository>,
    summarizer: Arc<dyn Summarizer>,
}

impl SummaryHandler {
    pub fn new(documents: Arc<dyn DocumentRepository>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            documents,
            summarizer,
        }
    }

    async fn summarize_document(&self, ctx: &JobContext) -> JobResult {
        let doc = match load_document(self.documents.as_ref(), ctx.document_id()).await {
            Ok(doc) => doc,
            Err(outcome) => return outcome,
        };
        let text = doc.extracted_text.as_deref().unwrap_or_default().trim();
        if text.is_empty() {
            return JobResult::Failed("document has no extracted text".to_string());
        }

        ctx.report_progress(PROGRESS_PROCESSING, Some("Summarizing"));
        let summary = match self
            .summarizer
            .summarize(truncate_chars(text, SUMMARY_INPUT_MAX_CHARS))
            .await
        {
            Ok(summary) => summary,
            Err(e) => return JobResult::from_error(&e),
        };

        match self.documents.set_summary(doc.id, &summary).await {
            Ok(()) => JobResult::Success(Some(json!({ "chars": summary.chars().count() }))),
            Err(Error::DocumentNotFound(_)) => {
                JobResult::Failed(TARGET_MISSING_MESSAGE.to_string())
            }
            Err(e) => JobResult::from_error(&e),
        }
    }

    async fn summarize_folder(&self, ctx: &JobContext) -> JobResult {
        let Some(folder_id) = ctx.folder_id() else {
            return JobResult::Failed("job does not target a folder".to_string());
        };
        let docs = match self.documents.list_in_folder(folder_id).await {
            Ok(docs) => docs,
            Err(e) => return JobResult::from_error(&e),
        };
        if docs.is_empty() {
            return JobResult::Failed(TARGET_MISSING_MESSAGE.to_string());
        }

        let mut combined = String::new();
        let mut included = 0usize;
        for doc in &docs {
            let Some(text) = doc.extracted_text.as_deref().map(str::trim) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            combined.push_str(&format!("## {}\n{}\n\n", doc.filename, text));
            included += 1;
        }
        if included == 0 {
            return JobResult::Failed("folder has no extracted text".to_string());
        }

        ctx.report_progress(PROGRESS_PROCESSING, Some("Summarizing folder"));
        debug!(%folder_id, documents = included, "Summarizing folder");
        match self
            .summarizer
            .summarize(truncate_chars(&combined, SUMMARY_INPUT_MAX_CHARS))
            .await
        {
            Ok(summary) => JobResult::Success(Some(json!({
                "summary": summary,
                "documents": included,
            }))),
            Err(e) => JobResult::from_error(&e),
        }
    }
}

#[async_trait]
impl JobHandler for SummaryHandler {
    fn job_type(&self) -> JobType {
        JobType::SummaryGeneration
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        match ctx.job.target_type {
            TargetType::Document => self.summarize_document(&ctx).await,
            TargetType::Folder => self.summarize_folder(&ctx).await,
        }
    }
}
