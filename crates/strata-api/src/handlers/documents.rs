//! Document upload and read handlers.
//!
//! Callers are authenticated upstream; the owner arrives in `X-Owner-Id`.

use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use strata_core::defaults::SIGNED_URL_TTL_SECS;
use strata_core::{
    ContentStore, Document, DocumentRepository, IngestOutcome, JobRecord, OwnerContext,
};

use crate::{ApiError, AppState};

/// Header carrying the authenticated owner id.
pub const OWNER_HEADER: &str = "x-owner-id";

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

fn owner_id(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let value = headers
        .get(OWNER_HEADER)
        .ok_or_else(|| ApiError::BadRequest("X-Owner-Id header is required".to_string()))?;
    value
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .ok_or_else(|| ApiError::BadRequest("X-Owner-Id must be a UUID".to_string()))
}

struct Upload {
    data: Vec<u8>,
    filename: String,
    mime_type: String,
}

/// Upload a document.
///
/// Multipart fields:
/// - `file` (required): the content; its filename and content type are kept
/// - `session_id` (optional): correlation id for realtime notifications
/// - `folder_id` (optional): UUID of the containing folder
///
/// # Returns
/// - 201 Created with `{document, jobs, deduplicated: false}`
/// - 200 OK with `{document, jobs: [], deduplicated: true}` for repeated content
/// - 400 Bad Request for a missing file, empty file, or malformed field
/// - 413 Payload Too Large when the owner's storage quota would be exceeded
pub async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let owner_id = owner_id(&headers)?;

    let mut upload: Option<Upload> = None;
    let mut session_id: Option<String> = None;
    let mut folder_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field
                    .content_type()
                    .unwrap_or(FALLBACK_MIME_TYPE)
                    .to_string();
                let data = field.bytes().await?.to_vec();
                upload = Some(Upload {
                    data,
                    filename,
                    mime_type,
                });
            }
            Some("session_id") => {
                let value = field.text().await?;
                let value = value.trim();
                if !value.is_empty() {
                    session_id = Some(value.to_string());
                }
            }
            Some("folder_id") => {
                let value = field.text().await?;
                let parsed = Uuid::parse_str(value.trim())
                    .map_err(|_| ApiError::BadRequest(format!("invalid folder_id: {value}")))?;
                folder_id = Some(parsed);
            }
            other => debug!(field = ?other, "Ignoring unknown multipart field"),
        }
    }

    let upload = upload.ok_or_else(|| ApiError::BadRequest("missing file field".to_string()))?;
    let owner = OwnerContext::new(owner_id)
        .with_folder(folder_id)
        .with_session(session_id);

    let outcome = state
        .ingest
        .ingest(&owner, &upload.data, &upload.filename, &upload.mime_type)
        .await?;
    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// A document with short-lived links to its content and thumbnail.
#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub document: Document,
    pub content_url: String,
    pub thumbnail_url: Option<String>,
}

/// Get a document owned by the caller.
///
/// Documents of other owners are reported as not found.
pub async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentView>, ApiError> {
    let owner_id = owner_id(&headers)?;
    let document = state
        .documents
        .get(id)
        .await?
        .filter(|document| document.owner_id == owner_id)
        .ok_or_else(|| ApiError::NotFound(format!("Document not found: {id}")))?;

    let ttl = Duration::from_secs(SIGNED_URL_TTL_SECS);
    let content_url = state.store.signed_url(&document.storage_path, ttl).await?;
    let thumbnail_url = match document.thumbnail_path.as_deref() {
        Some(path) => Some(state.store.signed_url(path, ttl).await?),
        None => None,
    };

    Ok(Json(DocumentView {
        document,
        content_url,
        thumbnail_url,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct FolderSummaryRequest {
    pub session_id: Option<String>,
}

/// Queue a summary over every document in a folder.
///
/// # Returns
/// - 202 Accepted with the created job
/// - 400 Bad Request when summaries are disabled
/// - 404 Not Found when the folder holds no documents
pub async fn request_folder_summary(
    State(state): State<AppState>,
    Path(folder_id): Path<Uuid>,
    body: Option<Json<FolderSummaryRequest>>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    let request = body.map(|Json(body)| body).unwrap_or_default();
    let job = state
        .ingest
        .request_folder_summary(folder_id, request.session_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}
