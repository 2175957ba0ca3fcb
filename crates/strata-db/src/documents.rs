//! Document repository and per-owner storage usage counters.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{
    new_v7, DerivedStatus, Document, DocumentRepository, Error, JobType, NewDocument, Result,
};

const DOCUMENT_COLUMNS: &str = "id, owner_id, folder_id, filename, mime_type, content_hash, \
     storage_path, size_bytes, text_status::text AS text_status, \
     thumbnail_status::text AS thumbnail_status, summary_status::text AS summary_status, \
     extracted_text, thumbnail_path, summary, created_at, updated_at";

/// PostgreSQL implementation of DocumentRepository.
#[derive(Clone)]
pub struct PgDocumentRepository {
    pool: Pool<Postgres>,
}

impl PgDocumentRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_document_row(row: &sqlx::postgres::PgRow) -> Result<Document> {
        Ok(Document {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            folder_id: row.get("folder_id"),
            filename: row.get("filename"),
            mime_type: row.get("mime_type"),
            content_hash: row.get("content_hash"),
            storage_path: row.get("storage_path"),
            size_bytes: row.get("size_bytes"),
            text_status: row.get::<String, _>("text_status").parse()?,
            thumbnail_status: row.get::<String, _>("thumbnail_status").parse()?,
            summary_status: row.get::<String, _>("summary_status").parse()?,
            extracted_text: row.get("extracted_text"),
            thumbnail_path: row.get("thumbnail_path"),
            summary: row.get("summary"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn status_column(job_type: JobType) -> &'static str {
        match job_type {
            JobType::TextExtraction => "text_status",
            JobType::ThumbnailGeneration => "thumbnail_status",
            JobType::SummaryGeneration => "summary_status",
        }
    }

    /// Overwrite a single nullable text column.
    async fn set_text_column(&self, id: Uuid, column: &'static str, value: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE document SET {column} = $2, updated_at = $3 WHERE id = $1"
        ))
        .bind(id)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn find_by_hash(&self, owner_id: Uuid, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM document WHERE owner_id = $1 AND content_hash = $2"
        ))
        .bind(owner_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_document_row).transpose()
    }

    async fn insert(&self, doc: NewDocument) -> Result<Option<Document>> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO document (id, owner_id, folder_id, filename, mime_type, content_hash,
                                   storage_path, size_bytes, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
             ON CONFLICT (owner_id, content_hash) DO NOTHING
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(doc.owner_id)
        .bind(doc.folder_id)
        .bind(&doc.filename)
        .bind(&doc.mime_type)
        .bind(&doc.content_hash)
        .bind(&doc.storage_path)
        .bind(doc.size_bytes)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_document_row).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM document WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_document_row).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM document WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_in_folder(&self, folder_id: Uuid) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM document WHERE folder_id = $1 ORDER BY created_at ASC"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_document_row).collect()
    }

    async fn set_derived_status(
        &self,
        id: Uuid,
        job_type: JobType,
        status: DerivedStatus,
    ) -> Result<()> {
        let column = Self::status_column(job_type);
        let result = sqlx::query(&format!(
            "UPDATE document SET {column} = $2::derived_status, updated_at = $3 WHERE id = $1"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(id));
        }
        Ok(())
    }

    async fn set_extracted_text(&self, id: Uuid, text: &str) -> Result<()> {
        self.set_text_column(id, "extracted_text", text).await
    }

    async fn set_thumbnail(&self, id: Uuid, path: &str) -> Result<()> {
        self.set_text_column(id, "thumbnail_path", path).await
    }

    async fn set_summary(&self, id: Uuid, summary: &str) -> Result<()> {
        self.set_text_column(id, "summary", summary).await
    }

    async fn try_charge_storage(
        &self,
        owner_id: Uuid,
        bytes: i64,
        quota: i64,
    ) -> Result<Option<i64>> {
        if bytes > quota {
            return Ok(None);
        }
        // Single-statement check-and-increment; the conflict branch only
        // applies when the sum stays within quota.
        let used: Option<i64> = sqlx::query_scalar(
            "INSERT INTO storage_usage (owner_id, used_bytes, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (owner_id) DO UPDATE
                 SET used_bytes = storage_usage.used_bytes + EXCLUDED.used_bytes,
                     updated_at = NOW()
                 WHERE storage_usage.used_bytes + EXCLUDED.used_bytes <= $3
             RETURNING used_bytes",
        )
        .bind(owner_id)
        .bind(bytes)
        .bind(quota)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(used)
    }

    async fn add_storage_used(&self, owner_id: Uuid, bytes: i64) -> Result<i64> {
        let used: i64 = sqlx::query_scalar(
            "INSERT INTO storage_usage (owner_id, used_bytes, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (owner_id) DO UPDATE
                 SET used_bytes = storage_usage.used_bytes + EXCLUDED.used_bytes,
                     updated_at = NOW()
             RETURNING used_bytes",
        )
        .bind(owner_id)
        .bind(bytes)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(used)
    }

    async fn release_storage(&self, owner_id: Uuid, bytes: i64) -> Result<()> {
        sqlx::query(
            "UPDATE storage_usage
             SET used_bytes = GREATEST(used_bytes - $2, 0), updated_at = NOW()
             WHERE owner_id = $1",
        )
        .bind(owner_id)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn storage_used(&self, owner_id: Uuid) -> Result<i64> {
        let used: Option<i64> =
            sqlx::query_scalar("SELECT used_bytes FROM storage_usage WHERE owner_id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(used.unwrap_or(0))
    }
}
