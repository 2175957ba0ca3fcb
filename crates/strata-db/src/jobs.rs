//! Job repository implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use strata_core::{new_v7, Error, Job, JobRepository, JobType, NewJob, QueueStats, Result};

/// Error recorded on jobs reclaimed from a dead worker.
pub const WORKER_LOST_MESSAGE: &str = "worker lost before completion";

const JOB_COLUMNS: &str = "id, job_type::text AS job_type, target_type::text AS target_type, \
     target_id, status::text AS status, priority, attempts, max_attempts, error_message, \
     result, progress, session_id, run_after, claimed_at, created_at, started_at, completed_at";

/// PostgreSQL implementation of JobRepository.
///
/// Claims and outcome updates are single conditional `UPDATE ... RETURNING`
/// statements; a row that no longer matches the expected status yields
/// `None` instead of an error.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &sqlx::postgres::PgRow) -> Result<Job> {
        Ok(Job {
            id: row.get("id"),
            job_type: row.get::<String, _>("job_type").parse()?,
            target_type: row.get::<String, _>("target_type").parse()?,
            target_id: row.get("target_id"),
            status: row.get::<String, _>("status").parse()?,
            priority: row.get("priority"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            error_message: row.get("error_message"),
            result: row.get("result"),
            progress: row.get("progress"),
            session_id: row.get("session_id"),
            run_after: row.get("run_after"),
            claimed_at: row.get("claimed_at"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn parse_optional(row: Option<sqlx::postgres::PgRow>) -> Result<Option<Job>> {
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    fn parse_all(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Job>> {
        rows.iter().map(Self::parse_job_row).collect()
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO job (id, job_type, target_type, target_id, status, priority, attempts,
                              max_attempts, session_id, run_after, created_at)
             VALUES ($1, $2::job_type, $3::job_target, $4, 'pending'::job_status, $5, 0, $6, $7, $8, $8)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(job.job_type.as_str())
        .bind(job.target_type.as_str())
        .bind(job.target_id)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(&job.session_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(&row)
    }

    async fn claim(&self, job_id: Uuid) -> Result<Option<Job>> {
        // Row-level conditional update: concurrent claimants re-check the
        // WHERE clause after the first one commits, so only one wins.
        let row = sqlx::query(&format!(
            "UPDATE job
             SET status = 'processing'::job_status,
                 attempts = attempts + 1,
                 claimed_at = $2,
                 started_at = COALESCE(started_at, $2),
                 progress = NULL
             WHERE id = $1
               AND status = 'pending'::job_status
               AND run_after <= $2
               AND attempts < max_attempts
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_optional(row)
    }

    async fn list_due(&self, job_type: JobType, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job
             WHERE job_type = $1::job_type
               AND status = 'pending'::job_status
               AND run_after <= $2
               AND attempts < max_attempts
             ORDER BY priority DESC, created_at ASC
             LIMIT $3"
        ))
        .bind(job_type.as_str())
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_all(rows)
    }

    async fn complete(&self, job_id: Uuid, result: Option<JsonValue>) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE job
             SET status = 'complete'::job_status, result = $2, progress = 100,
                 error_message = NULL, completed_at = $3, claimed_at = NULL
             WHERE id = $1 AND status = 'processing'::job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(&result)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_optional(row)
    }

    async fn requeue(
        &self,
        job_id: Uuid,
        error: &str,
        run_after: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE job
             SET status = 'pending'::job_status, error_message = $2, run_after = $3,
                 claimed_at = NULL, progress = NULL
             WHERE id = $1 AND status = 'processing'::job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(error)
        .bind(run_after)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_optional(row)
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE job
             SET status = 'failed'::job_status, error_message = $2,
                 completed_at = $3, claimed_at = NULL
             WHERE id = $1 AND status = 'processing'::job_status
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_optional(row)
    }

    async fn update_progress(&self, job_id: Uuid, percent: i32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job SET progress = $2
             WHERE id = $1 AND status = 'processing'::job_status",
        )
        .bind(job_id)
        .bind(percent.clamp(0, 100))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_stale(&self, liveness: Duration) -> Result<Vec<Job>> {
        let now = Utc::now();
        let liveness = chrono::Duration::from_std(liveness)
            .map_err(|e| Error::Config(format!("liveness window out of range: {e}")))?;

        let rows = sqlx::query(&format!(
            "UPDATE job
             SET status = CASE WHEN attempts < max_attempts
                               THEN 'pending'::job_status
                               ELSE 'failed'::job_status END,
                 completed_at = CASE WHEN attempts < max_attempts
                                     THEN NULL
                                     ELSE $1::timestamptz END,
                 error_message = $2,
                 run_after = $1,
                 claimed_at = NULL,
                 progress = NULL
             WHERE status = 'processing'::job_status AND claimed_at < $3
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now)
        .bind(WORKER_LOST_MESSAGE)
        .bind(now - liveness)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_all(rows)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        Self::parse_optional(row)
    }

    async fn get_many(&self, job_ids: &[Uuid]) -> Result<Vec<Job>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE id = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(job_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_all(rows)
    }

    async fn list_for_target(&self, target_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE target_id = $1 ORDER BY created_at ASC"
        ))
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_all(rows)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'complete' AND completed_at > NOW() - INTERVAL '1 hour') as completed_last_hour,
                COUNT(*) FILTER (WHERE status = 'failed' AND completed_at > NOW() - INTERVAL '1 hour') as failed_last_hour,
                COUNT(*) as total
             FROM job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get::<i64, _>("pending"),
            processing: row.get::<i64, _>("processing"),
            completed_last_hour: row.get::<i64, _>("completed_last_hour"),
            failed_last_hour: row.get::<i64, _>("failed_last_hour"),
            total: row.get::<i64, _>("total"),
        })
    }
}
