//! PostgreSQL repository tests.
//!
//! Exercise the conditional-update SQL against a real database. Run with
//! `cargo test -p strata-db -- --ignored` and `DATABASE_URL` pointing at a
//! disposable database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use strata_db::{
    Database, DerivedStatus, DocumentRepository, JobRepository, JobStatus, JobType, NewDocument,
    NewJob, DEFAULT_TEST_DATABASE_URL, WORKER_LOST_MESSAGE,
};

async fn setup_test_db() -> Database {
    let _ = dotenvy::dotenv();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_TEST_DATABASE_URL.to_string());
    let db = Database::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to run migrations");
    db
}

fn new_document(owner_id: Uuid, content: &[u8]) -> NewDocument {
    let hash = strata_db::compute_content_hash(content);
    NewDocument {
        owner_id,
        folder_id: None,
        filename: "notes.txt".to_string(),
        mime_type: "text/plain".to_string(),
        storage_path: strata_db::storage_path_for(&hash, "txt"),
        content_hash: hash,
        size_bytes: content.len() as i64,
    }
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a disposable Postgres database
async fn test_concurrent_claims_single_winner() {
    let db = setup_test_db().await;
    let jobs = Arc::new(db.jobs.clone());
    let job = jobs
        .insert(NewJob::for_document(JobType::TextExtraction, Uuid::now_v7(), 3))
        .await
        .unwrap();

    let id = job.id;
    let mut handles = Vec::new();
    for _ in 0..8 {
        let jobs = jobs.clone();
        handles.push(tokio::spawn(async move { jobs.claim(id).await.unwrap() }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let stored = jobs.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a disposable Postgres database
async fn test_requeue_backoff_and_terminal_monotonicity() {
    let db = setup_test_db().await;
    let job = db
        .jobs
        .insert(NewJob::for_document(JobType::ThumbnailGeneration, Uuid::now_v7(), 3))
        .await
        .unwrap();

    let claimed = db.jobs.claim(job.id).await.unwrap().unwrap();
    let started_at = claimed.started_at.unwrap();

    db.jobs
        .requeue(job.id, "storage timeout", Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap()
        .unwrap();
    assert!(db.jobs.claim(job.id).await.unwrap().is_none(), "backoff not respected");

    assert!(
        db.jobs
            .requeue(job.id, "ignored", Utc::now())
            .await
            .unwrap()
            .is_none(),
        "requeue of a pending job must be a no-op"
    );

    // Simulate the backoff elapsing
    sqlx::query("UPDATE job SET run_after = NOW() WHERE id = $1")
        .bind(job.id)
        .execute(db.pool())
        .await
        .unwrap();
    let reclaimed = db.jobs.claim(job.id).await.unwrap().unwrap();
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.started_at, Some(started_at));

    let done = db
        .jobs
        .complete(job.id, Some(serde_json::json!({"path": "ab/cd/x.png"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Complete);
    assert!(done.error_message.is_none());

    assert!(db.jobs.fail(job.id, "late").await.unwrap().is_none());
    assert_eq!(
        db.jobs.get(job.id).await.unwrap().unwrap().status,
        JobStatus::Complete
    );
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a disposable Postgres database
async fn test_reclaim_stale_exhausted_job_fails() {
    let db = setup_test_db().await;
    let job = db
        .jobs
        .insert(NewJob::for_document(JobType::SummaryGeneration, Uuid::now_v7(), 1))
        .await
        .unwrap();
    db.jobs.claim(job.id).await.unwrap().unwrap();

    sqlx::query("UPDATE job SET claimed_at = NOW() - INTERVAL '2 hours' WHERE id = $1")
        .bind(job.id)
        .execute(db.pool())
        .await
        .unwrap();

    let reclaimed = db.jobs.reclaim_stale(Duration::from_secs(900)).await.unwrap();
    let ours = reclaimed.iter().find(|j| j.id == job.id).unwrap();
    assert_eq!(ours.status, JobStatus::Failed);
    assert_eq!(ours.error_message.as_deref(), Some(WORKER_LOST_MESSAGE));
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a disposable Postgres database
async fn test_document_dedup_and_storage_quota() {
    let db = setup_test_db().await;
    let owner = Uuid::now_v7();

    let doc = db
        .documents
        .insert(new_document(owner, b"pg dedup"))
        .await
        .unwrap()
        .unwrap();
    assert!(db
        .documents
        .insert(new_document(owner, b"pg dedup"))
        .await
        .unwrap()
        .is_none());
    let found = db
        .documents
        .find_by_hash(owner, &doc.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, doc.id);

    db.documents
        .set_derived_status(doc.id, JobType::TextExtraction, DerivedStatus::Pending)
        .await
        .unwrap();
    let doc = db.documents.get(doc.id).await.unwrap().unwrap();
    assert_eq!(doc.text_status, DerivedStatus::Pending);

    assert_eq!(
        db.documents.try_charge_storage(owner, 80, 100).await.unwrap(),
        Some(80)
    );
    assert_eq!(db.documents.try_charge_storage(owner, 30, 100).await.unwrap(), None);
    assert_eq!(db.documents.storage_used(owner).await.unwrap(), 80);
    db.documents.release_storage(owner, 80).await.unwrap();
    assert_eq!(db.documents.storage_used(owner).await.unwrap(), 0);
}
