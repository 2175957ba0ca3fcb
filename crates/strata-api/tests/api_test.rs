//! HTTP and WebSocket tests against a live server on an ephemeral port,
//! backed by the in-memory repositories and a temp-dir content store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use strata_api::config::{EventBusConfig, StorageConfig};
use strata_api::{router, AppState, NotificationGateway, ServerConfig};
use strata_db::{FilesystemContentStore, InMemoryDocumentRepository, InMemoryJobRepository};
use strata_jobs::{
    HandlerSet, IngestConfig, IngestService, JobWorker, LocalEventBus, Result, Scheduler,
    Summarizer, WorkerConfig, WorkerHandle,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct EchoSummarizer;

#[async_trait::async_trait]
impl Summarizer for EchoSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(format!("summary of {} chars", text.chars().count()))
    }
}

struct TestServer {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    client: reqwest::Client,
    owner_id: Uuid,
    _worker: WorkerHandle,
}

impl TestServer {
    async fn start(ingest_config: IngestConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let jobs = Arc::new(InMemoryJobRepository::new());
        let documents = Arc::new(InMemoryDocumentRepository::new());
        let store = Arc::new(FilesystemContentStore::new(
            dir.path().join("blobs"),
            "http://localhost:3000/files",
            b"test-secret".to_vec(),
        ));
        let bus = Arc::new(LocalEventBus::new(256));
        let scheduler = Arc::new(Scheduler::new(jobs.clone()));
        let ingest = Arc::new(
            IngestService::new(documents.clone(), jobs.clone(), store.clone(), scheduler.clone())
                .with_config(ingest_config),
        );

        let handlers =
            HandlerSet::standard(documents.clone(), store.clone(), Arc::new(EchoSummarizer));
        let worker = JobWorker::new(jobs.clone(), documents.clone(), bus.clone(), scheduler, handlers)
            .with_config(
                WorkerConfig::default()
                    .with_poll_interval(20)
                    .with_summary_enabled(false),
            )
            .start();

        let gateway = Arc::new(NotificationGateway::new());
        gateway.clone().spawn(bus.as_ref());

        let config = ServerConfig {
            database_url: String::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            max_upload_bytes: 1024 * 1024,
            storage: StorageConfig::Filesystem {
                path: dir.path().join("blobs").to_string_lossy().into_owned(),
                base_url: "http://localhost:3000/files".to_string(),
                signing_secret: b"test-secret".to_vec(),
            },
            event_bus: EventBusConfig::Local,
        };
        let state = AppState {
            ingest,
            jobs,
            documents,
            store,
            gateway,
        };
        let app = router(state, &config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            _dir: dir,
            addr,
            client: reqwest::Client::new(),
            owner_id: Uuid::now_v7(),
            _worker: worker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn upload(&self, content: &[u8], filename: &str, session_id: &str) -> reqwest::Response {
        let part = Part::bytes(content.to_vec())
            .file_name(filename.to_string())
            .mime_str("text/plain")
            .unwrap();
        let form = Form::new()
            .part("file", part)
            .text("session_id", session_id.to_string());
        self.client
            .post(self.url("/api/v1/documents"))
            .header("X-Owner-Id", self.owner_id.to_string())
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    async fn socket(&self) -> Socket {
        let (socket, response) = connect_async(format!("ws://{}/api/v1/ws", self.addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 101);
        socket
    }
}

/// Next JSON text frame, skipping control frames.
async fn next_json(socket: &mut Socket) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next())
            .await
            .expect("timed out waiting for a websocket message")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_session_subscriber_sees_job_lifecycle() {
    let server = TestServer::start(IngestConfig::default()).await;
    let mut socket = server.socket().await;

    send_json(&mut socket, json!({"type": "subscribe:session", "session_id": "batch-1"})).await;
    let ack = next_json(&mut socket).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["action"], "subscribe:session");
    assert_eq!(ack["session_id"], "batch-1");

    let response = server.upload(b"hello from the websocket test", "hello.txt", "batch-1").await;
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["deduplicated"], false);
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0]["id"].as_str().unwrap().to_string();

    let mut types = Vec::new();
    loop {
        let event = next_json(&mut socket).await;
        assert_eq!(event["session_id"], "batch-1");
        assert_eq!(event["job_id"], job_id.as_str());
        let event_type = event["type"].as_str().unwrap().to_string();
        types.push(event_type.clone());
        if event_type == "job:complete" {
            assert_eq!(event["result"]["method"], "native");
            break;
        }
        assert_ne!(event_type, "job:failed", "unexpected failure: {event}");
    }
    assert_eq!(types.first().map(String::as_str), Some("job:started"));

    let job: Value = server
        .client
        .get(server.url(&format!("/api/v1/jobs/{job_id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["status"], "complete");
    assert_eq!(job["attempts"], 1);
    assert!(job["completed_at"].is_string());
}

#[tokio::test]
async fn test_batch_status_omits_unknown_ids() {
    let server = TestServer::start(IngestConfig::default()).await;
    let body: Value = server
        .upload(b"batch status content", "status.txt", "batch-2")
        .await
        .json()
        .await
        .unwrap();
    let job_id = body["jobs"][0]["id"].as_str().unwrap().to_string();
    let unknown = Uuid::now_v7().to_string();

    let response = server
        .client
        .post(server.url("/api/v1/jobs/status"))
        .json(&json!({"job_ids": [unknown, job_id]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let statuses: Vec<Value> = response.json().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["id"], job_id.as_str());
    let progress = statuses[0]["progress"].as_i64().unwrap();
    assert!([0, 50, 100].contains(&progress));
}

#[tokio::test]
async fn test_duplicate_upload_returns_existing_document() {
    let server = TestServer::start(IngestConfig::default()).await;
    let first: Value = server
        .upload(b"same bytes", "a.txt", "batch-3")
        .await
        .json()
        .await
        .unwrap();

    let response = server.upload(b"same bytes", "b.txt", "batch-3").await;
    assert_eq!(response.status(), 200);
    let second: Value = response.json().await.unwrap();
    assert_eq!(second["deduplicated"], true);
    assert_eq!(second["jobs"].as_array().unwrap().len(), 0);
    assert_eq!(second["document"]["id"], first["document"]["id"]);
}

#[tokio::test]
async fn test_upload_rejections() {
    let server = TestServer::start(IngestConfig::default().with_quota(10)).await;

    let empty = server.upload(b"", "empty.txt", "batch-4").await;
    assert_eq!(empty.status(), 400);
    let body: Value = empty.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("empty"));

    let too_big = server.upload(b"more than ten bytes", "big.txt", "batch-4").await;
    assert_eq!(too_big.status(), 413);

    let anonymous = server
        .client
        .post(server.url("/api/v1/documents"))
        .multipart(Form::new().text("session_id", "batch-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 400);

    let no_file = server
        .client
        .post(server.url("/api/v1/documents"))
        .header("X-Owner-Id", server.owner_id.to_string())
        .multipart(Form::new().text("session_id", "batch-4"))
        .send()
        .await
        .unwrap();
    assert_eq!(no_file.status(), 400);
}

#[tokio::test]
async fn test_get_document_is_owner_scoped() {
    let server = TestServer::start(IngestConfig::default()).await;
    let body: Value = server
        .upload(b"owned content", "owned.txt", "batch-5")
        .await
        .json()
        .await
        .unwrap();
    let document_id = body["document"]["id"].as_str().unwrap().to_string();
    let path = format!("/api/v1/documents/{document_id}");

    let view: Value = server
        .client
        .get(server.url(&path))
        .header("X-Owner-Id", server.owner_id.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["document"]["id"], document_id.as_str());
    let content_url = view["content_url"].as_str().unwrap();
    assert!(content_url.starts_with("http://localhost:3000/files/"));
    assert!(content_url.contains("signature="));

    let stranger = server
        .client
        .get(server.url(&path))
        .header("X-Owner-Id", Uuid::now_v7().to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), 404);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let server = TestServer::start(IngestConfig::default()).await;
    let response = server
        .client
        .get(server.url(&format!("/api/v1/jobs/{}", Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_folder_summary_requires_documents() {
    let server = TestServer::start(IngestConfig::default()).await;
    let response = server
        .client
        .post(server.url(&format!("/api/v1/folders/{}/summary", Uuid::now_v7())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_health_reports_queue() {
    let server = TestServer::start(IngestConfig::default()).await;
    let body: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["queue"]["pending"].is_i64());
}

#[tokio::test]
async fn test_bad_client_message_gets_error_reply() {
    let server = TestServer::start(IngestConfig::default()).await;
    let mut socket = server.socket().await;

    socket.send(Message::Text("refresh".to_string())).await.unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].is_string());

    let document_id = Uuid::now_v7();
    send_json(
        &mut socket,
        json!({"type": "subscribe:document", "document_id": document_id}),
    )
    .await;
    let ack = next_json(&mut socket).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["document_id"], document_id.to_string());
}
