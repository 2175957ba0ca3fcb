//! # strata-api
//!
//! HTTP and WebSocket surface of the strata document pipeline: uploads,
//! the job read model, and realtime job notifications.

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;

use std::sync::Arc;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::warn;
use uuid::Uuid;

use strata_core::{ContentStore, DocumentRepository, JobRepository};
use strata_jobs::IngestService;

pub use config::ServerConfig;
pub use error::ApiError;
pub use gateway::NotificationGateway;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub jobs: Arc<dyn JobRepository>,
    pub documents: Arc<dyn DocumentRepository>,
    pub store: Arc<dyn ContentStore>,
    pub gateway: Arc<NotificationGateway>,
}

#[derive(Clone, Copy)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(handlers::OWNER_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Build the application router.
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/documents", post(handlers::upload_document))
        .route("/api/v1/documents/:id", get(handlers::get_document))
        .route(
            "/api/v1/folders/:id/summary",
            post(handlers::request_folder_summary),
        )
        .route("/api/v1/jobs/status", post(handlers::batch_status))
        .route("/api/v1/jobs/:id", get(handlers::get_job))
        .route("/api/v1/ws", get(handlers::ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(cors_layer(&config.allowed_origins))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .with_state(state)
}
