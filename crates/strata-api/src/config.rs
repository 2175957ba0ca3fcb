//! Server configuration loaded from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | `postgres://localhost/strata` |
//! | `HOST` / `PORT` | `0.0.0.0` / `3000` |
//! | `ALLOWED_ORIGINS` | `http://localhost:3000` |
//! | `MAX_UPLOAD_BYTES` | 100 MiB |
//! | `STORAGE_BACKEND` | `filesystem` (or `s3`) |
//! | `STORAGE_PATH` | `./data/blobs` |
//! | `STORAGE_BASE_URL` | `http://localhost:3000/files` |
//! | `STORAGE_SIGNING_SECRET` | random per process |
//! | `S3_BUCKET` / `S3_REGION` / `S3_ENDPOINT` | required / `us-east-1` / unset |
//! | `EVENT_BUS` | `local` (or `redis`, using `REDIS_URL`) |

use std::sync::Arc;

use rand::RngCore;
use tracing::{info, warn};

use strata_core::{ContentStore, Error, EventBus, LocalEventBus, Result};
use strata_db::{FilesystemContentStore, ObjectContentStore};
use strata_jobs::bus::DEFAULT_REDIS_URL;
use strata_jobs::RedisEventBus;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/strata";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
pub const DEFAULT_STORAGE_PATH: &str = "./data/blobs";
pub const DEFAULT_STORAGE_BASE_URL: &str = "http://localhost:3000/files";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Where blobs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Filesystem {
        path: String,
        base_url: String,
        signing_secret: Vec<u8>,
    },
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        match env_or("STORAGE_BACKEND", "filesystem").to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(StorageConfig::Filesystem {
                path: env_or("STORAGE_PATH", DEFAULT_STORAGE_PATH),
                base_url: env_or("STORAGE_BASE_URL", DEFAULT_STORAGE_BASE_URL),
                signing_secret: signing_secret(env_opt("STORAGE_SIGNING_SECRET")),
            }),
            "s3" => Ok(StorageConfig::S3 {
                bucket: env_opt("S3_BUCKET").ok_or_else(|| {
                    Error::Config("S3_BUCKET is required when STORAGE_BACKEND=s3".to_string())
                })?,
                region: env_or("S3_REGION", DEFAULT_S3_REGION),
                endpoint: env_opt("S3_ENDPOINT"),
            }),
            other => Err(Error::Config(format!("unknown STORAGE_BACKEND: {other}"))),
        }
    }

    /// Build the store. The filesystem backend is probed before use.
    pub async fn build(&self) -> Result<Arc<dyn ContentStore>> {
        match self {
            StorageConfig::Filesystem {
                path,
                base_url,
                signing_secret,
            } => {
                let store =
                    FilesystemContentStore::new(path, base_url.as_str(), signing_secret.clone());
                store.validate().await?;
                info!(path = %path, "Filesystem content store ready");
                Ok(Arc::new(store))
            }
            StorageConfig::S3 {
                bucket,
                region,
                endpoint,
            } => Ok(Arc::new(ObjectContentStore::new(
                bucket,
                region,
                endpoint.as_deref(),
            )?)),
        }
    }
}

fn signing_secret(configured: Option<String>) -> Vec<u8> {
    match configured {
        Some(secret) => secret.into_bytes(),
        None => {
            warn!("STORAGE_SIGNING_SECRET not set, signed URLs will not survive a restart");
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes).into_bytes()
        }
    }
}

/// Which event bus carries job events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBusConfig {
    Local,
    Redis { url: String },
}

impl EventBusConfig {
    pub fn from_env() -> Result<Self> {
        match env_or("EVENT_BUS", "local").to_ascii_lowercase().as_str() {
            "local" => Ok(EventBusConfig::Local),
            "redis" => Ok(EventBusConfig::Redis {
                url: env_or("REDIS_URL", DEFAULT_REDIS_URL),
            }),
            other => Err(Error::Config(format!("unknown EVENT_BUS: {other}"))),
        }
    }

    pub async fn connect(&self) -> Result<Arc<dyn EventBus>> {
        match self {
            EventBusConfig::Local => {
                info!("Using in-process event bus");
                Ok(Arc::new(LocalEventBus::default()))
            }
            EventBusConfig::Redis { url } => Ok(Arc::new(RedisEventBus::connect(url).await?)),
        }
    }
}

/// Everything the binary needs besides worker and ingest settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
    pub storage: StorageConfig,
    pub event_bus: EventBusConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let port = match env_opt("PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT: {port}")))?,
            None => DEFAULT_PORT,
        };
        let max_upload_bytes = env_opt("MAX_UPLOAD_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        Ok(Self {
            database_url: env_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            host: env_or("HOST", DEFAULT_HOST),
            port,
            allowed_origins: parse_origins(&env_or("ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)),
            max_upload_bytes,
            storage: StorageConfig::from_env()?,
            event_bus: EventBusConfig::from_env()?,
        })
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}
