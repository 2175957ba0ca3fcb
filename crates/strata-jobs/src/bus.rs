//! Redis pub/sub event bus for deployments with several processes.
//!
//! Events are published as JSON on one channel. A listener task relays
//! every message, including this process's own, into a local broadcast
//! channel, so subscribers see each event exactly once.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use strata_core::defaults::{EVENT_BUS_CHANNEL, EVENT_BUS_RECONNECT_SECS};
use strata_core::{Error, EventBus, JobEvent, LocalEventBus, Result};

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

fn bus_error(e: redis::RedisError) -> Error {
    Error::Bus(e.to_string())
}

/// Decode a relayed payload. Malformed messages are logged and skipped.
fn decode_event(payload: &str) -> Option<JobEvent> {
    match serde_json::from_str(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Discarding malformed job event");
            None
        }
    }
}

/// Event bus backed by Redis pub/sub.
pub struct RedisEventBus {
    connection: ConnectionManager,
    local: LocalEventBus,
    channel: String,
    listener: JoinHandle<()>,
}

impl RedisEventBus {
    /// Connect and start relaying events from the default channel.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_channel(redis_url, EVENT_BUS_CHANNEL).await
    }

    /// Connect using `REDIS_URL`.
    pub async fn from_env() -> Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::connect(&redis_url).await
    }

    pub async fn connect_with_channel(redis_url: &str, channel: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(bus_error)?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(bus_error)?;
        let local = LocalEventBus::default();
        let listener = tokio::spawn(listen(client, channel.to_string(), local.clone()));

        info!(
            channel,
            url = %redact_url(redis_url),
            "Redis event bus connected"
        );
        Ok(Self {
            connection,
            local,
            channel: channel.to_string(),
            listener,
        })
    }
}

/// Mask the password in a connection URL, keeping scheme, user, and host.
fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://").map(|i| i + 3) else {
        return url.to_string();
    };
    let authority_end = url[scheme_end..]
        .find('/')
        .map_or(url.len(), |i| scheme_end + i);
    let Some(at) = url[scheme_end..authority_end].rfind('@').map(|i| scheme_end + i) else {
        return url.to_string();
    };
    match url[scheme_end..at].find(':') {
        Some(colon) => format!("{}:***{}", &url[..scheme_end + colon], &url[at..]),
        None => url.to_string(),
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        let mut connection = self.connection.clone();
        let receivers: i64 = connection
            .publish(&self.channel, payload)
            .await
            .map_err(bus_error)?;
        debug!(
            event_type = event.event_type.as_str(),
            job_id = %event.job_id,
            receivers,
            "Published job event"
        );
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.local.subscribe()
    }
}

/// Relay the channel into `local` forever, reconnecting after failures.
async fn listen(client: redis::Client, channel: String, local: LocalEventBus) {
    loop {
        match relay(&client, &channel, &local).await {
            Ok(()) => warn!(%channel, "Redis subscription closed, reconnecting"),
            Err(e) => warn!(error = %e, %channel, "Redis subscription failed, reconnecting"),
        }
        tokio::time::sleep(Duration::from_secs(EVENT_BUS_RECONNECT_SECS)).await;
    }
}

async fn relay(
    client: &redis::Client,
    channel: &str,
    local: &LocalEventBus,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!(channel, "Subscribed to job events");

    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unreadable job event payload");
                continue;
            }
        };
        if let Some(event) = decode_event(&payload) {
            local.emit(event);
        }
    }
    Ok(())
}
