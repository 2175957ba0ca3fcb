//! Notification gateway: routes job events to connected clients.
//!
//! Clients join session groups (all jobs of one upload batch) and document
//! groups (all jobs of one document). An event goes to the members of its
//! session group and its document group, once per connection. When neither
//! group has a member the event is broadcast to every connection.
//!
//! Each connection owns a bounded outbound queue drained by its own delivery
//! loop. A full queue drops the message for that connection only.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::defaults::GATEWAY_CONNECTION_QUEUE;
use strata_core::{EventBus, JobEvent};

/// Identifier of one client connection, unique within a gateway.
pub type ConnectionId = u64;

#[derive(Default)]
struct Membership {
    sessions: HashSet<String>,
    documents: HashSet<Uuid>,
}

struct Connection {
    tx: mpsc::Sender<String>,
    membership: Membership,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    sessions: HashMap<String, HashSet<ConnectionId>>,
    documents: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Registry {
    /// Connections that should receive `event`.
    fn recipients(&self, event: &JobEvent) -> BTreeSet<ConnectionId> {
        let mut targets = BTreeSet::new();
        if let Some(members) = event
            .session_id
            .as_ref()
            .and_then(|session_id| self.sessions.get(session_id))
        {
            targets.extend(members.iter().copied());
        }
        if let Some(members) = event
            .document_id
            .and_then(|document_id| self.documents.get(&document_id))
        {
            targets.extend(members.iter().copied());
        }
        if targets.is_empty() {
            targets.extend(self.connections.keys().copied());
        }
        targets
    }

    fn leave_all(&mut self, id: ConnectionId, membership: Membership) {
        for session_id in membership.sessions {
            remove_member(&mut self.sessions, &session_id, id);
        }
        for document_id in membership.documents {
            remove_member(&mut self.documents, &document_id, id);
        }
    }
}

/// Drop `id` from a group, dropping the group once it is empty.
fn remove_member<K>(groups: &mut HashMap<K, HashSet<ConnectionId>>, key: &K, id: ConnectionId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(members) = groups.get_mut(key) {
        members.remove(&id);
        if members.is_empty() {
            groups.remove(key);
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The connection's queue was full; the message was dropped.
    Dropped,
    /// The connection is gone.
    Closed,
}

/// Group membership and fan-out for client connections.
pub struct NotificationGateway {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for NotificationGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationGateway {
    pub fn new() -> Self {
        Self::with_queue_capacity(GATEWAY_CONNECTION_QUEUE)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection. The receiver yields serialized messages for it.
    pub async fn connect(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut registry = self.registry.write().await;
        registry.connections.insert(
            id,
            Connection {
                tx,
                membership: Membership::default(),
            },
        );
        debug!(connection_id = id, active = registry.connections.len(), "Gateway connection registered");
        (id, rx)
    }

    /// Remove a connection and all its group memberships.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut registry = self.registry.write().await;
        if let Some(connection) = registry.connections.remove(&id) {
            registry.leave_all(id, connection.membership);
            debug!(connection_id = id, active = registry.connections.len(), "Gateway connection removed");
        }
    }

    /// Join a session group. Returns false for unknown connections.
    pub async fn join_session(&self, id: ConnectionId, session_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let Some(connection) = registry.connections.get_mut(&id) else {
            return false;
        };
        connection.membership.sessions.insert(session_id.to_string());
        registry
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id);
        true
    }

    /// Leave a session group. Returns whether the connection was a member.
    pub async fn leave_session(&self, id: ConnectionId, session_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(&id)
            .is_some_and(|connection| connection.membership.sessions.remove(session_id));
        if was_member {
            remove_member(&mut registry.sessions, &session_id.to_string(), id);
        }
        was_member
    }

    /// Join a document group. Returns false for unknown connections.
    pub async fn join_document(&self, id: ConnectionId, document_id: Uuid) -> bool {
        let mut registry = self.registry.write().await;
        let Some(connection) = registry.connections.get_mut(&id) else {
            return false;
        };
        connection.membership.documents.insert(document_id);
        registry.documents.entry(document_id).or_default().insert(id);
        true
    }

    /// Leave a document group. Returns whether the connection was a member.
    pub async fn leave_document(&self, id: ConnectionId, document_id: Uuid) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(&id)
            .is_some_and(|connection| connection.membership.documents.remove(&document_id));
        if was_member {
            remove_member(&mut registry.documents, &document_id, id);
        }
        was_member
    }

    /// Queue a message for one connection.
    pub async fn send_to(&self, id: ConnectionId, message: String) -> Delivery {
        let registry = self.registry.read().await;
        match registry.connections.get(&id) {
            Some(connection) => deliver(id, &connection.tx, message),
            None => Delivery::Closed,
        }
    }

    /// Route one event. Returns the number of connections it was queued for.
    pub async fn route(&self, event: &JobEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, job_id = %event.job_id, "Failed to serialize job event");
                return 0;
            }
        };

        let registry = self.registry.read().await;
        let mut queued = 0;
        for id in registry.recipients(event) {
            let Some(connection) = registry.connections.get(&id) else {
                continue;
            };
            if deliver(id, &connection.tx, payload.clone()) == Delivery::Queued {
                queued += 1;
            }
        }
        debug!(
            event_type = event.event_type.as_str(),
            job_id = %event.job_id,
            queued,
            "Job event routed"
        );
        queued
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Number of live session and document groups.
    pub async fn group_counts(&self) -> (usize, usize) {
        let registry = self.registry.read().await;
        (registry.sessions.len(), registry.documents.len())
    }

    /// Route every event from `bus` until the bus closes.
    pub fn spawn(self: Arc<Self>, bus: &dyn EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            info!("Notification gateway started");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.route(&event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Notification gateway lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Notification gateway stopped");
        })
    }
}

fn deliver(id: ConnectionId, tx: &mpsc::Sender<String>, message: String) -> Delivery {
    match tx.try_send(message) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(connection_id = id, "Outbound queue full, dropping message");
            Delivery::Dropped
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
    }
}
