//! Live client connections and their sessions.
//!
//! The registry is owned by the process root and passed to whatever accepts
//! connections. Its map is the only state shared between sessions; no lock
//! on it is ever held across a send or a session teardown.

use crate::error::RegistryError;
use crate::protocol::ServerMessage;
use crate::session::{Session, SessionStatus};
use crate::transport::{ClientId, ClientTransport, send_message};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct Entry {
    transport: Arc<dyn ClientTransport>,
    session: Option<Arc<Session>>,
}

/// Outcome of a broadcast sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub torn_down: Vec<ClientId>,
}

/// One row of the connection listing.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub client_id: ClientId,
    pub transport_open: bool,
    pub status: Option<SessionStatus>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ClientId, Entry>>,
    limit: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that refuses new clients once `max` are registered.
    pub fn with_limit(max: usize) -> Self {
        Self {
            limit: Some(max),
            ..Self::default()
        }
    }

    pub async fn register(
        &self,
        id: ClientId,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id.to_string()));
        }
        if let Some(max) = self.limit.filter(|max| entries.len() >= *max) {
            return Err(RegistryError::AtCapacity(max));
        }
        info!(client_id = %id, "Client registered");
        entries.insert(
            id,
            Entry {
                transport,
                session: None,
            },
        );
        Ok(())
    }

    pub async fn attach_session(
        &self,
        id: &ClientId,
        session: Arc<Session>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotRegistered(id.to_string()))?;
        if entry.session.is_some() {
            return Err(RegistryError::SessionAlreadyAttached(id.to_string()));
        }
        entry.session = Some(session);
        Ok(())
    }

    /// Removes the client, stops its session, if any, then closes its
    /// transport. Returns whether this call removed the client.
    ///
    /// The entry leaves the map before any teardown, so of several
    /// concurrent calls exactly one tears the client down.
    pub async fn unregister(&self, id: &ClientId) -> bool {
        let Some(entry) = self.entries.write().await.remove(id) else {
            return false;
        };
        if let Some(session) = entry.session {
            session.stop().await;
        }
        entry.transport.close().await;
        info!(client_id = %id, "Client unregistered");
        true
    }

    /// Sends `message` to one client. Returns false if the client is unknown,
    /// its transport is closed or the send failed.
    pub async fn send(&self, id: &ClientId, message: &ServerMessage) -> bool {
        let transport = match self.entries.read().await.get(id) {
            Some(entry) => entry.transport.clone(),
            None => return false,
        };
        if !transport.is_open() {
            return false;
        }
        match send_message(transport.as_ref(), message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id = %id, error = %e, "Failed to send to client");
                false
            }
        }
    }

    /// Sends `message` to every registered client. Clients that cannot be
    /// written to are torn down once the whole sweep is done.
    pub async fn broadcast(&self, message: &Value) -> BroadcastReport {
        let text = message.to_string();
        let targets: Vec<(ClientId, Arc<dyn ClientTransport>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.transport.clone()))
            .collect();

        let mut report = BroadcastReport {
            attempted: targets.len(),
            ..Default::default()
        };
        for (id, transport) in targets {
            if !transport.is_open() {
                debug!(client_id = %id, "Skipping closed transport");
                report.torn_down.push(id);
                continue;
            }
            match transport.send(&text).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(client_id = %id, error = %e, "Broadcast delivery failed");
                    report.torn_down.push(id);
                }
            }
        }

        for id in &report.torn_down {
            self.unregister(id).await;
        }
        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            torn_down = report.torn_down.len(),
            "Broadcast complete"
        );
        report
    }

    /// Snapshots every client, ordered by id.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut rows: Vec<(ClientId, bool, Option<Arc<Session>>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.transport.is_open(), entry.session.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));

        let mut connections = Vec::with_capacity(rows.len());
        for (client_id, transport_open, session) in rows {
            let status = match session {
                Some(session) => Some(session.get_status().await),
                None => None,
            };
            connections.push(ConnectionInfo {
                client_id,
                transport_open,
                status,
            });
        }
        connections
    }

    pub async fn session(&self, id: &ClientId) -> Option<Arc<Session>> {
        self.entries
            .read()
            .await
            .get(id)
            .and_then(|entry| entry.session.clone())
    }

    /// Unregisters every client. Returns how many were torn down.
    pub async fn shutdown_all(&self) -> usize {
        let ids: Vec<ClientId> = self.entries.read().await.keys().cloned().collect();
        let mut torn_down = 0;
        for id in &ids {
            if self.unregister(id).await {
                torn_down += 1;
            }
        }
        info!(torn_down, "All clients shut down");
        torn_down
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, id: &ClientId) -> bool {
        self.entries.read().await.contains_key(id)
    }
}
