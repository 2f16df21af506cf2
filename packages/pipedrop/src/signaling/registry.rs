//! Connection Registry
//!
//! Maps each live signaling identity to the outbound queue of its connection.
//! Every membership change is followed by a `list` broadcast computed under
//! the same lock, so no client ever observes a stale or duplicated set.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use super::protocol::{ClientIdentity, ControlMessage, Outbound};

/// Outbound queue of one signaling connection.
pub type ClientSender = mpsc::Sender<Outbound>;

/// Attempts at a random identity before falling back to a uuid-based one.
const RANDOM_IDENTITY_ATTEMPTS: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("identity already registered: {0}")]
    IdentityTaken(ClientIdentity),
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    clients: Arc<RwLock<HashMap<ClientIdentity, ClientSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` and broadcast the new membership.
    pub async fn register(&self, id: ClientIdentity, tx: ClientSender) -> Result<(), RegistryError> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&id) {
            return Err(RegistryError::IdentityTaken(id));
        }
        clients.insert(id, tx);
        broadcast_locked(&clients);
        Ok(())
    }

    /// Register under `preferred`, or a fresh identity if that one is live,
    /// queue the `welcome` for the new client, then broadcast. The welcome is
    /// queued before the list so the client learns its own name first.
    pub async fn admit(&self, preferred: ClientIdentity, tx: ClientSender) -> ClientIdentity {
        let mut clients = self.clients.write().await;

        let mut id = preferred;
        let mut attempts = 0;
        while clients.contains_key(&id) {
            id = if attempts < RANDOM_IDENTITY_ATTEMPTS {
                ClientIdentity::random()
            } else {
                ClientIdentity::new(format!("User-{}", uuid::Uuid::new_v4().simple()))
            };
            attempts += 1;
        }

        if tx
            .try_send(ControlMessage::Welcome { id: id.clone() }.into())
            .is_err()
        {
            warn!(client = %id, "Failed to queue welcome message");
        }
        clients.insert(id.clone(), tx);
        broadcast_locked(&clients);
        id
    }

    /// Remove `id` and broadcast if it was present.
    pub async fn unregister(&self, id: &ClientIdentity) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id).is_some();
        if removed {
            broadcast_locked(&clients);
        }
        removed
    }

    pub async fn lookup(&self, id: &str) -> Option<ClientSender> {
        self.clients.read().await.get(id).cloned()
    }

    /// Queue `msg` for `id`. Returns false when the identity is unknown or its
    /// queue cannot take the message.
    pub async fn send_to(&self, id: &str, msg: impl Into<Outbound>) -> bool {
        let clients = self.clients.read().await;
        match clients.get(id) {
            Some(tx) => match tx.try_send(msg.into()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(client = %id, "Dropping message for slow or closed client: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    /// Send the current identity set to every registered client.
    /// Returns how many queues accepted it.
    pub async fn broadcast(&self) -> usize {
        let clients = self.clients.read().await;
        broadcast_locked(&clients)
    }

    /// Sorted snapshot of the live identities.
    pub async fn identities(&self) -> Vec<ClientIdentity> {
        snapshot(&*self.clients.read().await)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

fn snapshot(clients: &HashMap<ClientIdentity, ClientSender>) -> Vec<ClientIdentity> {
    let mut users: Vec<ClientIdentity> = clients.keys().cloned().collect();
    users.sort();
    users
}

/// Caller holds the registry lock. A failing peer is skipped; its own read
/// loop notices the broken socket and unregisters it.
fn broadcast_locked(clients: &HashMap<ClientIdentity, ClientSender>) -> usize {
    let users = snapshot(clients);
    let mut delivered = 0;
    for (id, tx) in clients {
        let list = ControlMessage::List {
            users: users.clone(),
        };
        match tx.try_send(list.into()) {
            Ok(()) => delivered += 1,
            Err(e) => debug!(client = %id, "Skipping list broadcast: {}", e),
        }
    }
    delivered
}
