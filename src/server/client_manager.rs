// ABOUTME: Playback client registry
// ABOUTME: Tracks clients that said hello so audio can be fanned out to them

use std::collections::HashMap;
use std::net::SocketAddr;

/// Unique client identifier
pub type ClientId = String;

/// A known playback client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedClient {
    /// Unique client identifier
    pub client_id: ClientId,
    /// Human-readable client name
    pub name: String,
    /// Where audio packets are sent
    pub addr: SocketAddr,
    /// Server time (microseconds) of the last message from this client
    pub last_seen: i64,
}

/// Registry of playback clients
///
/// Owned by the intercom on the reactor thread, so no locking is involved.
#[derive(Debug, Default)]
pub struct ClientManager {
    clients: HashMap<ClientId, ConnectedClient>,
}

impl ClientManager {
    /// Create an empty client manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a client
    ///
    /// Returns `true` if the client was not known before.
    pub fn add_client(&mut self, client: ConnectedClient) -> bool {
        let client_id = client.client_id.clone();
        let is_new = self.clients.insert(client_id.clone(), client).is_none();
        if is_new {
            log::info!("Client {} added, total clients: {}", client_id, self.client_count());
        }
        is_new
    }

    /// Remove a client from the manager
    pub fn remove_client(&mut self, client_id: &str) -> Option<ConnectedClient> {
        let client = self.clients.remove(client_id);
        if client.is_some() {
            log::info!("Client {} removed, total clients: {}", client_id, self.client_count());
        }
        client
    }

    /// Get the number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Look up a client
    pub fn get(&self, client_id: &str) -> Option<&ConnectedClient> {
        self.clients.get(client_id)
    }

    /// Iterate over all clients with a closure
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ConnectedClient),
    {
        for client in self.clients.values() {
            f(client);
        }
    }
}
