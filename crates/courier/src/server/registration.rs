use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::connection::{Connection, ConnectionId, DraftConnection};
use super::events::{ConnectionListener, DisconnectReason};
use crate::net::{ControlMessage, Registration, sequence_greater_than};
use crate::sync::{lock, read, write};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("channel {channel} out of range, server expects {channels}")]
    ChannelOutOfRange { channel: u8, channels: usize },
    #[error("channel {channel} already bound to {existing}, refusing {endpoint}")]
    ChannelConflict {
        channel: u8,
        existing: SocketAddr,
        endpoint: SocketAddr,
    },
    #[error("{endpoint} is already registered to another client")]
    EndpointInUse { endpoint: SocketAddr },
}

#[derive(Debug, Clone)]
pub enum RegistrationOutcome {
    /// An equal or newer token from this endpoint was already processed.
    Stale,
    Pending,
    /// The endpoint already belongs to a connection with this nonce.
    Duplicate(Arc<Connection>),
    /// Name/version mismatch or server full. The draft was discarded and
    /// the reason should be sent back to the client.
    Rejected { reason: String },
    Completed(Arc<Connection>),
}

#[derive(Debug)]
struct RegistryState {
    pending: HashMap<u64, DraftConnection>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_endpoint: HashMap<SocketAddr, ConnectionId>,
    by_nonce: HashMap<u64, ConnectionId>,
    endpoint_tokens: HashMap<SocketAddr, u32>,
    next_id: ConnectionId,
}

impl Default for RegistryState {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            connections: HashMap::new(),
            by_endpoint: HashMap::new(),
            by_nonce: HashMap::new(),
            endpoint_tokens: HashMap::new(),
            next_id: 1,
        }
    }
}

impl RegistryState {
    fn release_tokens(&mut self, endpoints: impl IntoIterator<Item = SocketAddr>) {
        for endpoint in endpoints {
            let held = self.by_endpoint.contains_key(&endpoint)
                || self.pending.values().any(|draft| draft.has_endpoint(endpoint));
            if !held {
                self.endpoint_tokens.remove(&endpoint);
            }
        }
    }
}

/// Turns handshake datagrams into registered connections.
///
/// Every table mutation happens under one lock; listener callbacks and
/// control-message queuing happen after it is released.
pub struct ConnectionRegistry {
    game_name: String,
    version: u32,
    channels: usize,
    max_clients: usize,
    state: Mutex<RegistryState>,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionRegistry {
    pub fn new(
        game_name: impl Into<String>,
        version: u32,
        channels: usize,
        max_clients: usize,
    ) -> Self {
        Self {
            game_name: game_name.into(),
            version,
            channels: channels.max(1),
            max_clients,
            state: Mutex::new(RegistryState::default()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        write(&self.listeners).push(listener);
    }

    /// Processes one handshake datagram from `endpoint`. `token` orders
    /// datagrams from the same endpoint; anything not strictly newer than
    /// the last one seen is ignored.
    pub fn register(
        &self,
        endpoint: SocketAddr,
        token: u32,
        registration: &Registration,
        now: Instant,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let connection = {
            let mut state = lock(&self.state);

            if let Some(&last) = state.endpoint_tokens.get(&endpoint) {
                if !sequence_greater_than(token, last) {
                    return Ok(RegistrationOutcome::Stale);
                }
            }
            state.endpoint_tokens.insert(endpoint, token);

            if let Some(connection) = state
                .by_endpoint
                .get(&endpoint)
                .and_then(|id| state.connections.get(id))
            {
                return if connection.nonce() == registration.nonce {
                    Ok(RegistrationOutcome::Duplicate(Arc::clone(connection)))
                } else {
                    Err(RegistrationError::EndpointInUse { endpoint })
                };
            }

            if let Some(connection) = state
                .by_nonce
                .get(&registration.nonce)
                .and_then(|id| state.connections.get(id))
            {
                let channel = registration.channel;
                let err = match connection.endpoints().get(usize::from(channel)) {
                    Some(&existing) => RegistrationError::ChannelConflict {
                        channel,
                        existing,
                        endpoint,
                    },
                    None => RegistrationError::ChannelOutOfRange {
                        channel,
                        channels: self.channels,
                    },
                };
                state.release_tokens([endpoint]);
                return Err(err);
            }

            let mut draft = state
                .pending
                .remove(&registration.nonce)
                .unwrap_or_else(|| DraftConnection::new(registration.nonce, self.channels, now));

            // A violation discards the whole draft.
            if let Err(e) = draft.set_channel(registration.channel, endpoint) {
                let endpoints: Vec<_> = draft.endpoints().chain([endpoint]).collect();
                state.release_tokens(endpoints);
                return Err(e);
            }

            if registration.game_name != self.game_name || registration.version != self.version {
                let endpoints: Vec<_> = draft.endpoints().collect();
                state.release_tokens(endpoints);
                return Ok(RegistrationOutcome::Rejected {
                    reason: format!(
                        "Server client mismatch, server: {} v{}  client: {} v{}",
                        self.game_name, self.version, registration.game_name, registration.version
                    ),
                });
            }

            let endpoints = match draft.try_complete() {
                Ok(endpoints) => endpoints,
                Err(draft) => {
                    state.pending.insert(registration.nonce, draft);
                    return Ok(RegistrationOutcome::Pending);
                }
            };

            if state.connections.len() >= self.max_clients {
                state.release_tokens(endpoints.iter().copied());
                return Ok(RegistrationOutcome::Rejected {
                    reason: "Server full".to_string(),
                });
            }

            let id = state.next_id;
            state.next_id = state.next_id.wrapping_add(1).max(1);

            let connection = Arc::new(Connection::new(id, registration.nonce, endpoints, now));
            for &endpoint in connection.endpoints() {
                state.by_endpoint.insert(endpoint, id);
            }
            state.by_nonce.insert(registration.nonce, id);
            state.connections.insert(id, Arc::clone(&connection));

            connection
        };

        log::info!(
            "Client {} registered from {:?}",
            connection.id(),
            connection.endpoints()
        );

        for listener in self.listeners() {
            listener.connection_added(&connection);
        }

        connection.enqueue_control(ControlMessage::Registered {
            id: connection.id(),
        });
        connection.enqueue_control(ControlMessage::ServicesReady);

        Ok(RegistrationOutcome::Completed(connection))
    }

    /// Removes the connection and notifies listeners. Returns false if it
    /// was already gone, so each connection is reported removed once.
    pub fn close(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let connection = {
            let mut state = lock(&self.state);
            let Some(connection) = state.connections.remove(&id) else {
                return false;
            };
            for endpoint in connection.endpoints() {
                state.by_endpoint.remove(endpoint);
                state.endpoint_tokens.remove(endpoint);
            }
            state.by_nonce.remove(&connection.nonce());
            connection
        };

        connection.mark_closed();
        log::info!("Client {} disconnected ({})", id, reason);

        for listener in self.listeners() {
            listener.connection_removed(&connection, reason);
        }

        true
    }

    pub fn expire_pending(&self, now: Instant, timeout: Duration) -> usize {
        let mut state = lock(&self.state);
        let expired: Vec<u64> = state
            .pending
            .values()
            .filter(|draft| now.saturating_duration_since(draft.created()) > timeout)
            .map(DraftConnection::nonce)
            .collect();

        for nonce in &expired {
            if let Some(draft) = state.pending.remove(nonce) {
                let endpoints: Vec<_> = draft.endpoints().collect();
                state.release_tokens(endpoints);
                log::debug!("Registration {:#x} expired", nonce);
            }
        }

        expired.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        lock(&self.state).connections.get(&id).cloned()
    }

    pub fn connection_for(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        let state = lock(&self.state);
        state
            .by_endpoint
            .get(&endpoint)
            .and_then(|id| state.connections.get(id))
            .cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        lock(&self.state).connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        read(&self.listeners).clone()
    }
}
