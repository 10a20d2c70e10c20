use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::connection::{Connection, ConnectionId};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    Graceful,
    /// Nothing heard from the peer within the liveness timeout.
    Timeout,
    Kicked,
    /// The unconfirmed history outgrew a single datagram.
    Oversized,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graceful => "graceful",
            Self::Timeout => "timeout",
            Self::Kicked => "kicked",
            Self::Oversized => "oversized",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        client_id: ConnectionId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: ConnectionId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    ProtocolViolation {
        addr: SocketAddr,
        message: String,
    },
}

/// Notified when a connection completes registration or goes away.
/// Callbacks run on whichever thread caused the change, never under the
/// registry lock.
pub trait ConnectionListener: Send + Sync {
    fn connection_added(&self, _connection: &Arc<Connection>) {}

    fn connection_removed(&self, _connection: &Arc<Connection>, _reason: DisconnectReason) {}
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<ServerEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: ServerEvent) {
        lock(&self.events).push_back(event);
    }

    pub fn drain(&self) -> Vec<ServerEvent> {
        lock(&self.events).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConnectionListener for EventQueue {
    fn connection_added(&self, connection: &Arc<Connection>) {
        self.push(ServerEvent::ClientConnected {
            client_id: connection.id(),
            addr: connection.address(),
        });
    }

    fn connection_removed(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        self.push(ServerEvent::ClientDisconnected {
            client_id: connection.id(),
            reason,
        });
    }
}
