use std::sync::Arc;
use std::time::Instant;

use courier::server::ServerSender;
use courier::{
    Command, CommandHandler, Connection, ConnectionId, ConnectionListener, DisconnectReason,
    PeerSet,
};

pub const WELCOME: u16 = 0;
pub const HEARTBEAT: u16 = 2;

const JOINED_AT: &str = "joined_at";

/// Forwards every application command to all other connected peers,
/// keeping its reliability.
pub struct Relay {
    sender: Arc<ServerSender>,
}

impl Relay {
    pub fn new(sender: Arc<ServerSender>) -> Self {
        Self { sender }
    }

    fn forward(&self, source: ConnectionId, command: &Command) {
        for peer in self.sender.peers().peers() {
            if peer != source {
                self.sender.enqueue(peer, command.clone());
            }
        }
    }
}

impl CommandHandler<ConnectionId> for Relay {
    fn on_guaranteed(&self, source: ConnectionId, command: &Command) {
        log::debug!(
            "Client {} sent {} bytes (kind {:?})",
            source,
            command.payload().len(),
            command.kind()
        );
        self.forward(source, command);
    }

    fn on_unreliable(&self, source: ConnectionId, command: &Command) {
        if command.confirmed_order_number().is_none() {
            self.forward(source, command);
        }
    }
}

/// Greets new clients and reports how long they stayed.
pub struct Greeter {
    sender: Arc<ServerSender>,
}

impl Greeter {
    pub fn new(sender: Arc<ServerSender>) -> Self {
        Self { sender }
    }
}

impl ConnectionListener for Greeter {
    fn connection_added(&self, connection: &Arc<Connection>) {
        connection.set_attribute(JOINED_AT, Instant::now());
        let message = format!("Welcome, client {}", connection.id());
        self.sender
            .enqueue(connection.id(), Command::guaranteed(WELCOME, message.into_bytes()));
    }

    fn connection_removed(&self, connection: &Arc<Connection>, reason: DisconnectReason) {
        if let Some(joined) = connection.attribute::<Instant>(JOINED_AT) {
            log::info!(
                "Client {} left after {:.1}s ({})",
                connection.id(),
                joined.elapsed().as_secs_f32(),
                reason
            );
        }
    }
}
