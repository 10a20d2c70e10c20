use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use super::connection::{Connection, ConnectionId, ControlAcceptance};
use super::events::{DisconnectReason, EventQueue, ServerEvent};
use super::registration::{ConnectionRegistry, RegistrationOutcome};
use crate::clock::Clock;
use crate::net::{
    Codec, ControlFrame, ControlMessage, DatagramHandler, Packet, PacketHeader, PacketType,
    Registration, Transport, send_packet,
};
use crate::session::{EnvelopeOutcome, Receiver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Undecodable, or wrong magic/version.
    Malformed,
    /// Not a handshake, and no connection owns the endpoint.
    Unknown,
    Registered(ConnectionId),
    Pending,
    Rejected,
    Violation,
    /// Stale or duplicate traffic that needed no action.
    Ignored,
    Control { accepted: bool },
    Envelope(EnvelopeOutcome),
    Closed(DisconnectReason),
}

/// Entry point for every inbound datagram on the server.
pub struct DispatchRouter {
    registry: Arc<ConnectionRegistry>,
    receiver: Arc<Receiver<ConnectionId>>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    events: Arc<EventQueue>,
}

impl DispatchRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        receiver: Arc<Receiver<ConnectionId>>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
        events: Arc<EventQueue>,
    ) -> Self {
        Self {
            registry,
            receiver,
            transport,
            codec,
            clock,
            events,
        }
    }

    pub fn route(&self, endpoint: SocketAddr, bytes: &[u8]) -> Routed {
        let packet = match self.codec.decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed datagram from {}: {}", endpoint, e);
                return Routed::Malformed;
            }
        };

        if !packet.header.is_valid() {
            log::debug!("Dropping datagram with bad header from {}", endpoint);
            return Routed::Malformed;
        }

        let now = self.clock.now();

        match packet.payload {
            PacketType::Register(registration) => {
                self.route_registration(endpoint, packet.header.sequence, &registration, now)
            }
            PacketType::Control(frame) => match self.lookup(endpoint, now) {
                Some(connection) => self.route_control(&connection, &frame),
                None => Routed::Unknown,
            },
            PacketType::Envelope(envelope) => match self.lookup(endpoint, now) {
                Some(connection) => {
                    let mut inbound = connection.lock_inbound();
                    Routed::Envelope(self.receiver.on_envelope(
                        connection.id(),
                        &mut inbound,
                        &envelope,
                    ))
                }
                None => Routed::Unknown,
            },
            PacketType::Disconnect => match self.lookup(endpoint, now) {
                Some(connection) => {
                    self.registry.close(connection.id(), DisconnectReason::Graceful);
                    Routed::Closed(DisconnectReason::Graceful)
                }
                None => Routed::Unknown,
            },
        }
    }

    fn lookup(&self, endpoint: SocketAddr, now: Instant) -> Option<Arc<Connection>> {
        let connection = self.registry.connection_for(endpoint);
        match &connection {
            Some(connection) => connection.touch(now),
            None => log::trace!("Datagram from unregistered endpoint {}", endpoint),
        }
        connection
    }

    fn route_registration(
        &self,
        endpoint: SocketAddr,
        token: u32,
        registration: &Registration,
        now: Instant,
    ) -> Routed {
        match self.registry.register(endpoint, token, registration, now) {
            Ok(RegistrationOutcome::Completed(connection)) => Routed::Registered(connection.id()),
            Ok(RegistrationOutcome::Pending) => Routed::Pending,
            Ok(RegistrationOutcome::Stale) => Routed::Ignored,
            Ok(RegistrationOutcome::Duplicate(connection)) => {
                connection.touch(now);
                Routed::Ignored
            }
            Ok(RegistrationOutcome::Rejected { reason }) => {
                log::warn!("Registration from {} rejected: {}", endpoint, reason);
                self.events.push(ServerEvent::ConnectionDenied {
                    addr: endpoint,
                    reason: reason.clone(),
                });
                // No connection exists to retransmit from, so this is sent once.
                let kick = ControlFrame::new(0, ControlMessage::Kick { reason }, false);
                let packet = Packet::new(PacketHeader::new(0), PacketType::Control(kick));
                if let Err(e) =
                    send_packet(self.transport.as_ref(), self.codec.as_ref(), &packet, endpoint)
                {
                    log::debug!("Failed to notify {} of rejection: {}", endpoint, e);
                }
                Routed::Rejected
            }
            Err(e) => {
                log::warn!("Protocol violation from {}: {}", endpoint, e);
                self.events.push(ServerEvent::ProtocolViolation {
                    addr: endpoint,
                    message: e.to_string(),
                });
                Routed::Violation
            }
        }
    }

    fn route_control(&self, connection: &Arc<Connection>, frame: &ControlFrame) -> Routed {
        let acceptance = {
            let _inbound = connection.lock_inbound();
            connection.accept_control(frame.order_number, frame.confirms())
        };

        let ControlAcceptance::Accepted { confirmed } = acceptance else {
            log::trace!(
                "Stale control frame {} from client {}",
                frame.order_number,
                connection.id()
            );
            return Routed::Control { accepted: false };
        };

        if let Some(ControlMessage::Kick { reason }) = confirmed {
            log::info!("Client {} acknowledged kick: {}", connection.id(), reason);
            self.registry.close(connection.id(), DisconnectReason::Kicked);
            return Routed::Closed(DisconnectReason::Kicked);
        }

        match &frame.message {
            ControlMessage::Confirm => {}
            other => log::debug!(
                "Ignoring control message {:?} from client {}",
                other,
                connection.id()
            ),
        }

        Routed::Control { accepted: true }
    }
}

impl DatagramHandler for DispatchRouter {
    fn on_receive(&self, from: SocketAddr, bytes: &[u8]) {
        self.route(from, bytes);
    }
}
