mod config;
mod connection;
mod events;
mod registration;
mod router;
mod scheduler;

pub use config::ServerConfig;
pub use connection::{
    Connection, ConnectionId, ControlAcceptance, DraftConnection, ForceQueue,
};
pub use events::{ConnectionListener, DisconnectReason, EventQueue, ServerEvent};
pub use registration::{ConnectionRegistry, RegistrationError, RegistrationOutcome};
pub use router::{DispatchRouter, Routed};
pub use scheduler::{RetransmitScheduler, SweepReport};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::net::{
    Codec, LossyTransport, NetworkStats, Packet, PacketError, PacketHeader, PacketType, RkyvCodec,
    Transport, UdpTransport, send_packet,
};
use crate::session::{Command, CommandHandler, PeerMap, Receiver, Sender};
use crate::sync::lock;

pub type ServerSender = Sender<PeerMap<ConnectionId>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    pub connections: usize,
    pub pending: usize,
    pub network: Option<NetworkStats>,
}

/// Keeps the sender's peer set in step with the registry.
struct PeerTracker {
    sender: Arc<ServerSender>,
}

impl ConnectionListener for PeerTracker {
    fn connection_added(&self, connection: &Arc<Connection>) {
        self.sender.peers().add(connection.id());
    }

    fn connection_removed(&self, connection: &Arc<Connection>, _reason: DisconnectReason) {
        self.sender.peers().remove(connection.id());
    }
}

/// A complete server endpoint: registration, dispatch, retransmission and
/// the per-connection envelope protocol.
///
/// The host drives [`Server::flush`] once per tick; everything inbound runs
/// on the transport's I/O threads and the scheduler thread. A connection
/// that has had no envelope for half the liveness timeout gets an empty one
/// so idle peers stay registered.
pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    sender: Arc<ServerSender>,
    receiver: Arc<Receiver<ConnectionId>>,
    router: Arc<DispatchRouter>,
    scheduler: Arc<RetransmitScheduler>,
    events: Arc<EventQueue>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    socket: Option<Arc<UdpTransport>>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> io::Result<Self> {
        let socket = Arc::new(UdpTransport::bind(addr)?);

        let transport: Arc<dyn Transport> = match config.packet_loss.clone() {
            Some(simulation) if simulation.enabled => {
                log::info!(
                    "Simulating {}% outgoing packet loss",
                    simulation.loss_percent
                );
                Arc::new(LossyTransport::new(Arc::clone(&socket), simulation))
            }
            _ => socket.clone(),
        };

        let mut server = Self::with_transport(config, transport, Arc::new(SystemClock));
        server.socket = Some(socket);
        Ok(server)
    }

    /// Builds a server on an arbitrary transport. Inbound datagrams must be
    /// fed to [`Server::router`] by the caller.
    pub fn with_transport(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.game_name.clone(),
            config.version,
            config.channels,
            config.max_clients,
        ));

        let sender: Arc<ServerSender> = Arc::new(Sender::new(PeerMap::new()));
        let ack_sender = Arc::clone(&sender);
        let receiver = Arc::new(Receiver::new(move |id: ConnectionId, ack: Command| {
            ack_sender.enqueue(id, ack);
        }));
        receiver.register_handler(sender.clone());

        // Registered first so later listeners can already enqueue.
        registry.add_listener(Arc::new(PeerTracker {
            sender: Arc::clone(&sender),
        }));
        let events = Arc::new(EventQueue::new());
        registry.add_listener(events.clone());

        let codec: Arc<dyn Codec> = Arc::new(RkyvCodec);

        let router = Arc::new(DispatchRouter::new(
            Arc::clone(&registry),
            Arc::clone(&receiver),
            Arc::clone(&transport),
            Arc::clone(&codec),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));

        let scheduler = Arc::new(RetransmitScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&codec),
            Arc::clone(&clock),
            config.resend_interval,
            config.liveness_timeout,
        ));

        Self {
            config,
            registry,
            sender,
            receiver,
            router,
            scheduler,
            events,
            transport,
            codec,
            clock,
            socket: None,
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) -> io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut workers = lock(&self.workers);
        if let Some(socket) = &self.socket {
            workers.extend(socket.spawn_listeners(
                self.config.io_threads,
                self.router.clone(),
                Arc::clone(&self.running),
            )?);
            log::info!("Listening on {}", socket.local_addr());
        }
        workers.push(Arc::clone(&self.scheduler).spawn(Arc::clone(&self.running))?);

        Ok(())
    }

    pub fn shutdown(&self) {
        for connection in self.registry.connections() {
            self.say_goodbye(&connection);
            self.registry.close(connection.id(), DisconnectReason::Graceful);
        }

        self.running.store(false, Ordering::SeqCst);
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("Worker thread panicked");
            }
        }
    }

    /// Sends one envelope to every peer with something pending. Returns the
    /// number of envelopes sent.
    pub fn flush(&self) -> usize {
        let now = self.clock.now();
        let keepalive = self.config.liveness_timeout / 2;
        for connection in self.registry.connections() {
            if connection.is_idle(now, keepalive) {
                self.sender.keep_alive(connection.id());
            }
        }

        let mut sent = 0;

        for (id, envelope) in self.sender.flush_all() {
            let Some(connection) = self.registry.connection(id) else {
                continue;
            };
            let packet = Packet::new(
                PacketHeader::new(connection.next_sequence()),
                PacketType::Envelope(envelope),
            );
            match self.send(&packet, connection.address()) {
                Ok(_) => {
                    connection.mark_sent(now);
                    sent += 1;
                }
                Err(PacketError::TooLarge { size }) => {
                    // Every later flush would replay the same history.
                    log::warn!("Envelope of {} bytes to client {} cannot be sent", size, id);
                    self.say_goodbye(&connection);
                    self.registry.close(id, DisconnectReason::Oversized);
                }
                Err(e) => log::warn!("Envelope to client {} failed: {}", id, e),
            }
        }

        sent
    }

    pub fn enqueue(&self, id: ConnectionId, command: Command) -> bool {
        self.sender.enqueue(id, command)
    }

    pub fn broadcast(&self, command: Command) -> usize {
        self.sender.broadcast(command)
    }

    pub fn kick(&self, id: ConnectionId, reason: impl Into<String>) -> bool {
        match self.registry.connection(id) {
            Some(connection) => {
                connection.close(reason);
                true
            }
            None => false,
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn CommandHandler<ConnectionId>>) {
        self.receiver.register_handler(handler);
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn CommandHandler<ConnectionId>>) -> bool {
        self.receiver.unregister_handler(handler)
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.registry.add_listener(listener);
    }

    pub fn drain_events(&self) -> Vec<ServerEvent> {
        self.events.drain()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.registry.len(),
            pending: self.registry.pending_len(),
            network: self.socket.as_ref().map(|socket| socket.stats()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<DispatchRouter> {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<RetransmitScheduler> {
        &self.scheduler
    }

    pub fn sender(&self) -> &Arc<ServerSender> {
        &self.sender
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|socket| socket.local_addr())
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn say_goodbye(&self, connection: &Connection) {
        let packet = Packet::new(
            PacketHeader::new(connection.next_sequence()),
            PacketType::Disconnect,
        );
        if let Err(e) = self.send(&packet, connection.address()) {
            log::debug!("Failed to notify client {}: {}", connection.id(), e);
        }
    }

    fn send(&self, packet: &Packet, addr: SocketAddr) -> Result<usize, PacketError> {
        send_packet(self.transport.as_ref(), self.codec.as_ref(), packet, addr)
    }
}
