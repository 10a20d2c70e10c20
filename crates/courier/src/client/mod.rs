mod config;

pub use config::ClientConfig;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::Clock;
use crate::net::{
    Codec, ControlFrame, ControlMessage, DatagramHandler, Packet, PacketError, PacketHeader,
    PacketType, Registration, RkyvCodec, Transport, is_newer, rand_u64, send_packet,
};
use crate::server::ConnectionId;
use crate::session::{
    Command, CommandHandler, EnvelopeOutcome, Inbound, Receiver, Sender, SinglePeer,
};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Registering,
    Registered,
    /// The server signalled that services may start.
    Ready,
}

impl ConnectionState {
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered | Self::Ready)
    }
}

#[derive(Debug)]
struct ClientSession {
    state: ConnectionState,
    id: Option<ConnectionId>,
    nonce: u64,
    last_registration: Option<Instant>,
    last_received: Instant,
    last_sent: Instant,
    control_watermark: Option<u32>,
    close_reason: Option<String>,
}

/// Client side of a session with one server.
///
/// [`Client::update`] must be called once per tick; inbound datagrams go
/// through [`Client::handle_datagram`], usually from a transport listener.
/// Once registered, `update` sends an empty envelope whenever nothing went
/// out for half the connection timeout.
pub struct Client {
    config: ClientConfig,
    server_addr: SocketAddr,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    session: Mutex<ClientSession>,
    inbound: Mutex<Inbound>,
    send_sequence: AtomicU32,
    sender: Arc<Sender<SinglePeer>>,
    receiver: Arc<Receiver<()>>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        server_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sender = Arc::new(Sender::new(SinglePeer::new()));
        let ack_sender = Arc::clone(&sender);
        let receiver = Arc::new(Receiver::new(move |_: (), ack: Command| {
            ack_sender.enqueue((), ack);
        }));
        receiver.register_handler(sender.clone());

        let now = clock.now();

        Self {
            config,
            server_addr,
            transport,
            codec: Arc::new(RkyvCodec),
            clock,
            session: Mutex::new(ClientSession {
                state: ConnectionState::Disconnected,
                id: None,
                nonce: 0,
                last_registration: None,
                last_received: now,
                last_sent: now,
                control_watermark: None,
                close_reason: None,
            }),
            inbound: Mutex::new(Inbound::new()),
            send_sequence: AtomicU32::new(0),
            sender,
            receiver,
        }
    }

    pub fn connect(&self) -> Result<(), PacketError> {
        self.sender.peers().disconnect();
        *lock(&self.inbound) = Inbound::new();

        let now = self.clock.now();
        let nonce = rand_u64();
        {
            let mut session = lock(&self.session);
            session.state = ConnectionState::Registering;
            session.id = None;
            session.nonce = nonce;
            session.last_registration = Some(now);
            session.last_received = now;
            session.last_sent = now;
            session.control_watermark = None;
            session.close_reason = None;
        }

        log::info!("Registering with {}", self.server_addr);
        self.send_registration(nonce)
    }

    /// Per-tick work: handshake retries, liveness and the outgoing
    /// envelope. Returns the number of envelopes sent.
    pub fn update(&self) -> Result<usize, PacketError> {
        let now = self.clock.now();

        let (state, retry_nonce, idle) = {
            let mut session = lock(&self.session);
            if session.state == ConnectionState::Disconnected {
                return Ok(0);
            }

            let silence = now.saturating_duration_since(session.last_received);
            if silence > self.config.connection_timeout {
                drop(session);
                self.close_local("Server connection lost");
                return Ok(0);
            }

            let retry = session.state == ConnectionState::Registering
                && session.last_registration.is_none_or(|last| {
                    now.saturating_duration_since(last) >= self.config.registration_retry
                });
            if retry {
                session.last_registration = Some(now);
            }
            let idle = now.saturating_duration_since(session.last_sent)
                >= self.config.connection_timeout / 2;
            (session.state, retry.then_some(session.nonce), idle)
        };

        if let Some(nonce) = retry_nonce {
            log::debug!("Retrying registration with {}", self.server_addr);
            self.send_registration(nonce)?;
        }

        if !state.is_registered() {
            return Ok(0);
        }

        if idle {
            self.sender.keep_alive(());
        }

        let Some(envelope) = self.sender.flush(()) else {
            return Ok(0);
        };
        match self.send(PacketType::Envelope(envelope)) {
            Ok(_) => {
                lock(&self.session).last_sent = now;
                Ok(1)
            }
            Err(e @ PacketError::TooLarge { .. }) => {
                // The same history would be replayed, and refused, every tick.
                if let Err(e) = self.send(PacketType::Disconnect) {
                    log::debug!("Failed to notify {}: {}", self.server_addr, e);
                }
                self.close_local("Outgoing history exceeds the packet size limit");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn disconnect(&self) -> Result<(), PacketError> {
        if self.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        let result = self.send(PacketType::Disconnect);
        self.close_local("Client disconnected");
        result.map(|_| ())
    }

    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) {
        if from != self.server_addr {
            log::trace!("Ignoring datagram from {}", from);
            return;
        }

        let packet = match self.codec.decode(bytes) {
            Ok(packet) if packet.header.is_valid() => packet,
            Ok(_) => {
                log::debug!("Dropping datagram with bad header");
                return;
            }
            Err(e) => {
                log::debug!("Dropping malformed datagram: {}", e);
                return;
            }
        };

        {
            let mut session = lock(&self.session);
            if session.state == ConnectionState::Disconnected {
                return;
            }
            session.last_received = self.clock.now();
        }

        match packet.payload {
            PacketType::Control(frame) => self.handle_control(frame),
            PacketType::Envelope(envelope) => {
                if !self.state().is_registered() {
                    log::trace!("Envelope before registration dropped");
                    return;
                }
                let mut inbound = lock(&self.inbound);
                let outcome = self.receiver.on_envelope((), &mut inbound, &envelope);
                if outcome == EnvelopeOutcome::Stale {
                    log::trace!("Stale envelope {}", envelope.order_number);
                }
            }
            PacketType::Disconnect => self.close_local("Server closed the connection"),
            PacketType::Register(_) => log::debug!("Unexpected registration from server"),
        }
    }

    fn handle_control(&self, frame: ControlFrame) {
        if frame.confirms() {
            // Confirm duplicates too, in case an earlier confirmation was lost.
            let reply = ControlFrame::new(frame.order_number, ControlMessage::Confirm, true);
            if let Err(e) = self.send(PacketType::Control(reply)) {
                log::warn!("Failed to confirm control frame {}: {}", frame.order_number, e);
            }

            let mut session = lock(&self.session);
            if !is_newer(frame.order_number, session.control_watermark) {
                log::trace!("Duplicate control frame {}", frame.order_number);
                return;
            }
            session.control_watermark = Some(frame.order_number);
        }

        self.apply_control(frame.message);
    }

    fn apply_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::Registered { id } => {
                {
                    let mut session = lock(&self.session);
                    if session.state != ConnectionState::Registering {
                        return;
                    }
                    session.state = ConnectionState::Registered;
                    session.id = Some(id);
                }
                self.sender.peers().connect();
                log::info!("Registered with {} as client {}", self.server_addr, id);
            }
            ControlMessage::ServicesReady => {
                let mut session = lock(&self.session);
                if session.state == ConnectionState::Registered {
                    session.state = ConnectionState::Ready;
                    log::debug!("Server services ready");
                }
            }
            ControlMessage::Kick { reason } => self.close_local(&reason),
            ControlMessage::Confirm => {}
        }
    }

    fn close_local(&self, reason: &str) {
        {
            let mut session = lock(&self.session);
            if session.state == ConnectionState::Disconnected {
                return;
            }
            session.state = ConnectionState::Disconnected;
            session.close_reason = Some(reason.to_string());
        }
        self.sender.peers().disconnect();
        log::info!("Disconnected from {}: {}", self.server_addr, reason);
    }

    fn send_registration(&self, nonce: u64) -> Result<(), PacketError> {
        let registration = Registration {
            nonce,
            channel: 0,
            game_name: self.config.game_name.clone(),
            version: self.config.version,
        };
        self.send(PacketType::Register(registration)).map(|_| ())
    }

    fn send(&self, payload: PacketType) -> Result<usize, PacketError> {
        let sequence = self.send_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = Packet::new(PacketHeader::new(sequence), payload);
        send_packet(
            self.transport.as_ref(),
            self.codec.as_ref(),
            &packet,
            self.server_addr,
        )
    }

    /// Dropped while not registered.
    pub fn enqueue(&self, command: Command) -> bool {
        self.sender.enqueue((), command)
    }

    pub fn register_handler(&self, handler: Arc<dyn CommandHandler<()>>) {
        self.receiver.register_handler(handler);
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn CommandHandler<()>>) -> bool {
        self.receiver.unregister_handler(handler)
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.session).state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn id(&self) -> Option<ConnectionId> {
        lock(&self.session).id
    }

    pub fn close_reason(&self) -> Option<String> {
        lock(&self.session).close_reason.clone()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.sender.unconfirmed_len(())
    }
}

impl DatagramHandler for Client {
    fn on_receive(&self, from: SocketAddr, bytes: &[u8]) {
        self.handle_datagram(from, bytes);
    }
}
