pub mod client;
pub mod clock;
pub mod net;
pub mod server;
pub mod session;

mod sync;

pub use client::{Client, ClientConfig, ConnectionState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use net::{
    Codec, ControlFrame, ControlMessage, DEFAULT_PORT, DEFAULT_TICK_RATE, DatagramHandler,
    LossyTransport, MemoryTransport, NetworkStats, Packet, PacketError, PacketHeader,
    PacketLossSimulation, PacketType, Registration, RkyvCodec, Transport, UdpTransport,
};
pub use server::{
    Connection, ConnectionId, ConnectionListener, ConnectionRegistry, DisconnectReason,
    DispatchRouter, EventQueue, RegistrationError, RetransmitScheduler, Server, ServerConfig,
    ServerEvent, ServerStats,
};
pub use session::{
    Batch, Command, CommandHandler, Envelope, EnvelopeOutcome, Inbound, Outbound, PeerMap,
    PeerSet, Receiver, Reliability, Sender, SinglePeer,
};
