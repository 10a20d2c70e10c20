mod codec;
mod memory;
mod protocol;
mod simulator;
mod stats;
mod transport;

pub use codec::{Codec, RkyvCodec, send_packet};
pub use memory::{Datagram, MemoryTransport};
pub use protocol::{
    ControlFrame, ControlMessage, DEFAULT_PORT, DEFAULT_TICK_RATE, FrameFlags, MAX_PACKET_SIZE,
    MAX_PAYLOAD_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError, PacketHeader,
    PacketType, Registration, is_newer, sequence_greater_than,
};
pub use protocol::{ArchivedPacket, ArchivedPacketType};
pub use simulator::{LossyTransport, PacketLossSimulation};
pub use stats::{NetworkStats, StatsCounters, rand_percent, rand_u64};
pub use transport::{DatagramHandler, Transport, UdpTransport};
