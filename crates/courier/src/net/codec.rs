use std::net::SocketAddr;

use super::protocol::{Packet, PacketError};
use super::transport::Transport;

/// Turns packets into datagrams and back.
pub trait Codec: Send + Sync {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, PacketError>;
    fn decode(&self, bytes: &[u8]) -> Result<Packet, PacketError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RkyvCodec;

impl Codec for RkyvCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>, PacketError> {
        packet.serialize()
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet, PacketError> {
        Packet::deserialize(bytes)
    }
}

pub fn send_packet(
    transport: &dyn Transport,
    codec: &dyn Codec,
    packet: &Packet,
    addr: SocketAddr,
) -> Result<usize, PacketError> {
    let bytes = codec.encode(packet)?;
    Ok(transport.send_to(&bytes, addr)?)
}
