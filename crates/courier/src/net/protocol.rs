use bitflags::bitflags;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::session::Envelope;

pub const MAX_PACKET_SIZE: usize = 65_507;
/// Largest command payload accepted for sending; leaves room for framing.
pub const MAX_PAYLOAD_SIZE: usize = 60_000;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x434F_5552;
pub const DEFAULT_PORT: u16 = 27020;
pub const DEFAULT_TICK_RATE: u32 = 60;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    /// Per-sender packet counter. The server also uses it as the ordering
    /// token for registration datagrams.
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

/// True when `candidate` is strictly newer than `watermark`; everything is
/// newer than an empty watermark.
#[inline]
pub fn is_newer(candidate: u32, watermark: Option<u32>) -> bool {
    watermark.is_none_or(|w| sequence_greater_than(candidate, w))
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const CONFIRM = 1 << 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    Registered { id: u32 },
    ServicesReady,
    Kick { reason: String },
    Confirm,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ControlFrame {
    pub order_number: u32,
    pub flags: u8,
    pub message: ControlMessage,
}

impl ControlFrame {
    pub fn new(order_number: u32, message: ControlMessage, confirm: bool) -> Self {
        let flags = if confirm {
            FrameFlags::CONFIRM
        } else {
            FrameFlags::empty()
        };
        Self {
            order_number,
            flags: flags.bits(),
            message,
        }
    }

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags)
    }

    pub fn confirms(&self) -> bool {
        self.flags().contains(FrameFlags::CONFIRM)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Registration {
    pub nonce: u64,
    pub channel: u8,
    pub game_name: String,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    Register(Registration),
    Envelope(Envelope),
    Control(ControlFrame),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {size} bytes exceeds the {MAX_PACKET_SIZE} byte limit")]
    TooLarge { size: usize },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let data = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;

        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge { size: data.len() });
        }

        Ok(data)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        // Receive buffers carry no alignment guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Batch, Command};

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_is_newer_against_empty_watermark() {
        assert!(is_newer(0, None));
        assert!(is_newer(5, Some(4)));
        assert!(!is_newer(4, Some(4)));
        assert!(!is_newer(3, Some(4)));
    }

    #[test]
    fn test_control_frame_flags() {
        let frame = ControlFrame::new(3, ControlMessage::ServicesReady, true);
        assert!(frame.confirms());

        let frame = ControlFrame::new(
            0,
            ControlMessage::Kick {
                reason: "bye".to_string(),
            },
            false,
        );
        assert!(!frame.confirms());
        assert_eq!(frame.flags(), FrameFlags::empty());
    }

    #[test]
    fn test_envelope_packet_serialization() {
        let envelope = Envelope {
            order_number: 7,
            guaranteed: vec![Batch {
                batch_id: 6,
                commands: vec![Command::guaranteed(1, b"hello".to_vec())],
            }],
            unreliable: vec![Command::ack(4)],
        };
        let packet = Packet::new(PacketHeader::new(12), PacketType::Envelope(envelope));

        let serialized = packet.serialize().unwrap();
        let deserialized = Packet::deserialize(&serialized).unwrap();

        assert_eq!(packet, deserialized);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Packet::deserialize(&[0xFF; 5]).is_err());
        assert!(Packet::deserialize(&[]).is_err());
    }
}
