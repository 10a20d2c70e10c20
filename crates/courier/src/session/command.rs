use rkyv::{Archive, Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Reliability {
    Guaranteed,
    Unreliable,
}

impl Reliability {
    pub fn is_guaranteed(&self) -> bool {
        matches!(self, Self::Guaranteed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Command {
    /// Cumulative acknowledgment of every envelope up to and including
    /// `confirmed_order_number`. Never sent guaranteed.
    Ack { confirmed_order_number: u32 },
    Message {
        reliability: Reliability,
        kind: u16,
        payload: Vec<u8>,
    },
}

impl Command {
    pub fn guaranteed(kind: u16, payload: Vec<u8>) -> Self {
        Self::Message {
            reliability: Reliability::Guaranteed,
            kind,
            payload,
        }
    }

    pub fn unreliable(kind: u16, payload: Vec<u8>) -> Self {
        Self::Message {
            reliability: Reliability::Unreliable,
            kind,
            payload,
        }
    }

    pub fn ack(confirmed_order_number: u32) -> Self {
        Self::Ack {
            confirmed_order_number,
        }
    }

    pub fn reliability(&self) -> Reliability {
        match self {
            Self::Ack { .. } => Reliability::Unreliable,
            Self::Message { reliability, .. } => *reliability,
        }
    }

    pub fn is_guaranteed(&self) -> bool {
        self.reliability().is_guaranteed()
    }

    pub fn confirmed_order_number(&self) -> Option<u32> {
        match self {
            Self::Ack {
                confirmed_order_number,
            } => Some(*confirmed_order_number),
            Self::Message { .. } => None,
        }
    }

    pub fn kind(&self) -> Option<u16> {
        match self {
            Self::Message { kind, .. } => Some(*kind),
            Self::Ack { .. } => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Message { payload, .. } => payload,
            Self::Ack { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_is_never_guaranteed() {
        let ack = Command::ack(3);
        assert!(!ack.is_guaranteed());
        assert_eq!(ack.confirmed_order_number(), Some(3));
        assert_eq!(ack.kind(), None);
        assert!(ack.payload().is_empty());
    }

    #[test]
    fn message_reliability() {
        let chat = Command::guaranteed(1, b"hi".to_vec());
        assert!(chat.is_guaranteed());
        assert_eq!(chat.kind(), Some(1));
        assert_eq!(chat.payload(), b"hi");
        assert_eq!(chat.confirmed_order_number(), None);

        let position = Command::unreliable(2, vec![1, 2, 3]);
        assert_eq!(position.reliability(), Reliability::Unreliable);
    }
}
