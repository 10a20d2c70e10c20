mod command;
mod envelope;
mod peers;
mod receiver;
mod sender;

pub use command::{Command, Reliability};
pub use envelope::{Batch, Envelope};
pub use peers::{PeerMap, PeerSet, SinglePeer};
pub use receiver::{CommandHandler, EnvelopeOutcome, Inbound, Receiver};
pub use sender::{Outbound, Sender};
