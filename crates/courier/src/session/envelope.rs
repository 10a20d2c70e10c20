use rkyv::{Archive, Deserialize, Serialize};

use super::command::Command;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Batch {
    pub batch_id: u32,
    pub commands: Vec<Command>,
}

/// Everything a peer sends in one send cycle: the whole unconfirmed
/// guaranteed history plus this cycle's unreliable commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Envelope {
    pub order_number: u32,
    /// Ascending, unique `batch_id`.
    pub guaranteed: Vec<Batch>,
    pub unreliable: Vec<Command>,
}

impl Envelope {
    pub fn new(order_number: u32) -> Self {
        Self {
            order_number,
            ..Default::default()
        }
    }

    pub fn batch_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.guaranteed.iter().map(|batch| batch.batch_id)
    }
}
