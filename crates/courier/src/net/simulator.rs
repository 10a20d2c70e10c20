use std::io;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::stats::{StatsCounters, rand_percent};
use super::transport::Transport;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Percentage of outgoing datagrams to discard (0-100).
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() < self.loss_percent
    }
}

/// Transport wrapper that silently discards a share of outgoing datagrams.
pub struct LossyTransport<T> {
    inner: T,
    simulation: PacketLossSimulation,
    dropped: StatsCounters,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, simulation: PacketLossSimulation) -> Self {
        Self {
            inner,
            simulation,
            dropped: StatsCounters::default(),
        }
    }

    pub fn simulation(&self) -> &PacketLossSimulation {
        &self.simulation
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.snapshot().packets_dropped
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if self.simulation.should_drop() {
            log::trace!("Simulated loss of {} bytes to {}", bytes.len(), addr);
            self.dropped.record_dropped();
            return Ok(bytes.len());
        }
        self.inner.send_to(bytes, addr)
    }
}
