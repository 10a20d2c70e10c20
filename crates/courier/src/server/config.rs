use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::{DEFAULT_TICK_RATE, PacketLossSimulation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Clients announcing a different name or version are turned away.
    pub game_name: String,
    pub version: u32,
    /// Endpoint slots a client must fill before its connection completes.
    pub channels: usize,
    pub max_clients: usize,
    pub tick_rate: u32,
    pub io_threads: usize,
    pub resend_interval: Duration,
    pub liveness_timeout: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            game_name: "courier".to_string(),
            version: 1,
            channels: 1,
            max_clients: 32,
            tick_rate: DEFAULT_TICK_RATE,
            io_threads: 2,
            resend_interval: Duration::from_millis(200),
            liveness_timeout: Duration::from_millis(2000),
            packet_loss: None,
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}
