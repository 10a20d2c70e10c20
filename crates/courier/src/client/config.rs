use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::DEFAULT_TICK_RATE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub game_name: String,
    pub version: u32,
    pub tick_rate: u32,
    /// How often the handshake is repeated until the server answers.
    pub registration_retry: Duration,
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            game_name: "courier".to_string(),
            version: 1,
            tick_rate: DEFAULT_TICK_RATE,
            registration_retry: Duration::from_millis(200),
            connection_timeout: Duration::from_millis(2000),
        }
    }
}

impl ClientConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}
