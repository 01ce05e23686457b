//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Tunables for one [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame body accepted from the peer (default: 100 MiB).
    pub max_frame_length: usize,
    /// Depth of the single writer's intake queue (default: 64).
    pub write_queue_depth: usize,
    /// How long `close()` waits for handler tasks to finish (default: 5000ms).
    pub drain_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            write_queue_depth: 64,
            drain_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
