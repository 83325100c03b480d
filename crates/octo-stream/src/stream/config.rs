use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and cadences of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Hard cap on the wall-clock length of one response.
    pub max_duration_secs: u64,
    /// Hard cap on accumulated response text, in characters.
    pub max_response_chars: usize,
    /// Interval of transport keepalive comments.
    pub keepalive_secs: u64,
    /// Minimum time between timed flushes of partial text.
    pub flush_interval_ms: u64,
    /// Budget for titles derived on the streaming path.
    pub title_max_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 300,
            max_response_chars: 100_000,
            keepalive_secs: 15,
            flush_interval_ms: 500,
            title_max_chars: 50,
        }
    }
}

impl StreamConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
