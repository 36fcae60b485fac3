//! Worker configuration.

use std::time::Duration;

/// Settings shared by every worker of a group.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks a [`WorkerGroup`](super::WorkerGroup) runs.
    pub threads: usize,
    /// Sleep after an empty receive or a receive error.
    pub poll_interval: Duration,
    /// Glob patterns; when non-empty, only matching channels are polled.
    pub only_channels: Vec<String>,
    /// Glob patterns of channels never polled.
    pub exclude_channels: Vec<String>,
    /// Wait for in-flight dispatches when stopping.
    pub stop_gracefully: bool,
    /// Longest a graceful stop waits for in-flight dispatches.
    pub drain_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            poll_interval: Duration::from_millis(10),
            only_channels: Vec::new(),
            exclude_channels: Vec::new(),
            stop_gracefully: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}
