//! Link configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Link-layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rate used when the peer address is a serial device
    pub baud_rate: u32,

    /// Consecutive input or output errors tolerated before the link is
    /// considered lost
    pub max_io_errors: u32,

    /// Idle wait between polls for incoming bytes (milliseconds)
    pub poll_interval_ms: u64,

    /// Bounded wait for the prompt after a command (seconds)
    pub command_wait_secs: u64,

    /// Extra wait granted when the adapter reports it is searching (seconds)
    pub search_wait_secs: u64,

    /// Wall-clock deadline for `send_with_retry` (seconds)
    pub retry_deadline_secs: u64,

    /// Pause between `send_with_retry` attempts (milliseconds)
    pub retry_interval_ms: u64,

    /// Minimum time between two reconnect attempts (seconds)
    pub minimum_reconnect_period_secs: u64,

    /// Consecutive failed reconnects after which the supervisor stands down
    pub max_consecutive_failures: u32,

    /// Supervisor loop period (milliseconds)
    pub supervisor_tick_ms: u64,

    /// Raw commands written right after a stream opens, to clear state left
    /// behind by an abnormal disconnect
    pub warm_reset: Vec<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 38400,
            max_io_errors: 3,
            poll_interval_ms: 300,
            command_wait_secs: 3,
            search_wait_secs: 5,
            retry_deadline_secs: 5,
            retry_interval_ms: 500,
            minimum_reconnect_period_secs: 15,
            max_consecutive_failures: 10,
            supervisor_tick_ms: 1000,
            warm_reset: vec!["".to_string(), "ATWS".to_string()],
        }
    }
}

impl LinkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_wait(&self) -> Duration {
        Duration::from_secs(self.command_wait_secs)
    }

    pub fn search_wait(&self) -> Duration {
        Duration::from_secs(self.search_wait_secs)
    }

    pub fn retry_deadline(&self) -> Duration {
        Duration::from_secs(self.retry_deadline_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn minimum_reconnect_period(&self) -> Duration {
        Duration::from_secs(self.minimum_reconnect_period_secs)
    }

    pub fn supervisor_tick(&self) -> Duration {
        Duration::from_millis(self.supervisor_tick_ms)
    }

    /// Config tuned for a scripted adapter: short waits, fast reconnects
    pub fn fast() -> Self {
        Self {
            poll_interval_ms: 20,
            command_wait_secs: 1,
            search_wait_secs: 1,
            minimum_reconnect_period_secs: 1,
            supervisor_tick_ms: 100,
            ..Default::default()
        }
    }
}
