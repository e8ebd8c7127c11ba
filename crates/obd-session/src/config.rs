//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn commands(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}

/// Settings shared by every session plus one block per session kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Management loop period (ms)
    pub tick_period_ms: u64,
    /// Poll interval while waiting for a suspended loop to exit (ms)
    pub suspend_poll_ms: u64,
    /// Polls after which a slow suspension is logged
    pub suspend_warn_polls: u32,
    pub obd2: Obd2Config,
    pub monitor: MonitorConfig,
    pub control: ControlConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 1000,
            suspend_poll_ms: 200,
            suspend_warn_polls: 50,
            obd2: Obd2Config::default(),
            monitor: MonitorConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn suspend_poll(&self) -> Duration {
        Duration::from_millis(self.suspend_poll_ms)
    }

    /// Short periods for tests against the mock adapter
    pub fn fast() -> Self {
        let mut config = Self {
            tick_period_ms: 20,
            suspend_poll_ms: 10,
            ..Self::default()
        };
        config.monitor.frame_wait_ms = 500;
        config.monitor.idle_rebuild_secs = 1;
        config
    }
}

/// Request/response polling session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Obd2Config {
    pub init: Vec<String>,
    /// Sent on suspend when asked to leave the adapter neutral
    pub uninit: Vec<String>,
    /// Required `ATDPN` protocol number, if any
    pub expected_protocol: Option<u8>,
    /// Liveness requests, tried in order until one is acknowledged
    pub liveness_probes: Vec<String>,
}

impl Default for Obd2Config {
    fn default() -> Self {
        Self {
            init: commands(&["ATD", "ATE1", "ATL0", "ATS1", "ATH1", "ATAT1", "ATSP0"]),
            uninit: Vec::new(),
            expected_protocol: None,
            liveness_probes: commands(&["010C", "0100"]),
        }
    }
}

/// Bus monitor (sniff) session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub init: Vec<String>,
    pub uninit: Vec<String>,
    pub expected_protocol: Option<u8>,
    /// Command that puts the adapter into monitor-all mode
    pub monitor_command: String,
    /// Extra cancel-and-reissue attempts when the echo does not arrive
    pub monitor_retries: u32,
    /// Frames sampled before the session is accepted
    pub sample_frames: u32,
    /// Error frames among the samples that reject the session
    pub max_error_frames: u32,
    /// Wait for one monitor line (ms)
    pub frame_wait_ms: u64,
    /// Rebuild the monitor after this long without a frame (s)
    pub idle_rebuild_secs: u64,
    /// Network id passed to sniff rule lookups
    pub network: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            init: commands(&["ATD", "ATE1", "ATL0", "ATS1", "ATH1", "ATSP6"]),
            uninit: commands(&["ATD"]),
            expected_protocol: None,
            monitor_command: "ATMA".to_string(),
            monitor_retries: 5,
            sample_frames: 10,
            max_error_frames: 5,
            frame_wait_ms: 3000,
            idle_rebuild_secs: 10,
            network: "default".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn idle_rebuild(&self) -> Duration {
        Duration::from_secs(self.idle_rebuild_secs)
    }
}

/// Proprietary command/control session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Adapter parameter programming, sent once per link lifetime
    pub programming: Vec<String>,
    /// Light sequence sent on every climb to the terminal rung
    pub resume: Vec<String>,
    pub uninit: Vec<String>,
    pub expected_protocol: Option<u8>,
    pub wake: WakeConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            programming: commands(&["ATPP 2C SV 81", "ATPP 2C ON", "ATPP 2D SV 01", "ATPP 2D ON"]),
            resume: commands(&["ATE1", "ATS1", "ATH1", "ATCAF1", "ATSP7"]),
            uninit: commands(&["ATD"]),
            expected_protocol: Some(7),
            wake: WakeConfig::default(),
        }
    }
}

/// Wake-all-nodes sequence: switch to 11-bit addressing, send one frame,
/// switch back
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Protocol used to transmit the wake frame (11-bit)
    pub wake_protocol: u8,
    /// Header the wake frame is sent under
    pub header: String,
    /// Wake frame data bytes
    pub frame: String,
    /// Protocol restored afterwards (29-bit)
    pub restore_protocol: u8,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            wake_protocol: 6,
            header: "7DF".to_string(),
            frame: "3E 80".to_string(),
            restore_protocol: 7,
        }
    }
}
