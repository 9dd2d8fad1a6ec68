use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[voice]` section: media pacing and voice handshake bounds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    #[serde(default = "default_packet_interval_ms")]
    pub packet_interval_ms: u64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_silence_frames")]
    pub silence_frames: usize,
    #[serde(default = "default_udp_wait_timeout_ms")]
    pub udp_wait_timeout_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_leave_timeout_ms")]
    pub leave_timeout_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            packet_interval_ms: default_packet_interval_ms(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            silence_frames: default_silence_frames(),
            udp_wait_timeout_ms: default_udp_wait_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            leave_timeout_ms: default_leave_timeout_ms(),
        }
    }
}

impl VoiceConfig {
    pub fn packet_interval(&self) -> Duration {
        Duration::from_millis(self.packet_interval_ms)
    }

    /// RTP timestamp step per packet, in samples per channel.
    pub fn samples_per_packet(&self) -> u32 {
        (self.sample_rate as u64 * self.packet_interval_ms / 1_000) as u32
    }

    pub fn udp_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_wait_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }
}

fn default_packet_interval_ms() -> u64 {
    20
}

fn default_sample_rate() -> u32 {
    48_000
}

fn default_channels() -> u8 {
    2
}

fn default_silence_frames() -> usize {
    5
}

fn default_udp_wait_timeout_ms() -> u64 {
    30_000
}

fn default_discovery_timeout_ms() -> u64 {
    5_000
}

fn default_leave_timeout_ms() -> u64 {
    3_000
}
