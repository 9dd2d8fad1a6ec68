use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `[gateway]` section: credentials and tuning for the event-stream connection.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub shard_id: u32,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Declared capability bits sent with Identify.
    #[serde(default = "default_intents")]
    pub intents: u64,
    /// Overrides the url returned by `GET /gateway/bot`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_sends_per_minute")]
    pub max_sends_per_minute: usize,
    #[serde(default = "default_heartbeat_ack_timeout_ms")]
    pub heartbeat_ack_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            shard_id: 0,
            shard_count: default_shard_count(),
            intents: default_intents(),
            url: None,
            max_sends_per_minute: default_max_sends_per_minute(),
            heartbeat_ack_timeout_ms: default_heartbeat_ack_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            listen_timeout_ms: default_listen_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ack_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

fn default_shard_count() -> u32 {
    1
}

// GUILDS | GUILD_VOICE_STATES | GUILD_MESSAGES
fn default_intents() -> u64 {
    (1 << 0) | (1 << 7) | (1 << 9)
}

// The platform allows 120 per minute; leave room for heartbeats.
fn default_max_sends_per_minute() -> usize {
    110
}

fn default_heartbeat_ack_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_shutdown_timeout_ms() -> u64 {
    5_000
}

fn default_listen_timeout_ms() -> u64 {
    10_000
}
