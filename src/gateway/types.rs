use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire envelope shared by both gateways: `{op, d, s, t}`.
///
/// The voice gateway names the sequence field `seq`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, alias = "seq", skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: Value) -> Self {
        Self { op, d, s: None, t: None }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Identify,
    Resume,
}

/// Lifecycle of one gateway engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    AwaitingHello,
    Handshaking(HandshakeKind),
    Ready,
    Reconnecting,
    Closing,
}

/// Per-connection protocol state. Replaced wholesale when a reconnect does
/// not resume.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
    pub heartbeat_interval: Option<Duration>,
    pub should_resume: bool,
    pub ready: bool,
}

/// Why a connection ended; tells the supervisor what to do next.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Disconnect {
    Closed { code: Option<u16>, reason: String },
    HeartbeatTimeout,
    Reconnect { resume: bool },
}

#[derive(Debug)]
pub(crate) struct Signal {
    pub generation: u64,
    pub reason: Disconnect,
}
