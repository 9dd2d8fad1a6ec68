use std::time::Duration;

/// Event-stream gateway API version.
pub const SESSION_GATEWAY_VERSION: u8 = 10;

/// Voice signaling gateway version to use in the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// Rolling window for the outbound send-rate gate.
pub const SEND_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound for the reconnect backoff after failed connect attempts.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(8);

/// Close code used when we intend to resume the session afterwards.
pub const CLOSE_CODE_RESUME: u16 = 4000;

/// Close code used on a clean shutdown; the server drops the session.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

/// Event-stream close codes after which the session must not be resumed:
/// auth failed, invalid shard, sharding required, bad API version, invalid
/// and disallowed intents.
pub const SESSION_RESPECTED_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

/// Voice close codes that end the call for good: auth failed, session no
/// longer valid, server not found, disconnected from the channel.
pub const VOICE_RESPECTED_CLOSE_CODES: &[u16] = &[4004, 4006, 4011, 4014];

/// Heartbeat intervals from Hello are clamped to this.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);
