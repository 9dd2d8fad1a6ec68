pub mod backoff;
pub mod constants;
pub mod engine;
pub mod heartbeat;
pub mod listeners;
pub mod opcodes;
pub mod send_gate;
pub mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineOptions, GatewayEngine, GatewayProtocol, PendingEvent};
pub use listeners::{EventWait, ListenerFilter, ListenerHandle};
pub use session::{SessionGateway, SessionProtocol};
pub use types::{ConnectionState, GatewayPayload, HandshakeKind, Phase};
