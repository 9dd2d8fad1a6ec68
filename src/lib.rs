//! Client for a chat platform's event-stream gateway, its voice signaling
//! gateway and the RTP/UDP media path behind it.

pub mod common;
pub mod configs;
pub mod gateway;
pub mod rest;
pub mod voice;
