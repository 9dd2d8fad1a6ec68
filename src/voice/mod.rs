pub mod encoder;
pub mod gateway;
pub mod rtp;
pub mod streamer;
pub mod timer;
pub mod udp;

#[cfg(feature = "opus")]
pub use encoder::OpusFrameEncoder;
pub use encoder::FrameEncoder;
pub use gateway::{
    VoiceConnectInfo, VoiceProtocol, VoiceSessionParameters, VoiceSignalGateway,
    VoiceStateUpdater,
};
pub use rtp::{EncryptionMode, RtpPacketGenerator};
pub use streamer::{AudioStreamer, PlaybackEvent, StreamerOptions};
pub use timer::DriftTimer;
pub use udp::UdpTransport;
