use crate::common::errors::LinkResult;

/// Largest frame the streamer will hand to the socket.
pub const MAX_FRAME_LEN: usize = 1275;

/// Turns one fixed-size chunk of interleaved PCM into a compressed frame.
pub trait FrameEncoder: Send {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u8;

    /// Samples per channel consumed by one [`encode`](Self::encode) call.
    fn frame_samples(&self) -> usize;

    /// Encodes exactly `frame_samples() * channels()` samples into `out`,
    /// returning the frame length.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> LinkResult<usize>;
}

#[cfg(feature = "opus")]
pub use opus::OpusFrameEncoder;

#[cfg(feature = "opus")]
mod opus {
    use audiopus::{Application, Bitrate, Channels, SampleRate, coder::Encoder as OpusEncoder};

    use super::FrameEncoder;
    use crate::common::errors::{LinkError, LinkResult};

    pub struct OpusFrameEncoder {
        encoder: OpusEncoder,
        sample_rate: u32,
        channels: u8,
        frame_samples: usize,
    }

    impl OpusFrameEncoder {
        pub fn new(sample_rate: u32, channels: u8, frame_samples: usize) -> LinkResult<Self> {
            let rate = match sample_rate {
                8_000 => SampleRate::Hz8000,
                12_000 => SampleRate::Hz12000,
                16_000 => SampleRate::Hz16000,
                24_000 => SampleRate::Hz24000,
                48_000 => SampleRate::Hz48000,
                other => {
                    return Err(LinkError::configuration(format!(
                        "opus cannot encode at {} Hz",
                        other
                    )));
                }
            };
            let layout = match channels {
                1 => Channels::Mono,
                2 => Channels::Stereo,
                other => {
                    return Err(LinkError::configuration(format!(
                        "opus cannot encode {} channels",
                        other
                    )));
                }
            };
            let mut encoder = OpusEncoder::new(rate, layout, Application::Audio)
                .map_err(|e| LinkError::configuration(format!("opus encoder: {}", e)))?;
            encoder
                .set_bitrate(Bitrate::Auto)
                .map_err(|e| LinkError::configuration(format!("opus bitrate: {}", e)))?;
            Ok(Self {
                encoder,
                sample_rate,
                channels,
                frame_samples,
            })
        }
    }

    impl FrameEncoder for OpusFrameEncoder {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn channels(&self) -> u8 {
            self.channels
        }

        fn frame_samples(&self) -> usize {
            self.frame_samples
        }

        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> LinkResult<usize> {
            self.encoder
                .encode(pcm, out)
                .map_err(|e| LinkError::protocol(format!("opus encode failed: {}", e)))
        }
    }

}
