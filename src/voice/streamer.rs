use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    common::errors::{LinkError, LinkResult},
    configs::VoiceConfig,
    voice::{
        encoder::{FrameEncoder, MAX_FRAME_LEN},
        gateway::VoiceSessionParameters,
        rtp::RtpPacketGenerator,
        timer::DriftTimer,
        udp::UdpTransport,
    },
};

/// One opus silence frame.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Started,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct StreamerOptions {
    pub packet_interval: Duration,
    pub samples_per_packet: u32,
    pub silence_frames: usize,
    /// PCM layout `enqueue_pcm` accepts from an encoder.
    pub sample_rate: u32,
    pub channels: u8,
    pub initial_sequence: u16,
    pub initial_timestamp: u32,
}

impl From<&VoiceConfig> for StreamerOptions {
    fn from(config: &VoiceConfig) -> Self {
        Self {
            packet_interval: config.packet_interval(),
            samples_per_packet: config.samples_per_packet(),
            silence_frames: config.silence_frames,
            sample_rate: config.sample_rate,
            channels: config.channels,
            initial_sequence: 0,
            initial_timestamp: 0,
        }
    }
}

#[derive(Default)]
struct StreamState {
    queue: Mutex<VecDeque<Bytes>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PlaybackEvent>>>,
    playing: AtomicBool,
    frames_sent: AtomicU64,
    sequence: AtomicU16,
}

impl StreamState {
    fn set_playing(&self, playing: bool) {
        if self.playing.swap(playing, Ordering::SeqCst) == playing {
            return;
        }
        let event = if playing {
            PlaybackEvent::Started
        } else {
            PlaybackEvent::Stopped
        };
        debug!("Playback {:?}", event);
        self.subscribers.lock().retain(|tx| tx.send(event).is_ok());
    }
}

/// Paces encoded frames onto the media socket, one per packet interval.
pub struct AudioStreamer {
    state: Arc<StreamState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    silence_frames: usize,
    sample_rate: u32,
    channels: u8,
}

impl AudioStreamer {
    pub fn start(
        transport: Arc<UdpTransport>,
        params: Arc<VoiceSessionParameters>,
        options: StreamerOptions,
        rng: StdRng,
    ) -> Self {
        let state = Arc::new(StreamState::default());
        state
            .sequence
            .store(options.initial_sequence, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let silence_frames = options.silence_frames;
        let (sample_rate, channels) = (options.sample_rate, options.channels);
        let task = tokio::spawn(pace(
            state.clone(),
            transport,
            params,
            options,
            rng,
            cancel.clone(),
        ));
        Self {
            state,
            cancel,
            task: Mutex::new(Some(task)),
            silence_frames,
            sample_rate,
            channels,
        }
    }

    /// Queues pre-encoded frames, optionally followed by a short silence tail.
    pub fn enqueue<I>(&self, frames: I, append_silence: bool)
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut queue = self.state.queue.lock();
        queue.extend(frames);
        if append_silence {
            queue.extend(
                std::iter::repeat_n(Bytes::from_static(&SILENCE_FRAME), self.silence_frames),
            );
        }
    }

    /// Splits interleaved PCM into encoder-sized chunks, zero padding the
    /// last one, and queues the encoded frames. Returns how many were queued.
    pub fn enqueue_pcm(
        &self,
        encoder: &mut dyn FrameEncoder,
        pcm: &[i16],
        append_silence: bool,
    ) -> LinkResult<usize> {
        if encoder.sample_rate() != self.sample_rate || encoder.channels() != self.channels {
            return Err(LinkError::configuration(format!(
                "encoder produces {} Hz x{}, stream expects {} Hz x{}",
                encoder.sample_rate(),
                encoder.channels(),
                self.sample_rate,
                self.channels
            )));
        }
        let chunk_len = encoder.frame_samples() * encoder.channels() as usize;
        if chunk_len == 0 {
            return Err(LinkError::configuration("encoder frame size is zero"));
        }

        let mut out = [0u8; MAX_FRAME_LEN];
        let mut padded = Vec::new();
        let mut frames = Vec::with_capacity(pcm.len().div_ceil(chunk_len));
        for chunk in pcm.chunks(chunk_len) {
            let input = if chunk.len() == chunk_len {
                chunk
            } else {
                padded.clear();
                padded.extend_from_slice(chunk);
                padded.resize(chunk_len, 0);
                &padded[..]
            };
            let len = encoder.encode(input, &mut out)?;
            frames.push(Bytes::copy_from_slice(&out[..len]));
        }

        let count = frames.len();
        self.enqueue(frames, append_silence);
        Ok(count)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.subscribers.lock().push(tx);
        rx
    }

    /// Drops everything still queued.
    pub fn clear(&self) {
        self.state.queue.lock().clear();
    }

    pub fn queued(&self) -> usize {
        self.state.queue.lock().len()
    }

    pub fn is_playing(&self) -> bool {
        self.state.playing.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.state.frames_sent.load(Ordering::Relaxed)
    }

    /// Sequence number the next packet will carry.
    pub fn sequence(&self) -> u16 {
        self.state.sequence.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!("Pacing task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for AudioStreamer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pace(
    state: Arc<StreamState>,
    transport: Arc<UdpTransport>,
    params: Arc<VoiceSessionParameters>,
    options: StreamerOptions,
    mut rng: StdRng,
    cancel: CancellationToken,
) {
    let mut timer = DriftTimer::new(options.packet_interval);
    let mut rtp = RtpPacketGenerator::new();
    let mut sequence = options.initial_sequence;
    let mut timestamp = options.initial_timestamp;

    while timer.wait_or_cancel(&cancel).await.is_ok() {
        let frame = state.queue.lock().pop_front();
        let Some(frame) = frame else {
            state.set_playing(false);
            continue;
        };
        state.set_playing(true);

        rtp.create_header(sequence, timestamp, params.ssrc)
            .add_payload(&frame);
        if let Err(e) = rtp.encrypt_payload(params.mode, &params.secret_key, &mut rng) {
            error!("Cannot encrypt voice packet, stopping stream: {}", e);
            break;
        }
        match transport.send(rtp.finalize()).await {
            Ok(_) => {
                state.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(LinkError::Disposed(_)) => break,
            Err(e) => warn!("Failed to send voice packet {}: {}", sequence, e),
        }

        sequence = sequence.wrapping_add(1);
        timestamp = timestamp.wrapping_add(options.samples_per_packet);
        state.sequence.store(sequence, Ordering::SeqCst);
    }
    state.set_playing(false);
    debug!("Pacing loop stopped after {} frames", state.frames_sent.load(Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::rtp::{EncryptionMode, decrypt_packet};
    use byteorder::{BigEndian, ByteOrder};
    use rand::SeedableRng;
    use tokio::net::UdpSocket;

    const KEY: [u8; 32] = [3; 32];

    async fn streamer(initial_sequence: u16) -> (AudioStreamer, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = peer.local_addr().unwrap();
        let transport = Arc::new(
            UdpTransport::connect(remote, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let params = Arc::new(VoiceSessionParameters {
            ssrc: 7,
            mode: EncryptionMode::XSalsa20Poly1305,
            secret_key: KEY.to_vec(),
            remote,
            external: remote,
        });
        let options = StreamerOptions {
            packet_interval: Duration::from_millis(5),
            samples_per_packet: 960,
            silence_frames: 2,
            sample_rate: 48_000,
            channels: 2,
            initial_sequence,
            initial_timestamp: 0,
        };
        let streamer = AudioStreamer::start(transport, params, options, StdRng::seed_from_u64(1));
        (streamer, peer)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> PlaybackEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn recv_packet(peer: &UdpSocket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_edges_fire_once_and_sequence_wraps() {
        let (streamer, peer) = streamer(65534).await;
        let mut events = streamer.subscribe();

        streamer.enqueue(
            [b"a".as_slice(), b"b", b"c"].map(Bytes::from_static),
            false,
        );
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Started);

        let mut sequences = Vec::new();
        for (i, expected) in [b"a", b"b", b"c"].into_iter().enumerate() {
            let packet = recv_packet(&peer).await;
            assert_eq!(&packet[..2], &[0x80, 0x78]);
            sequences.push(BigEndian::read_u16(&packet[2..4]));
            assert_eq!(BigEndian::read_u32(&packet[4..8]), 960 * i as u32);
            assert_eq!(BigEndian::read_u32(&packet[8..12]), 7);
            assert_eq!(
                decrypt_packet(EncryptionMode::XSalsa20Poly1305, &KEY, &packet).unwrap(),
                expected
            );
        }
        assert_eq!(sequences, vec![65534, 65535, 0]);
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Stopped);

        streamer.enqueue([Bytes::from_static(b"d")], false);
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Started);
        let packet = recv_packet(&peer).await;
        assert_eq!(BigEndian::read_u16(&packet[2..4]), 1);
        assert_eq!(next_event(&mut events).await, PlaybackEvent::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(streamer.frames_sent(), 4);
        assert_eq!(streamer.sequence(), 2);
        streamer.stop().await;
    }

    #[tokio::test]
    async fn test_silence_tail_and_clear() {
        let (streamer, peer) = streamer(0).await;
        streamer.stop().await;

        streamer.enqueue([Bytes::from_static(b"x")], true);
        assert_eq!(streamer.queued(), 3);
        streamer.clear();
        assert_eq!(streamer.queued(), 0);
        assert!(!streamer.is_playing());

        let mut buf = [0u8; 64];
        assert!(
            tokio::time::timeout(Duration::from_millis(50), peer.recv(&mut buf))
                .await
                .is_err()
        );
    }

    struct CountingEncoder {
        channels: u8,
    }

    impl FrameEncoder for CountingEncoder {
        fn sample_rate(&self) -> u32 {
            48_000
        }

        fn channels(&self) -> u8 {
            self.channels
        }

        fn frame_samples(&self) -> usize {
            4
        }

        fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> LinkResult<usize> {
            assert_eq!(pcm.len(), 4 * self.channels as usize);
            out[0] = pcm.iter().filter(|&&s| s != 0).count() as u8;
            Ok(1)
        }
    }

    #[tokio::test]
    async fn test_enqueue_pcm_pads_last_chunk() {
        let (streamer, _peer) = streamer(0).await;
        streamer.stop().await;

        let pcm = [1i16; 20];
        let count = streamer
            .enqueue_pcm(&mut CountingEncoder { channels: 2 }, &pcm, false)
            .unwrap();
        assert_eq!(count, 3);
        let queue = streamer.state.queue.lock();
        let sizes: Vec<u8> = queue.iter().map(|f| f[0]).collect();
        assert_eq!(sizes, vec![8, 8, 4]);
    }

    #[tokio::test]
    async fn test_enqueue_pcm_rejects_mismatched_encoder() {
        let (streamer, _peer) = streamer(0).await;
        streamer.stop().await;

        let result = streamer.enqueue_pcm(&mut CountingEncoder { channels: 1 }, &[1i16; 8], false);
        assert!(matches!(result, Err(LinkError::Configuration(_))));
        assert_eq!(streamer.queued(), 0);
    }
}
