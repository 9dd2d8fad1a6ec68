use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::{SeedableRng, rngs::StdRng};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    common::{
        errors::{LinkError, LinkResult},
        types::{GuildId, UserId},
    },
    configs::VoiceConfig,
    gateway::{
        constants::{VOICE_GATEWAY_VERSION, VOICE_RESPECTED_CLOSE_CODES},
        engine::{EngineOptions, GatewayEngine, GatewayProtocol},
        listeners::{EventWait, ListenerFilter},
        opcodes::voice as op,
        types::{GatewayPayload, HandshakeKind, Phase},
    },
    voice::{
        rtp::EncryptionMode,
        streamer::{AudioStreamer, PlaybackEvent, StreamerOptions},
        udp::UdpTransport,
    },
};

/// Credentials from the event stream's voice state and voice server dispatches.
#[derive(Debug, Clone)]
pub struct VoiceConnectInfo {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

/// Media parameters agreed during the handshake. Replaced as a whole on
/// every new handshake.
#[derive(Debug, Clone)]
pub struct VoiceSessionParameters {
    pub ssrc: u32,
    pub mode: EncryptionMode,
    pub secret_key: Vec<u8>,
    pub remote: SocketAddr,
    pub external: SocketAddr,
}

/// Lets the voice connection ask the event stream to leave the call.
#[async_trait]
pub trait VoiceStateUpdater: Send + Sync + 'static {
    async fn leave_voice(&self, guild_id: GuildId) -> LinkResult<()>;
}

pub struct VoiceProtocol {
    info: VoiceConnectInfo,
    config: VoiceConfig,
    params: RwLock<Option<Arc<VoiceSessionParameters>>>,
    transport: RwLock<Option<Arc<UdpTransport>>>,
}

impl VoiceProtocol {
    fn new(info: VoiceConnectInfo, config: VoiceConfig) -> Self {
        Self {
            info,
            config,
            params: RwLock::new(None),
            transport: RwLock::new(None),
        }
    }

    fn identify_payload(&self) -> Value {
        json!({
            "server_id": self.info.guild_id.to_string(),
            "user_id": self.info.user_id.to_string(),
            "session_id": self.info.session_id,
            "token": self.info.token,
        })
    }

    async fn identify(&self, engine: &GatewayEngine) -> LinkResult<()> {
        let ready = engine
            .listen_for_event_after(
                EventWait::op(op::READY),
                engine.send(op::IDENTIFY, self.identify_payload()),
            )
            .await?;

        let ssrc = ready.d["ssrc"]
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| LinkError::protocol("voice READY without ssrc"))?;
        let offered: Vec<&str> = ready.d["modes"]
            .as_array()
            .map(|modes| modes.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mode = EncryptionMode::negotiate(&offered)?;
        let remote = resolve_media_endpoint(&ready.d).await?;
        debug!(
            "[{}] READY: ssrc {}, media {}, mode {}",
            engine.label(),
            ssrc,
            remote,
            mode
        );

        let transport = Arc::new(UdpTransport::connect(remote, self.config.udp_wait_timeout()).await?);
        let external = transport
            .discover_external_address(ssrc, self.config.discovery_timeout())
            .await?;
        // send-only from here; inbound media stays in the kernel
        transport.set_listening(false);

        let description = engine
            .listen_for_event_after(
                EventWait::op(op::SESSION_DESCRIPTION),
                engine.send(
                    op::SELECT_PROTOCOL,
                    json!({
                        "protocol": "udp",
                        "data": {
                            "address": external.ip().to_string(),
                            "port": external.port(),
                            "mode": mode.as_str(),
                        },
                    }),
                ),
            )
            .await?;

        let mode = match description.d["mode"].as_str() {
            Some(name) => name.parse()?,
            None => mode,
        };
        let secret_key: Vec<u8> = description.d["secret_key"]
            .as_array()
            .map(|key| {
                key.iter()
                    .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect()
            })
            .unwrap_or_default();
        if secret_key.len() != 32 {
            return Err(LinkError::protocol(format!(
                "secret key has {} bytes, expected 32",
                secret_key.len()
            )));
        }

        let params = Arc::new(VoiceSessionParameters {
            ssrc,
            mode,
            secret_key,
            remote,
            external,
        });
        if let Some(old) = self.transport.write().replace(transport) {
            old.dispose();
        }
        *self.params.write() = Some(params);
        engine.set_session_id(self.info.session_id.clone());
        info!(
            "[{}] Voice session ready (ssrc {}, {} via {})",
            engine.label(),
            ssrc,
            mode,
            external
        );
        Ok(())
    }

    async fn resume(&self, engine: &GatewayEngine) -> LinkResult<()> {
        engine
            .listen_for_event_after(
                EventWait::op(op::RESUMED),
                engine.send(
                    op::RESUME,
                    json!({
                        "server_id": self.info.guild_id.to_string(),
                        "session_id": self.info.session_id,
                        "token": self.info.token,
                        "seq_ack": engine.sequence(),
                    }),
                ),
            )
            .await?;
        info!("[{}] Voice session resumed", engine.label());
        Ok(())
    }
}

#[async_trait]
impl GatewayProtocol for VoiceProtocol {
    fn label(&self) -> String {
        format!("voice {}", self.info.guild_id)
    }

    fn url(&self, _resume: bool) -> String {
        let endpoint = self.info.endpoint.trim_end_matches('/');
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            format!("{}/?v={}", endpoint, VOICE_GATEWAY_VERSION)
        } else {
            format!("wss://{}/?v={}", endpoint, VOICE_GATEWAY_VERSION)
        }
    }

    fn hello_op(&self) -> u8 {
        op::HELLO
    }

    fn heartbeat_ack_op(&self) -> u8 {
        op::HEARTBEAT_ACK
    }

    fn respected_close_codes(&self) -> &[u16] {
        VOICE_RESPECTED_CLOSE_CODES
    }

    fn heartbeat(&self, sequence: Option<u64>) -> GatewayPayload {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        GatewayPayload::new(op::HEARTBEAT, json!({ "t": now, "seq_ack": sequence }))
    }

    async fn handshake(&self, engine: &GatewayEngine, kind: HandshakeKind) -> LinkResult<()> {
        let held = self.params.read().is_some();
        match kind {
            HandshakeKind::Resume if held => self.resume(engine).await,
            _ => self.identify(engine).await,
        }
    }
}

async fn resolve_media_endpoint(ready: &Value) -> LinkResult<SocketAddr> {
    let ip = ready["ip"]
        .as_str()
        .ok_or_else(|| LinkError::protocol("voice READY without ip"))?;
    let port = ready["port"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| LinkError::protocol("voice READY without port"))?;
    if let Ok(ip) = ip.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((ip, port))
        .await?
        .next()
        .ok_or_else(|| LinkError::protocol(format!("cannot resolve media host {}", ip)))
}

/// Signaling connection for one voice call.
#[derive(Clone)]
pub struct VoiceSignalGateway {
    engine: Arc<GatewayEngine>,
    protocol: Arc<VoiceProtocol>,
    updater: Arc<dyn VoiceStateUpdater>,
}

impl VoiceSignalGateway {
    pub fn new(
        info: VoiceConnectInfo,
        config: VoiceConfig,
        options: EngineOptions,
        updater: Arc<dyn VoiceStateUpdater>,
    ) -> Self {
        let protocol = Arc::new(VoiceProtocol::new(info, config));
        let engine = GatewayEngine::new(protocol.clone(), options);
        let label = engine.label().to_owned();
        engine.add_listener(ListenerFilter::op(op::CLIENT_DISCONNECT), move |payload| {
            let label = label.clone();
            async move {
                info!(
                    "[{}] User {} left the call",
                    label,
                    payload.d["user_id"].as_str().unwrap_or("?")
                );
                Ok(())
            }
        });
        Self {
            engine,
            protocol,
            updater,
        }
    }

    pub fn engine(&self) -> &Arc<GatewayEngine> {
        &self.engine
    }

    pub fn guild_id(&self) -> GuildId {
        self.protocol.info.guild_id
    }

    /// Connects, negotiates the media session and keeps it alive.
    pub async fn connect(&self) -> LinkResult<()> {
        self.engine.start(true).await
    }

    pub fn parameters(&self) -> Option<Arc<VoiceSessionParameters>> {
        self.protocol.params.read().clone()
    }

    pub fn transport(&self) -> Option<Arc<UdpTransport>> {
        self.protocol.transport.read().clone()
    }

    pub async fn speaking(&self, speaking: bool) -> LinkResult<()> {
        let ssrc = self
            .parameters()
            .map(|p| p.ssrc)
            .ok_or_else(|| LinkError::protocol("voice session is not ready"))?;
        self.engine
            .send(
                op::SPEAKING,
                json!({ "speaking": u8::from(speaking), "delay": 0, "ssrc": ssrc }),
            )
            .await
    }

    /// Starts a streamer on the negotiated session. Speaking is toggled
    /// from its playback edges.
    pub fn create_streamer(&self) -> LinkResult<AudioStreamer> {
        let params = self
            .parameters()
            .ok_or_else(|| LinkError::protocol("voice session is not ready"))?;
        let transport = self
            .transport()
            .ok_or(LinkError::Disposed("udp transport"))?;
        let options = StreamerOptions::from(&self.protocol.config);
        let streamer = AudioStreamer::start(transport, params, options, StdRng::from_entropy());

        let mut events = streamer.subscribe();
        let gateway = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = gateway.speaking(event == PlaybackEvent::Started).await {
                    debug!("[{}] Speaking update failed: {}", gateway.engine.label(), e);
                }
            }
        });
        Ok(streamer)
    }

    /// Leaves the call and waits, bounded, for the remote to hang up before
    /// closing the socket locally.
    pub async fn stop(&self) {
        self.engine.set_persist(false);
        if let Err(e) = self.updater.leave_voice(self.guild_id()).await {
            warn!("[{}] Leave request failed: {}", self.engine.label(), e);
        }

        let bound = self.protocol.config.leave_timeout();
        if self.engine.phase() != Phase::Disconnected
            && self
                .engine
                .wait_for_phase(Phase::Disconnected, bound)
                .await
                .is_err()
        {
            warn!(
                "[{}] Remote did not close the voice connection within {:?}, closing it ourselves",
                self.engine.label(),
                bound
            );
        }
        self.engine.stop().await;
        if let Some(transport) = self.protocol.transport.write().take() {
            transport.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::testing::MockServer,
        voice::{rtp::decrypt_packet, udp::build_discovery_request},
    };
    use bytes::Bytes;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use tokio::net::UdpSocket;

    #[derive(Default)]
    struct RecordingUpdater {
        left: AtomicBool,
    }

    #[async_trait]
    impl VoiceStateUpdater for RecordingUpdater {
        async fn leave_voice(&self, _guild_id: GuildId) -> LinkResult<()> {
            self.left.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn gateway_for(server: &MockServer, updater: Arc<RecordingUpdater>) -> VoiceSignalGateway {
        let info = VoiceConnectInfo {
            guild_id: GuildId(1),
            user_id: UserId(2),
            session_id: "sess".into(),
            token: "tok".into(),
            endpoint: server.url.clone(),
        };
        let options = EngineOptions {
            shutdown_timeout: Duration::from_secs(1),
            ..EngineOptions::default()
        };
        let config = VoiceConfig {
            packet_interval_ms: 5,
            leave_timeout_ms: 1_000,
            ..VoiceConfig::default()
        };
        VoiceSignalGateway::new(info, config, options, updater)
    }

    #[test]
    fn test_url_forms() {
        let info = VoiceConnectInfo {
            guild_id: GuildId(1),
            user_id: UserId(2),
            session_id: String::new(),
            token: String::new(),
            endpoint: "media.example:443".into(),
        };
        let protocol = VoiceProtocol::new(info, VoiceConfig::default());
        assert_eq!(protocol.url(false), "wss://media.example:443/?v=8");
        assert_eq!(protocol.label(), "voice 1");
    }

    #[test]
    fn test_heartbeat_carries_seq_ack() {
        let info = VoiceConnectInfo {
            guild_id: GuildId(1),
            user_id: UserId(2),
            session_id: String::new(),
            token: String::new(),
            endpoint: String::new(),
        };
        let beat = VoiceProtocol::new(info, VoiceConfig::default()).heartbeat(Some(4));
        assert_eq!(beat.op, op::HEARTBEAT);
        assert_eq!(beat.d["seq_ack"], 4);
        assert!(beat.d["t"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_full_handshake_streams_and_leaves() {
        let mut server = MockServer::bind().await;
        let updater = Arc::new(RecordingUpdater::default());
        let gateway = gateway_for(&server, updater.clone());
        let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let media_port = media.local_addr().unwrap().port();

        let connecting = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.connect().await })
        };
        let mut peer = server.accept().await;
        peer.hello(op::HELLO, 45_000).await;
        let identify = peer.recv_op(op::IDENTIFY).await;
        assert_eq!(identify.d["server_id"], "1");
        assert_eq!(identify.d["session_id"], "sess");
        assert_eq!(identify.d["token"], "tok");

        peer.send(json!({
            "op": op::READY,
            "d": {
                "ssrc": 7,
                "ip": "127.0.0.1",
                "port": media_port,
                "modes": ["aead_aes256_gcm_rtpsize", "xsalsa20_poly1305_suffix", "xsalsa20_poly1305"],
            },
        }))
        .await;

        let mut buf = [0u8; 256];
        let (n, from) = media.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &build_discovery_request(7)[..]);
        let mut reply = [0u8; 74];
        reply[1] = 2;
        reply[3] = 70;
        reply[8..17].copy_from_slice(b"127.0.0.1");
        reply[72..].copy_from_slice(&from.port().to_be_bytes());
        media.send_to(&reply, from).await.unwrap();

        let select = peer.recv_op(op::SELECT_PROTOCOL).await;
        assert_eq!(select.d["protocol"], "udp");
        assert_eq!(select.d["data"]["mode"], "xsalsa20_poly1305");
        assert_eq!(select.d["data"]["port"], from.port());
        let secret_key = vec![9u8; 32];
        peer.send(json!({
            "op": op::SESSION_DESCRIPTION,
            "d": { "mode": "xsalsa20_poly1305", "secret_key": secret_key },
        }))
        .await;
        connecting.await.unwrap().unwrap();

        let params = gateway.parameters().unwrap();
        assert_eq!(params.ssrc, 7);
        assert_eq!(params.mode, EncryptionMode::XSalsa20Poly1305);
        assert_eq!(params.external.port(), from.port());

        let transport = gateway.transport().unwrap();
        assert!(!transport.is_listening());
        media.send_to(b"other member's audio", from).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.queued(), 0);
        drop(transport);

        let streamer = gateway.create_streamer().unwrap();
        streamer.enqueue([Bytes::from_static(b"frame")], false);
        let speaking = peer.recv_op(op::SPEAKING).await;
        assert_eq!(speaking.d["speaking"], 1);
        assert_eq!(speaking.d["ssrc"], 7);

        let n = tokio::time::timeout(Duration::from_secs(2), media.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            decrypt_packet(EncryptionMode::XSalsa20Poly1305, &[9; 32], &buf[..n]).unwrap(),
            b"frame"
        );
        let silent = peer.recv_op(op::SPEAKING).await;
        assert_eq!(silent.d["speaking"], 0);
        streamer.stop().await;

        let stopping = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(updater.left.load(Ordering::SeqCst));
        peer.close(4014).await;
        tokio::time::timeout(Duration::from_secs(3), stopping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gateway.engine().phase(), Phase::Disconnected);
        assert!(gateway.transport().is_none());
    }

    #[tokio::test]
    async fn test_no_shared_mode_fails_connect() {
        let mut server = MockServer::bind().await;
        let gateway = gateway_for(&server, Arc::new(RecordingUpdater::default()));

        let connecting = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.connect().await })
        };
        let mut peer = server.accept().await;
        peer.hello(op::HELLO, 45_000).await;
        peer.recv_op(op::IDENTIFY).await;
        peer.send(json!({
            "op": op::READY,
            "d": { "ssrc": 7, "ip": "127.0.0.1", "port": 9, "modes": ["aead_aes256_gcm_rtpsize"] },
        }))
        .await;

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)));
        assert_eq!(gateway.engine().phase(), Phase::Disconnected);
        gateway.engine().stop().await;
    }
}
