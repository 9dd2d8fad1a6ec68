use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    common::{
        errors::{LinkError, LinkResult},
        types::{ChannelId, GuildId, UserId, parse_snowflake},
    },
    configs::{Config, GatewayConfig, VoiceConfig},
    gateway::{
        constants::{SESSION_GATEWAY_VERSION, SESSION_RESPECTED_CLOSE_CODES},
        engine::{EngineOptions, GatewayEngine, GatewayProtocol},
        listeners::{EventWait, ListenerFilter, ListenerHandle},
        opcodes::session as op,
        types::{GatewayPayload, HandshakeKind, Phase},
    },
    voice::{VoiceConnectInfo, VoiceSignalGateway, VoiceStateUpdater},
};

/// Identify/resume flavour of the engine for the main event stream.
pub struct SessionProtocol {
    token: String,
    shard: [u32; 2],
    intents: u64,
    url: String,
    resume_url: RwLock<Option<String>>,
    user_id: RwLock<Option<UserId>>,
}

impl SessionProtocol {
    fn new(config: &GatewayConfig, url: String) -> Self {
        Self {
            token: config.token.clone(),
            shard: [config.shard_id, config.shard_count.max(1)],
            intents: config.intents,
            url,
            resume_url: RwLock::new(None),
            user_id: RwLock::new(None),
        }
    }

    pub fn identify_payload(&self) -> Value {
        json!({
            "token": self.token,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "gatelink",
                "device": "gatelink",
            },
            "shard": self.shard,
            "intents": self.intents,
        })
    }

    pub fn resume_payload(&self, session_id: &str, sequence: Option<u64>) -> Value {
        json!({
            "token": self.token,
            "session_id": session_id,
            "seq": sequence,
        })
    }

    fn store_ready(&self, engine: &GatewayEngine, ready: &GatewayPayload) -> LinkResult<()> {
        let session_id = ready.d["session_id"]
            .as_str()
            .ok_or_else(|| LinkError::protocol("READY without session_id"))?;
        engine.set_session_id(session_id);

        if let Some(url) = ready.d["resume_gateway_url"].as_str() {
            *self.resume_url.write() = Some(url.to_owned());
        }
        let user_id = parse_snowflake(&ready.d["user"]["id"]).map(UserId);
        *self.user_id.write() = user_id;

        info!(
            "[{}] READY: session {}, user {:?}",
            engine.label(),
            session_id,
            user_id
        );
        Ok(())
    }
}

#[async_trait]
impl GatewayProtocol for SessionProtocol {
    fn label(&self) -> String {
        format!("shard {}/{}", self.shard[0], self.shard[1])
    }

    fn url(&self, resume: bool) -> String {
        let base = if resume {
            self.resume_url.read().clone().unwrap_or_else(|| self.url.clone())
        } else {
            self.url.clone()
        };
        format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            SESSION_GATEWAY_VERSION
        )
    }

    fn hello_op(&self) -> u8 {
        op::HELLO
    }

    fn heartbeat_ack_op(&self) -> u8 {
        op::HEARTBEAT_ACK
    }

    fn respected_close_codes(&self) -> &[u16] {
        SESSION_RESPECTED_CLOSE_CODES
    }

    fn heartbeat(&self, sequence: Option<u64>) -> GatewayPayload {
        GatewayPayload::new(op::HEARTBEAT, json!(sequence))
    }

    async fn handshake(&self, engine: &GatewayEngine, kind: HandshakeKind) -> LinkResult<()> {
        match (kind, engine.session_id()) {
            (HandshakeKind::Resume, Some(session_id)) => {
                debug!("[{}] Resuming session {}", engine.label(), session_id);
                let payload = self.resume_payload(&session_id, engine.sequence());
                engine
                    .listen_for_event_after(
                        EventWait::event(op::DISPATCH, "RESUMED"),
                        engine.send(op::RESUME, payload),
                    )
                    .await?;
                info!("[{}] Session resumed", engine.label());
                Ok(())
            }
            _ => {
                let ready = engine
                    .listen_for_event_after(
                        EventWait::event(op::DISPATCH, "READY"),
                        engine.send(op::IDENTIFY, self.identify_payload()),
                    )
                    .await?;
                self.store_ready(engine, &ready)
            }
        }
    }
}

/// One shard of the event-stream connection.
#[derive(Clone)]
pub struct SessionGateway {
    engine: Arc<GatewayEngine>,
    protocol: Arc<SessionProtocol>,
    voice_config: VoiceConfig,
    options: EngineOptions,
}

impl SessionGateway {
    pub fn from_config(config: &Config, url: impl Into<String>) -> Self {
        Self::new(
            &config.gateway,
            config.voice.clone(),
            url,
            EngineOptions::from(&config.gateway),
        )
    }

    pub fn new(
        gateway: &GatewayConfig,
        voice_config: VoiceConfig,
        url: impl Into<String>,
        options: EngineOptions,
    ) -> Self {
        let protocol = Arc::new(SessionProtocol::new(gateway, url.into()));
        let engine = GatewayEngine::new(protocol.clone(), options.clone());
        install_control_listeners(&engine);
        Self {
            engine,
            protocol,
            voice_config,
            options,
        }
    }

    pub fn engine(&self) -> &Arc<GatewayEngine> {
        &self.engine
    }

    /// Connects and keeps the connection alive until [`stop`](Self::stop).
    pub async fn connect(&self) -> LinkResult<()> {
        self.engine.start(true).await
    }

    pub async fn stop(&self) {
        self.engine.stop().await
    }

    pub async fn wait_until_ready(&self, timeout: Duration) -> LinkResult<()> {
        self.engine.wait_for_phase(Phase::Ready, timeout).await
    }

    pub fn user_id(&self) -> Option<UserId> {
        *self.protocol.user_id.read()
    }

    pub fn add_listener<F, Fut>(&self, filter: ListenerFilter, handler: F) -> ListenerHandle
    where
        F: Fn(GatewayPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = LinkResult<()>> + Send + 'static,
    {
        self.engine.add_listener(filter, handler)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.engine.remove_listener(handle)
    }

    pub async fn listen_for_event(&self, wait: EventWait) -> LinkResult<GatewayPayload> {
        self.engine.listen_for_event(wait).await
    }

    pub async fn send(&self, op: u8, d: Value) -> LinkResult<()> {
        self.engine.send(op, d).await
    }

    pub async fn update_presence(&self, status: &str, activity: Option<Value>) -> LinkResult<()> {
        self.send(
            op::STATUS_UPDATE,
            json!({
                "since": null,
                "activities": activity.into_iter().collect::<Vec<_>>(),
                "status": status,
                "afk": false,
            }),
        )
        .await
    }

    /// Joins, moves between or (with `channel_id: None`) leaves voice channels.
    pub async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_mute: bool,
        self_deaf: bool,
    ) -> LinkResult<()> {
        self.send(
            op::VOICE_STATE_UPDATE,
            json!({
                "guild_id": guild_id.to_string(),
                "channel_id": channel_id.map(|c| c.to_string()),
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
        .await
    }

    pub async fn request_guild_members(
        &self,
        guild_id: GuildId,
        query: &str,
        limit: u32,
    ) -> LinkResult<()> {
        self.send(
            op::REQUEST_GUILD_MEMBERS,
            json!({
                "guild_id": guild_id.to_string(),
                "query": query,
                "limit": limit,
            }),
        )
        .await
    }

    /// Asks to join `channel_id` and brings up the voice signaling connection
    /// from the two dispatches the platform answers with.
    pub async fn join_voice(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> LinkResult<VoiceSignalGateway> {
        let user_id = self
            .user_id()
            .ok_or_else(|| LinkError::protocol("session is not ready"))?;

        let state_wait = self.engine.register_wait(
            EventWait::event(op::DISPATCH, "VOICE_STATE_UPDATE").validate(move |p| {
                parse_snowflake(&p.d["guild_id"]) == Some(guild_id.0)
                    && parse_snowflake(&p.d["user_id"]) == Some(user_id.0)
            }),
        );
        let server_wait = self.engine.register_wait(
            EventWait::event(op::DISPATCH, "VOICE_SERVER_UPDATE").validate(move |p| {
                parse_snowflake(&p.d["guild_id"]) == Some(guild_id.0) && p.d["endpoint"].is_string()
            }),
        );

        self.update_voice_state(guild_id, Some(channel_id), self_mute, self_deaf)
            .await?;
        let (state, server) = tokio::try_join!(state_wait.recv(), server_wait.recv())?;

        let field = |payload: &GatewayPayload, name: &str| {
            payload.d[name]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| LinkError::protocol(format!("voice update without {}", name)))
        };
        let info = VoiceConnectInfo {
            guild_id,
            user_id,
            session_id: field(&state, "session_id")?,
            token: field(&server, "token")?,
            endpoint: field(&server, "endpoint")?,
        };
        info!(
            "[{}] Voice server for guild {} is {}",
            self.engine.label(),
            guild_id,
            info.endpoint
        );

        let voice = VoiceSignalGateway::new(
            info,
            self.voice_config.clone(),
            self.options.clone(),
            Arc::new(self.clone()),
        );
        voice.connect().await?;
        Ok(voice)
    }
}

#[async_trait]
impl VoiceStateUpdater for SessionGateway {
    async fn leave_voice(&self, guild_id: GuildId) -> LinkResult<()> {
        self.update_voice_state(guild_id, None, false, false).await
    }
}

/// Reconnect, invalid-session and server-requested heartbeat handling.
fn install_control_listeners(engine: &Arc<GatewayEngine>) {
    let weak = Arc::downgrade(engine);
    engine.add_listener(ListenerFilter::op(op::RECONNECT), move |_| {
        let weak = weak.clone();
        async move {
            if let Some(engine) = weak.upgrade() {
                engine.request_reconnect(true);
            }
            Ok(())
        }
    });

    let weak = Arc::downgrade(engine);
    engine.add_listener(ListenerFilter::op(op::INVALID_SESSION), move |payload| {
        let weak = weak.clone();
        async move {
            if let Some(engine) = weak.upgrade() {
                warn!(
                    "[{}] Invalid session (resumable={}), identifying again",
                    engine.label(),
                    payload.d.as_bool().unwrap_or(false)
                );
                engine.request_reconnect(false);
            }
            Ok(())
        }
    });

    let weak = Arc::downgrade(engine);
    engine.add_listener(ListenerFilter::op(op::HEARTBEAT), move |_| {
        let weak = weak.clone();
        async move {
            match weak.upgrade() {
                Some(engine) => engine.send_heartbeat().await,
                None => Ok(()),
            }
        }
    });
}
