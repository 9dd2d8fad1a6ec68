use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::{net::TcpStream, sync::{mpsc, oneshot, watch}};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    common::{
        cancel::{or_cancel, sleep_or_cancel, within},
        errors::{LinkError, LinkResult},
    },
    configs::GatewayConfig,
    gateway::{
        backoff::Backoff,
        constants::{
            CLOSE_CODE_NORMAL, CLOSE_CODE_RESUME, MAX_HEARTBEAT_INTERVAL, MAX_RECONNECT_DELAY,
            SEND_WINDOW,
        },
        heartbeat::{self, HeartbeatState},
        listeners::{
            EventWait, Listener, ListenerFilter, ListenerFuture, ListenerHandle, ListenerRegistry,
        },
        send_gate::SendGate,
        types::{ConnectionState, Disconnect, GatewayPayload, HandshakeKind, Phase, Signal},
    },
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// The parts of the handshake that differ between the event stream and the
/// voice signaling connection.
#[async_trait]
pub trait GatewayProtocol: Send + Sync + 'static {
    /// Prefix for log lines.
    fn label(&self) -> String;

    fn url(&self, resume: bool) -> String;

    fn hello_op(&self) -> u8;

    fn heartbeat_ack_op(&self) -> u8;

    /// Close codes that mean the remote ended the session on purpose.
    fn respected_close_codes(&self) -> &[u16];

    fn heartbeat(&self, sequence: Option<u64>) -> GatewayPayload;

    /// Runs after Hello, with heartbeating already going. Returns once the
    /// session is usable.
    async fn handshake(&self, engine: &GatewayEngine, kind: HandshakeKind) -> LinkResult<()>;
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_sends_per_window: usize,
    pub send_window: Duration,
    pub heartbeat_ack_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub shutdown_timeout: Duration,
    pub listen_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for EngineOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_sends_per_window: config.max_sends_per_minute,
            send_window: SEND_WINDOW,
            heartbeat_ack_timeout: config.heartbeat_ack_timeout(),
            reconnect_delay: config.reconnect_delay(),
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            shutdown_timeout: config.shutdown_timeout(),
            listen_timeout: config.listen_timeout(),
        }
    }
}

struct Connection {
    generation: u64,
    cancel: CancellationToken,
    close_code: Arc<AtomicU16>,
}

/// A wait registered with the engine. Dropping it deregisters the listener.
pub struct PendingEvent {
    registry: Arc<ListenerRegistry>,
    handle: ListenerHandle,
    rx: oneshot::Receiver<GatewayPayload>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl PendingEvent {
    pub async fn recv(mut self) -> LinkResult<GatewayPayload> {
        match within(&mut self.rx, self.timeout, &self.cancel).await? {
            Ok(payload) => Ok(payload),
            Err(_) => Err(LinkError::Cancelled),
        }
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        self.registry.remove(self.handle);
    }
}

/// Reconnecting WebSocket driver shared by both gateway flavours.
///
/// Owns the socket, the heartbeat loop, the listener table and the outbound
/// send gate. A supervisor task reacts to connection loss: it resumes when a
/// session is held, identifies afresh otherwise, and stops when the remote
/// closes with a respected code.
pub struct GatewayEngine {
    protocol: Arc<dyn GatewayProtocol>,
    options: EngineOptions,
    label: String,
    state: RwLock<ConnectionState>,
    phase: watch::Sender<Phase>,
    listeners: Arc<ListenerRegistry>,
    gate: SendGate,
    heartbeat: HeartbeatState,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
    persist: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl GatewayEngine {
    pub fn new(protocol: Arc<dyn GatewayProtocol>, options: EngineOptions) -> Arc<Self> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(Phase::Disconnected);
        Arc::new(Self {
            label: protocol.label(),
            gate: SendGate::new(options.max_sends_per_window, options.send_window),
            protocol,
            options,
            state: RwLock::new(ConnectionState::default()),
            phase,
            listeners: Arc::new(ListenerRegistry::default()),
            heartbeat: HeartbeatState::default(),
            outbound: Mutex::new(None),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            persist: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.state.read().sequence
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.state.write().session_id = Some(session_id.into());
    }

    pub fn is_ready(&self) -> bool {
        self.state.read().ready
    }

    pub fn latency(&self) -> Option<Duration> {
        self.heartbeat.latency()
    }

    pub(crate) fn heartbeat(&self) -> &HeartbeatState {
        &self.heartbeat
    }

    pub fn set_persist(&self, persist: bool) {
        self.persist.store(persist, Ordering::SeqCst);
    }

    /// Waits until the engine reaches `target`.
    pub async fn wait_for_phase(&self, target: Phase, timeout: Duration) -> LinkResult<()> {
        let mut rx = self.phase.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|p| *p == target))
            .await
            .map_err(|_| LinkError::Timeout(timeout))?
            .map(|_| ())
            .map_err(|_| LinkError::Disposed("gateway engine"))
    }

    /// Connects and completes the handshake. With `persist`, unexpected
    /// closures afterwards are recovered by reconnecting.
    pub async fn start(self: &Arc<Self>, persist: bool) -> LinkResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed("gateway engine"));
        }
        let signals = self
            .signals_rx
            .lock()
            .take()
            .ok_or_else(|| LinkError::protocol("gateway engine already started"))?;
        self.set_persist(persist);

        let kind = if self.session_id().is_some() {
            HandshakeKind::Resume
        } else {
            HandshakeKind::Identify
        };
        if let Err(e) = self.open(kind).await {
            error!("[{}] Connect failed: {}", self.label, e);
            self.close_connection(CLOSE_CODE_NORMAL);
            self.set_phase(Phase::Disconnected);
            *self.signals_rx.lock() = Some(signals);
            return Err(e);
        }

        let engine = self.clone();
        self.tasks.spawn(async move { engine.supervise(signals).await });
        Ok(())
    }

    /// Closes the connection and waits, bounded, for every background task.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] Stopping gateway", self.label);
        self.set_persist(false);
        self.set_phase(Phase::Closing);
        self.close_connection(CLOSE_CODE_NORMAL);
        self.shutdown.cancel();
        self.tasks.close();

        let bound = self.options.shutdown_timeout;
        if tokio::time::timeout(bound, self.tasks.wait()).await.is_err() {
            warn!(
                "[{}] {} background task(s) still running after {:?}, abandoning them",
                self.label,
                self.tasks.len(),
                bound
            );
        }
        *self.outbound.lock() = None;
        self.set_phase(Phase::Disconnected);
    }

    pub fn add_listener<F, Fut>(&self, filter: ListenerFilter, handler: F) -> ListenerHandle
    where
        F: Fn(GatewayPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<()>> + Send + 'static,
    {
        let listener: Listener =
            Arc::new(move |payload| -> ListenerFuture { Box::pin(handler(payload)) });
        self.listeners.add(filter, listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Registers a one-shot wait right away; await it with [`PendingEvent::recv`].
    ///
    /// The wait is cancelled with the connection it was registered on, or
    /// with the engine when no connection is up.
    pub fn register_wait(&self, wait: EventWait) -> PendingEvent {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let validator = wait.validator.clone();
        let listener: Listener = Arc::new(move |payload: GatewayPayload| -> ListenerFuture {
            let slot = slot.clone();
            let validator = validator.clone();
            Box::pin(async move {
                if validator.as_ref().is_none_or(|v| v(&payload)) {
                    if let Some(tx) = slot.lock().take() {
                        let _ = tx.send(payload);
                    }
                }
                Ok(())
            })
        });
        let cancel = self
            .connection
            .lock()
            .as_ref()
            .map(|c| c.cancel.clone())
            .unwrap_or_else(|| self.shutdown.clone());

        PendingEvent {
            handle: self.listeners.add(wait.filter, listener),
            registry: self.listeners.clone(),
            rx,
            timeout: wait.timeout.unwrap_or(self.options.listen_timeout),
            cancel,
        }
    }

    pub async fn listen_for_event(&self, wait: EventWait) -> LinkResult<GatewayPayload> {
        self.register_wait(wait).recv().await
    }

    /// Like [`listen_for_event`](Self::listen_for_event), but runs `trigger`
    /// after the listener is in place so its reply cannot be missed.
    pub async fn listen_for_event_after<Fut>(
        &self,
        wait: EventWait,
        trigger: Fut,
    ) -> LinkResult<GatewayPayload>
    where
        Fut: Future<Output = LinkResult<()>>,
    {
        let pending = self.register_wait(wait);
        trigger.await?;
        pending.recv().await
    }

    pub async fn send(&self, op: u8, d: Value) -> LinkResult<()> {
        self.send_payload(GatewayPayload::new(op, d)).await
    }

    /// Writes one frame once the send-rate gate lets it through.
    pub async fn send_payload(&self, payload: GatewayPayload) -> LinkResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed("gateway engine"));
        }
        self.gate.acquire(&self.shutdown).await?;
        let text = serde_json::to_string(&payload)?;
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or(LinkError::Disposed("gateway connection"))?;
        debug!("[{}] >> op {}", self.label, payload.op);
        tx.send(Message::Text(text.into()))
            .map_err(|_| LinkError::Disposed("gateway connection"))
    }

    pub async fn send_heartbeat(&self) -> LinkResult<()> {
        let payload = self.protocol.heartbeat(self.sequence());
        self.heartbeat.begin();
        self.send_payload(payload).await
    }

    /// Asks the supervisor for a new connection. Without `resume` the
    /// session is discarded first.
    pub fn request_reconnect(&self, resume: bool) {
        if !resume {
            *self.state.write() = ConnectionState::default();
        }
        let generation = self.generation.load(Ordering::SeqCst);
        info!(
            "[{}] Reconnect requested (resume={})",
            self.label, resume
        );
        self.signal(generation, Disconnect::Reconnect { resume });
        // unblock a handshake that is still waiting on this connection
        if let Some(connection) = self.connection.lock().as_ref() {
            if connection.generation == generation {
                let code = if resume { CLOSE_CODE_RESUME } else { CLOSE_CODE_NORMAL };
                connection.close_code.store(code, Ordering::SeqCst);
                connection.cancel.cancel();
            }
        }
    }

    pub(crate) fn signal(&self, generation: u64, reason: Disconnect) {
        let _ = self.signals_tx.send(Signal { generation, reason });
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn close_connection(&self, code: u16) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close_code.store(code, Ordering::SeqCst);
            connection.cancel.cancel();
        }
        *self.outbound.lock() = None;
        self.state.write().ready = false;
    }

    async fn open(self: &Arc<Self>, kind: HandshakeKind) -> LinkResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_phase(Phase::Connecting);

        let url = self.protocol.url(kind == HandshakeKind::Resume);
        debug!("[{}] Connecting to {}", self.label, url);
        let (ws, _) = or_cancel(tokio_tungstenite::connect_async(url.as_str()), &self.shutdown)
            .await??;
        let (write, read) = ws.split();

        let cancel = self.shutdown.child_token();
        let close_code = Arc::new(AtomicU16::new(CLOSE_CODE_RESUME));
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        if let Some(old) = self.connection.lock().replace(Connection {
            generation,
            cancel: cancel.clone(),
            close_code: close_code.clone(),
        }) {
            old.cancel.cancel();
        }

        self.tasks.spawn(write_loop(
            write,
            rx,
            cancel.clone(),
            close_code,
            self.label.clone(),
        ));

        self.set_phase(Phase::AwaitingHello);
        let hello = self.register_wait(EventWait::op(self.protocol.hello_op()));
        let engine = self.clone();
        let reader_cancel = cancel.clone();
        self.tasks
            .spawn(async move { engine.read_loop(read, generation, reader_cancel).await });

        let hello = hello
            .recv()
            .await
            .map_err(|e| self.lost_if_closed(e, &cancel))?;
        let interval = hello.d["heartbeat_interval"]
            .as_f64()
            .and_then(|ms| Duration::try_from_secs_f64(ms / 1_000.0).ok())
            .filter(|interval| !interval.is_zero())
            .map(|interval| interval.min(MAX_HEARTBEAT_INTERVAL))
            .ok_or_else(|| LinkError::protocol("hello without a usable heartbeat_interval"))?;
        self.state.write().heartbeat_interval = Some(interval);
        debug!("[{}] Heartbeat interval set to {:?}", self.label, interval);

        self.tasks.spawn(heartbeat::run(
            self.clone(),
            generation,
            interval,
            cancel.clone(),
        ));

        self.set_phase(Phase::Handshaking(kind));
        self.protocol
            .handshake(self, kind)
            .await
            .map_err(|e| self.lost_if_closed(e, &cancel))?;

        {
            let mut state = self.state.write();
            state.ready = true;
            state.should_resume = false;
        }
        self.set_phase(Phase::Ready);
        info!("[{}] Gateway ready ({:?})", self.label, kind);
        Ok(())
    }

    /// A wait cancelled because the socket went away, rather than by `stop`.
    fn lost_if_closed(&self, error: LinkError, cancel: &CancellationToken) -> LinkError {
        match error {
            LinkError::Cancelled if cancel.is_cancelled() && !self.shutdown.is_cancelled() => {
                LinkError::protocol("connection closed before the handshake completed")
            }
            other => other,
        }
    }

    async fn read_loop(self: Arc<Self>, mut read: WsRead, generation: u64, cancel: CancellationToken) {
        let reason = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = read.next() => msg,
            };
            match msg {
                Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|cf| (Some(u16::from(cf.code)), cf.reason.as_str().to_owned()))
                        .unwrap_or((None, String::new()));
                    break Disconnect::Closed { code, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[{}] WS read error: {}", self.label, e);
                    break Disconnect::Closed {
                        code: None,
                        reason: e.to_string(),
                    };
                }
                None => {
                    break Disconnect::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    };
                }
            }
        };
        // fails any wait still pending on this connection
        cancel.cancel();
        self.signal(generation, reason);
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        let payload: GatewayPayload = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                warn!("[{}] Failed to parse gateway message: {}", self.label, e);
                return;
            }
        };
        debug!(
            "[{}] << op {} {}",
            self.label,
            payload.op,
            payload.event_name().unwrap_or_default()
        );

        // before fan-out, so anything sent from here on carries it
        if let Some(seq) = payload.s {
            self.state.write().sequence = Some(seq);
        }
        if payload.op == self.protocol.heartbeat_ack_op() {
            self.heartbeat.acknowledge();
        }

        for listener in self.listeners.matching(&payload) {
            let payload = payload.clone();
            let label = self.label.clone();
            let shutdown = self.shutdown.clone();
            self.tasks.spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = listener(payload) => {
                        if let Err(e) = result {
                            warn!("[{}] Listener failed: {}", label, e);
                        }
                    }
                }
            });
        }
    }

    async fn supervise(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<Signal>) {
        let mut backoff = Backoff::new(self.options.reconnect_delay, self.options.max_reconnect_delay);

        'outer: loop {
            let signal = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };
            if signal.generation != self.current_generation() {
                debug!("[{}] Ignoring stale {:?}", self.label, signal.reason);
                continue;
            }

            let resume = match signal.reason {
                Disconnect::Closed { code, reason } => {
                    info!(
                        "[{}] Connection closed: code={:?}, reason='{}'",
                        self.label, code, reason
                    );
                    if !self.persist.load(Ordering::SeqCst) {
                        self.close_connection(CLOSE_CODE_NORMAL);
                        break;
                    }
                    if code.is_some_and(|c| self.protocol.respected_close_codes().contains(&c)) {
                        warn!(
                            "[{}] Remote ended the session (code {:?}), not resuming",
                            self.label, code
                        );
                        self.close_connection(CLOSE_CODE_NORMAL);
                        *self.state.write() = ConnectionState::default();
                        break;
                    }
                    true
                }
                Disconnect::HeartbeatTimeout => true,
                Disconnect::Reconnect { resume } => resume,
            };

            self.close_connection(if resume { CLOSE_CODE_RESUME } else { CLOSE_CODE_NORMAL });
            if resume {
                self.state.write().should_resume = true;
            } else {
                *self.state.write() = ConnectionState::default();
            }
            self.set_phase(Phase::Reconnecting);
            if sleep_or_cancel(self.options.reconnect_delay, &self.shutdown)
                .await
                .is_err()
            {
                break;
            }

            loop {
                let kind = if self.session_id().is_some() {
                    HandshakeKind::Resume
                } else {
                    HandshakeKind::Identify
                };
                match self.open(kind).await {
                    Ok(()) => {
                        backoff.reset();
                        break;
                    }
                    Err(_) if self.shutdown.is_cancelled() => break 'outer,
                    Err(e) if e.is_fatal() => {
                        error!("[{}] Giving up on reconnect: {}", self.label, e);
                        self.close_connection(CLOSE_CODE_NORMAL);
                        break 'outer;
                    }
                    Err(e) => {
                        self.close_connection(CLOSE_CODE_RESUME);
                        self.set_phase(Phase::Reconnecting);
                        let delay = backoff.next();
                        warn!(
                            "[{}] Reconnect attempt failed: {}. Retrying in {:?}",
                            self.label, e, delay
                        );
                        if sleep_or_cancel(delay, &self.shutdown).await.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        if !self.shutdown.is_cancelled() {
            self.set_phase(Phase::Disconnected);
        }
    }
}

async fn write_loop(
    mut write: WsWrite,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
    close_code: Arc<AtomicU16>,
    label: String,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                if let Err(e) = write.send(msg).await {
                    warn!("[{}] WS write error: {}", label, e);
                    return;
                }
            }
        }
    }
    let frame = CloseFrame {
        code: CloseCode::from(close_code.load(Ordering::SeqCst)),
        reason: Default::default(),
    };
    match tokio::time::timeout(
        Duration::from_millis(500),
        write.send(Message::Close(Some(frame))),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("[{}] Close frame not sent: {}", label, e),
        Err(_) => debug!("[{}] Close frame timed out", label),
    }
}
