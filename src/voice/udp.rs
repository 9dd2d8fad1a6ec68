use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{
    cancel::within,
    errors::{LinkError, LinkResult},
};

pub const DISCOVERY_PACKET_LEN: usize = 74;
const DISCOVERY_REQUEST: u16 = 1;
const DISCOVERY_RESPONSE: u16 = 2;
const RECV_BUF_LEN: usize = 2048;
/// Datagrams held before the oldest are dropped.
pub const RECV_QUEUE_LEN: usize = 512;

/// 74-byte external address request for `ssrc`.
pub fn build_discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    BigEndian::write_u16(&mut packet[0..2], DISCOVERY_REQUEST);
    BigEndian::write_u16(&mut packet[2..4], (DISCOVERY_PACKET_LEN - 4) as u16);
    BigEndian::write_u32(&mut packet[4..8], ssrc);
    packet
}

/// Reads the NUL-terminated address at byte 8 and the port in the last two bytes.
pub fn parse_discovery_response(packet: &[u8]) -> LinkResult<SocketAddr> {
    if packet.len() < 10 {
        return Err(LinkError::protocol(format!(
            "discovery response too short: {} bytes",
            packet.len()
        )));
    }
    let kind = BigEndian::read_u16(&packet[0..2]);
    if kind != DISCOVERY_RESPONSE {
        return Err(LinkError::protocol(format!("unexpected discovery packet type {}", kind)));
    }

    let port_at = packet.len() - 2;
    let field = &packet[8..port_at];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let ip: IpAddr = std::str::from_utf8(&field[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| LinkError::protocol("discovery response carries no valid address"))?;
    let port = BigEndian::read_u16(&packet[port_at..]);
    Ok(SocketAddr::new(ip, port))
}

/// Connected datagram socket with a background receive buffer.
///
/// Datagrams are only read off the socket while listening is on; otherwise
/// they stay queued in the kernel. The buffer holds at most
/// [`RECV_QUEUE_LEN`] datagrams and drops the oldest when full.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    packets_rx: flume::Receiver<Bytes>,
    listening: watch::Sender<bool>,
    disposed: AtomicBool,
    cancel: CancellationToken,
    default_wait: Duration,
}

impl UdpTransport {
    pub async fn connect(remote: SocketAddr, default_wait: Duration) -> LinkResult<Self> {
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(remote).await?;
        let socket = Arc::new(socket);
        debug!("UDP transport {} -> {}", socket.local_addr()?, remote);

        let (packets_tx, packets_rx) = flume::bounded(RECV_QUEUE_LEN);
        let (listening, listening_rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        tokio::spawn(receive_loop(
            socket.clone(),
            packets_tx,
            packets_rx.clone(),
            listening_rx,
            cancel.clone(),
        ));

        Ok(Self {
            socket,
            remote,
            packets_rx,
            listening,
            disposed: AtomicBool::new(false),
            cancel,
            default_wait,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> LinkResult<SocketAddr> {
        self.ensure_alive()?;
        Ok(self.socket.local_addr()?)
    }

    pub fn is_listening(&self) -> bool {
        *self.listening.borrow()
    }

    pub fn set_listening(&self, on: bool) {
        self.listening.send_replace(on);
    }

    pub fn queued(&self) -> usize {
        self.packets_rx.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> LinkResult<()> {
        if self.is_disposed() {
            Err(LinkError::Disposed("udp transport"))
        } else {
            Ok(())
        }
    }

    /// Oldest buffered datagram, if any. Never blocks.
    pub fn get_next_packet(&self) -> LinkResult<Option<Bytes>> {
        self.ensure_alive()?;
        Ok(self.packets_rx.try_recv().ok())
    }

    /// Oldest buffered datagram, waiting up to `timeout` (or the default wait).
    pub async fn wait_for_next_packet(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LinkResult<Bytes> {
        self.ensure_alive()?;
        let limit = timeout.unwrap_or(self.default_wait);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LinkError::Disposed("udp transport")),
            packet = within(self.packets_rx.recv_async(), limit, cancel) => {
                packet?.map_err(|_| LinkError::Disposed("udp transport"))
            }
        }
    }

    pub async fn send(&self, datagram: &[u8]) -> LinkResult<usize> {
        self.ensure_alive()?;
        Ok(self.socket.send(datagram).await?)
    }

    /// Asks the media server which address and port it sees us on.
    ///
    /// Listening is switched on for the exchange and restored afterwards.
    pub async fn discover_external_address(
        &self,
        ssrc: u32,
        timeout: Duration,
    ) -> LinkResult<SocketAddr> {
        let was_listening = self.listening.send_replace(true);
        let result = self.exchange_discovery(ssrc, timeout).await;
        self.set_listening(was_listening);
        result
    }

    async fn exchange_discovery(&self, ssrc: u32, timeout: Duration) -> LinkResult<SocketAddr> {
        self.send(&build_discovery_request(ssrc)).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        let cancel = self.cancel.child_token();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return Err(LinkError::Timeout(timeout));
            }
            let packet = match self.wait_for_next_packet(Some(left), &cancel).await {
                Err(LinkError::Timeout(_)) => return Err(LinkError::Timeout(timeout)),
                other => other?,
            };
            match parse_discovery_response(&packet) {
                Ok(addr) => {
                    debug!("Discovered external address {}", addr);
                    return Ok(addr);
                }
                Err(e) => debug!("Skipping datagram during discovery: {}", e),
            }
        }
    }

    /// Stops the receive loop. Later calls fail with `Disposed`.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    packets: flume::Sender<Bytes>,
    overflow: flume::Receiver<Bytes>,
    mut listening: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        let on = *listening.borrow_and_update();
        if !on {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = listening.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = listening.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = socket.recv(&mut buf) => match received {
                Ok(n) => {
                    let mut packet = Bytes::copy_from_slice(&buf[..n]);
                    loop {
                        match packets.try_send(packet) {
                            Ok(()) => break,
                            Err(flume::TrySendError::Full(back)) => {
                                let _ = overflow.try_recv();
                                packet = back;
                            }
                            Err(flume::TrySendError::Disconnected(_)) => {
                                debug!("UDP receive loop stopped");
                                return;
                            }
                        }
                    }
                }
                // ICMP unreachable surfaces here on connected sockets
                Err(e) => {
                    warn!("UDP receive error: {}", e);
                    if tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
                        .await
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }
    }
    debug!("UDP receive loop stopped");
}
