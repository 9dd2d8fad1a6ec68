//! Loopback WebSocket server for driving the engines in tests.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};

use crate::gateway::types::GatewayPayload;

const STEP: Duration = Duration::from_secs(5);

pub(crate) struct MockServer {
    pub url: String,
    accepted: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(MockPeer { ws }).is_err() {
                        break;
                    }
                }
            }
        });
        Self { url, accepted }
    }

    pub async fn accept(&mut self) -> MockPeer {
        tokio::time::timeout(STEP, self.accepted.recv())
            .await
            .expect("no client connected")
            .expect("listener gone")
    }
}

pub(crate) struct MockPeer {
    ws: WebSocketStream<TcpStream>,
}

impl MockPeer {
    pub async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn hello(&mut self, op: u8, interval_ms: u64) {
        self.send(serde_json::json!({"op": op, "d": {"heartbeat_interval": interval_ms}}))
            .await;
    }

    /// Next payload with opcode `op`, skipping anything else.
    pub async fn recv_op(&mut self, op: u8) -> GatewayPayload {
        tokio::time::timeout(STEP, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let payload: GatewayPayload = serde_json::from_str(text.as_str()).unwrap();
                        if payload.op == op {
                            return payload;
                        }
                    }
                    Some(Ok(_)) => {}
                    other => panic!("connection ended while waiting for op {}: {:?}", op, other),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("op {} never arrived", op))
    }

    /// Waits for the client's close frame and returns its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        tokio::time::timeout(STEP, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                    Some(Ok(_)) => {}
                    _ => return None,
                }
            }
        })
        .await
        .unwrap_or(None)
    }

    pub async fn close(&mut self, code: u16) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: Default::default(),
            }))
            .await;
    }
}
