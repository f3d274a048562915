//! Frame-level transport seam. The gateway adapts a WebSocket to these
//! traits; tests use the in-memory pair below.

use async_trait::async_trait;
use tether_core::BridgeError;
use tokio::sync::mpsc;

/// What the bridge sees of the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Liveness probe from the peer.
    Ping,
    /// Answer to one of our probes.
    Pong,
    Close,
}

/// Inbound half of a physical connection.
#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, BridgeError>>;
}

/// Outbound half of a physical connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError>;
    async fn send_ping(&mut self) -> Result<(), BridgeError>;
    async fn close(&mut self) -> Result<(), BridgeError>;
}

/// Creates a connected in-memory transport: the bridge side
/// (`MemorySource`, `MemorySink`) and the peer that plays the client.
pub fn memory_transport() -> (MemorySource, MemorySink, MemoryPeer) {
    let (to_bridge, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_bridge) = mpsc::unbounded_channel();
    (
        MemorySource { rx: from_peer },
        MemorySink { tx: to_peer },
        MemoryPeer {
            tx: Some(to_bridge),
            rx: from_bridge,
        },
    )
}

pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Result<Frame, BridgeError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame, BridgeError>> {
        self.rx.recv().await
    }
}

pub struct MemorySink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl MemorySink {
    fn push(&self, frame: Frame) -> Result<(), BridgeError> {
        self.tx
            .send(frame)
            .map_err(|_| BridgeError::Transport("peer closed".to_string()))
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        self.push(Frame::Text(text))
    }

    async fn send_ping(&mut self) -> Result<(), BridgeError> {
        self.push(Frame::Ping)
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        self.push(Frame::Close)
    }
}

/// The client end of an in-memory transport.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Result<Frame, BridgeError>>>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Ok(Frame::Text(text.into())))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send_pong(&self) -> bool {
        self.send(Ok(Frame::Pong))
    }

    /// Injects a read error on the bridge side.
    pub fn fail(&self, reason: &str) -> bool {
        self.send(Err(BridgeError::Transport(reason.to_string())))
    }

    /// Drops the inbound half so the bridge reads end-of-stream.
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    fn send(&self, item: Result<Frame, BridgeError>) -> bool {
        self.tx.as_ref().map(|tx| tx.send(item).is_ok()).unwrap_or(false)
    }

    /// Next frame the bridge wrote, `None` once the bridge sink is dropped.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next text frame, skipping pings, decoded as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => return None,
                Frame::Ping | Frame::Pong => continue,
            }
        }
    }
}
