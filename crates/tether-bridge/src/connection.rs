//! Per-client connection state owned by the registry while active.

use crate::correlation::Correlator;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tether_core::{
    BridgeError, CommandAck, ServerConfig, ServerMessage, ToolDescriptor, ToolRegistration,
    ToolResult,
};
use tokio::sync::{mpsc, watch};

/// One registered client.
pub struct Connection {
    pub client_id: String,
    pub user_id: String,
    pub client_version: String,
    pub platform: String,
    pub servers: Vec<ServerConfig>,
    pub tools: Vec<ToolDescriptor>,
    pub connected_at: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,
    outbound: Mutex<Option<mpsc::Sender<ServerMessage>>>,
    stop: watch::Sender<bool>,
    closed: AtomicBool,
    pub pending_results: Correlator<ToolResult>,
    pub pending_commands: Correlator<CommandAck>,
}

/// Receiving ends handed to the writer loop.
#[derive(Debug)]
pub struct WriterHandles {
    pub outbound: mpsc::Receiver<ServerMessage>,
    pub stop: watch::Receiver<bool>,
}

impl Connection {
    pub(crate) fn new(user_id: &str, registration: ToolRegistration, capacity: usize) -> (Self, WriterHandles) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let now = Utc::now();
        let conn = Self {
            client_id: registration.client_id,
            user_id: user_id.to_string(),
            client_version: registration.client_version,
            platform: registration.platform,
            servers: registration.servers,
            tools: registration.tools,
            connected_at: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            outbound: Mutex::new(Some(tx)),
            stop: stop_tx,
            closed: AtomicBool::new(false),
            pending_results: Correlator::new(),
            pending_commands: Correlator::new(),
        };
        (
            conn,
            WriterHandles {
                outbound: rx,
                stop: stop_rx,
            },
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<ServerMessage>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Places `msg` on the outbound queue, waiting at most `timeout` for room.
    pub async fn enqueue(&self, msg: ServerMessage, timeout: Duration) -> Result<(), BridgeError> {
        let tx = self.sender().ok_or(BridgeError::ConnectionClosed)?;
        tx.send_timeout(msg, timeout).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => BridgeError::QueueFull(self.client_id.clone()),
            mpsc::error::SendTimeoutError::Closed(_) => BridgeError::ConnectionClosed,
        })
    }

    /// Non-blocking enqueue for fire-and-forget pushes.
    pub fn try_enqueue(&self, msg: ServerMessage) -> Result<(), BridgeError> {
        let tx = self.sender().ok_or(BridgeError::ConnectionClosed)?;
        tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull(self.client_id.clone()),
            mpsc::error::TrySendError::Closed(_) => BridgeError::ConnectionClosed,
        })
    }

    pub fn touch(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        let ms = self.last_heartbeat_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.connected_at)
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    /// Resolves to `true` once the connection is torn down.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.pending_results.len() + self.pending_commands.len()
    }

    /// Teardown in order: close the queue, fire stop, release correlation
    /// waiters. Returns false if the connection was already shut down.
    pub(crate) fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let _ = self.stop.send(true);
        self.pending_results.close();
        self.pending_commands.close();
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("user_id", &self.user_id)
            .field("platform", &self.platform)
            .field("tools", &self.tools.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
